//! Run worker
//!
//! Consumes `process_run` messages: checks the integration is still live,
//! resolves the platform service and either seeds root streams via
//! `generate_streams` or, for a run that already has streams, re-drives its
//! pending streams without re-seeding.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::context::RunContext;
use crate::error::{PipelineError, StepError, locations};
use crate::models::WorkState;
use crate::platforms::Registry;
use crate::queue::{PipelineMessage, QueueClient, QueueName};
use crate::repositories::{RunRepository, StreamRepository};
use crate::workers::MessageProcessor;

pub struct RunWorker {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn QueueClient>,
    registry: Arc<Registry>,
    cache: CacheStore,
}

impl RunWorker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            cache: CacheStore::new(db.clone()),
            db,
            queue,
            registry,
        }
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn process_run(&self, run_id: Uuid) -> Result<(), PipelineError> {
        let runs = RunRepository::new(self.db.clone());

        let Some((run, integration)) = runs.find_with_integration(run_id).await? else {
            warn!("run not found, dropping message");
            return Ok(());
        };

        if run.state.is_terminal() {
            debug!(state = ?run.state, "run already terminal, nothing to do");
            return Ok(());
        }

        let Some(integration) = integration.filter(|i| i.deleted_at.is_none()) else {
            runs.mark_error(
                run.id,
                &StepError::new(
                    locations::RUN_CHECK_INTEGRATION,
                    "integration does not exist or has been deleted",
                ),
            )
            .await?;
            return Ok(());
        };

        let service = match self.registry.get(&integration.platform) {
            Ok(service) => service,
            Err(err) => {
                runs.mark_error(
                    run.id,
                    &StepError::new(locations::RUN_RESOLVE_SERVICE, err.to_string()),
                )
                .await?;
                return Ok(());
            }
        };

        // A run that already has streams is a resume (redelivery or restart):
        // re-drive what is pending instead of seeding duplicates.
        if runs.stream_count(run.id).await? > 0 {
            if run.state == WorkState::Delayed {
                debug!("run is delayed, the sweeper will resume it");
                return Ok(());
            }

            runs.mark_processing(run.id).await?;

            let streams = StreamRepository::new(self.db.clone());
            let pending = streams.pending_for_run(run.id).await?;
            let group_id = run.tenant_id.to_string();
            for stream in &pending {
                self.queue
                    .send(
                        QueueName::Streams,
                        &group_id,
                        &PipelineMessage::ProcessStream {
                            stream_id: stream.id,
                        },
                    )
                    .await?;
            }

            info!(redriven = pending.len(), "resumed run without re-seeding");
            return Ok(());
        }

        runs.mark_processing(run.id).await?;

        let span = info_span!(
            "generate_streams",
            run_id = %run.id,
            tenant_id = %run.tenant_id,
            platform = %integration.platform,
        );
        let ctx = RunContext::new(
            self.db.clone(),
            self.queue.clone(),
            &self.cache,
            run.clone(),
            &integration,
        );

        match service.generate_streams(&ctx).instrument(span).await {
            Ok(()) => {
                info!("root streams generated");
                Ok(())
            }
            Err(err) => {
                runs.mark_error(
                    run.id,
                    &StepError::new(locations::RUN_GENERATE_STREAMS, err.to_string()),
                )
                .await?;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageProcessor for RunWorker {
    fn queue(&self) -> QueueName {
        QueueName::Runs
    }

    async fn process(&self, message: PipelineMessage) -> Result<(), PipelineError> {
        match message {
            PipelineMessage::ProcessRun { run_id } => self.process_run(run_id).await,
            other => {
                warn!(?other, "unexpected message on the runs queue");
                Ok(())
            }
        }
    }
}
