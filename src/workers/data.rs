//! Data worker
//!
//! Consumes `process_data` messages: the leaf stage that hands one produced
//! record to the platform's `process_data`, which normalizes it into the
//! sink. Mirrors the stream worker's checks and failure handling one level
//! down, with its own retry cap. Data handlers cannot publish further work.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde_json::json;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::context::DataContext;
use crate::error::{HandlerError, PipelineError, StepError, locations};
use crate::models::WorkState;
use crate::models::{data, run};
use crate::platforms::Registry;
use crate::queue::{PipelineMessage, QueueClient, QueueName};
use crate::repositories::{DataRepository, IntegrationRepository, RunRepository};
use crate::sink::Sink;
use crate::workers::{MessageProcessor, retry_backoff};

pub struct DataWorker {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn QueueClient>,
    registry: Arc<Registry>,
    sink: Arc<dyn Sink>,
    cache: CacheStore,
    max_data_retries: i32,
}

impl DataWorker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        registry: Arc<Registry>,
        sink: Arc<dyn Sink>,
        max_data_retries: i32,
    ) -> Self {
        Self {
            cache: CacheStore::new(db.clone()),
            db,
            queue,
            registry,
            sink,
            max_data_retries,
        }
    }

    #[instrument(skip(self), fields(data_id = %data_id))]
    pub async fn process_data(&self, data_id: Uuid) -> Result<(), PipelineError> {
        let records = DataRepository::new(self.db.clone());
        let runs = RunRepository::new(self.db.clone());

        let Some((record, run)) = records.find_with_run(data_id).await? else {
            warn!("data record not found, dropping message");
            return Ok(());
        };

        let Some(run) = run else {
            warn!("data record has no run, dropping message");
            return Ok(());
        };

        if record.state.is_terminal() {
            debug!(state = ?record.state, "data record already terminal, nothing to do");
            return Ok(());
        }

        if record.state == WorkState::Delayed {
            debug!("data record is delayed, the sweeper will re-enqueue it");
            return Ok(());
        }

        // Same rule as streams: only a processing run may have its data
        // records worked on.
        match run.state {
            WorkState::Processing => {}
            _ => {
                records
                    .mark_error(
                        record.id,
                        &StepError::new(
                            locations::CHECK_DATA_RUN_STATE,
                            format!("run is {:?}, data cannot be processed", run.state),
                        ),
                    )
                    .await?;
                return Ok(());
            }
        }

        let integrations = IntegrationRepository::new(self.db.clone());
        let Some(integration) = integrations.find_active(run.integration_id).await? else {
            records
                .mark_error(
                    record.id,
                    &StepError::new(
                        locations::DATA_CHECK_INTEGRATION,
                        "integration does not exist or has been deleted",
                    ),
                )
                .await?;
            return Ok(());
        };

        let service = match self.registry.get(&integration.platform) {
            Ok(service) => service,
            Err(err) => {
                records
                    .mark_error(
                        record.id,
                        &StepError::new(locations::DATA_RESOLVE_SERVICE, err.to_string()),
                    )
                    .await?;
                return Ok(());
            }
        };

        if !records.mark_processing(record.id).await? {
            debug!("lost the claim on the data record, skipping");
            return Ok(());
        }

        let span = info_span!(
            "process_data",
            data_id = %record.id,
            run_id = %run.id,
            tenant_id = %run.tenant_id,
            platform = %integration.platform,
        );
        let ctx = DataContext::new(
            self.db.clone(),
            self.queue.clone(),
            &self.cache,
            run.clone(),
            &integration,
            record.data.clone(),
            self.sink.clone(),
        );

        match service.process_data(&ctx).instrument(span).await {
            Ok(()) => {
                records.mark_processed(record.id).await?;
                counter!("ingest_data_outcomes_total", "outcome" => "processed").increment(1);
                Ok(())
            }
            Err(err) => {
                self.handle_failure(&records, &runs, &record, &run, err)
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        records: &DataRepository,
        runs: &RunRepository,
        record: &data::Model,
        run: &run::Model,
        err: HandlerError,
    ) -> Result<(), PipelineError> {
        match err {
            HandlerError::RateLimit { reset_seconds } => {
                let delayed_until =
                    Utc::now().fixed_offset() + chrono::Duration::seconds(reset_seconds as i64);
                records.reset_to_pending(record.id).await?;
                runs.mark_delayed(run.id, delayed_until).await?;
                info!(reset_seconds, "rate limited, run delayed");
                counter!("ingest_data_outcomes_total", "outcome" => "rate_limited").increment(1);
                Ok(())
            }
            HandlerError::Abort { message, metadata } => {
                let mut error = StepError::new(locations::DATA_PROCESS, message);
                if let Some(metadata) = metadata {
                    error = error.with_metadata(metadata);
                }
                records.mark_error(record.id, &error).await?;
                counter!("ingest_data_outcomes_total", "outcome" => "aborted").increment(1);
                Ok(())
            }
            HandlerError::AbortRun { message, metadata } => {
                let mut data_error = StepError::new(locations::DATA_PROCESS, message.clone());
                if let Some(metadata) = metadata {
                    data_error = data_error.with_metadata(metadata);
                }
                let run_error = StepError::new(locations::DATA_RUN_ABORT, message)
                    .with_metadata(json!({"dataId": record.id}));
                records
                    .mark_error_and_stop_run(record.id, None, &data_error, run.id, &run_error)
                    .await?;
                counter!("ingest_data_outcomes_total", "outcome" => "run_aborted").increment(1);
                Ok(())
            }
            HandlerError::Unsupported { .. } => {
                records
                    .mark_error(
                        record.id,
                        &StepError::new(locations::DATA_RESOLVE_SERVICE, err.to_string()),
                    )
                    .await?;
                Ok(())
            }
            HandlerError::Other(err) => {
                let attempt = record.retries + 1;
                let error = StepError::new(locations::DATA_PROCESS, err.to_string())
                    .with_metadata(json!({"attempt": attempt}));

                if attempt <= self.max_data_retries {
                    let delayed_until = Utc::now().fixed_offset() + retry_backoff(attempt);
                    records
                        .delay_for_retry(record.id, attempt, delayed_until, &error)
                        .await?;
                    warn!(attempt, "data record failed, delayed for retry");
                    counter!("ingest_data_outcomes_total", "outcome" => "retried").increment(1);
                } else {
                    let run_error = StepError::new(
                        locations::DATA_RUN_STOP,
                        format!("data record {} exhausted its retries", record.id),
                    )
                    .with_metadata(json!({"dataId": record.id, "retries": attempt}));
                    records
                        .mark_error_and_stop_run(
                            record.id,
                            Some(attempt),
                            &error,
                            run.id,
                            &run_error,
                        )
                        .await?;
                    warn!(attempt, "data retries exhausted, run stopped");
                    counter!("ingest_data_outcomes_total", "outcome" => "exhausted").increment(1);
                }
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageProcessor for DataWorker {
    fn queue(&self) -> QueueName {
        QueueName::Data
    }

    async fn process(&self, message: PipelineMessage) -> Result<(), PipelineError> {
        match message {
            PipelineMessage::ProcessData { data_id } => self.process_data(data_id).await,
            other => {
                warn!(?other, "unexpected message on the data queue");
                Ok(())
            }
        }
    }
}
