//! Stream worker
//!
//! Consumes `process_stream` messages: verifies the owning run is still
//! processing, resolves the platform service and invokes `process_stream`
//! with a context that can publish child streams and data records. Failure
//! handling distinguishes rate limits (pause the run, keep the retry
//! budget), aborts (unit or run terminal) and transient errors (linear
//! backoff until the budget runs out, which stops the run too).

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde_json::json;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::context::StreamContext;
use crate::error::{HandlerError, PipelineError, StepError, locations};
use crate::models::WorkState;
use crate::models::{run, stream};
use crate::platforms::Registry;
use crate::queue::{PipelineMessage, QueueClient, QueueName};
use crate::repositories::{IntegrationRepository, RunRepository, StreamRepository};
use crate::workers::{MessageProcessor, retry_backoff};

pub struct StreamWorker {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn QueueClient>,
    registry: Arc<Registry>,
    cache: CacheStore,
    max_stream_retries: i32,
}

impl StreamWorker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        registry: Arc<Registry>,
        max_stream_retries: i32,
    ) -> Self {
        Self {
            cache: CacheStore::new(db.clone()),
            db,
            queue,
            registry,
            max_stream_retries,
        }
    }

    #[instrument(skip(self), fields(stream_id = %stream_id))]
    pub async fn process_stream(&self, stream_id: Uuid) -> Result<(), PipelineError> {
        let streams = StreamRepository::new(self.db.clone());
        let runs = RunRepository::new(self.db.clone());

        let Some((stream, run)) = streams.find_with_run(stream_id).await? else {
            warn!("stream not found, dropping message");
            return Ok(());
        };

        let Some(run) = run else {
            warn!("stream has no run, dropping message");
            return Ok(());
        };

        if stream.state.is_terminal() {
            debug!(state = ?stream.state, "stream already terminal, nothing to do");
            return Ok(());
        }

        if stream.state == WorkState::Delayed {
            debug!("stream is delayed, the sweeper will re-enqueue it");
            return Ok(());
        }

        // The run must be processing. Anything else, a delayed run
        // included, fails the stream; the run's own resume path re-seeds
        // work when it comes back.
        match run.state {
            WorkState::Processing => {}
            _ => {
                streams
                    .mark_error(
                        stream.id,
                        &StepError::new(
                            locations::CHECK_STREAM_RUN_STATE,
                            format!("run is {:?}, stream cannot be processed", run.state),
                        ),
                    )
                    .await?;
                counter!("ingest_stream_outcomes_total", "outcome" => "run_not_processing")
                    .increment(1);
                return Ok(());
            }
        }

        let integrations = IntegrationRepository::new(self.db.clone());
        let Some(integration) = integrations.find_active(stream.integration_id).await? else {
            streams
                .mark_error(
                    stream.id,
                    &StepError::new(
                        locations::STREAM_CHECK_INTEGRATION,
                        "integration does not exist or has been deleted",
                    ),
                )
                .await?;
            return Ok(());
        };

        let service = match self.registry.get(&integration.platform) {
            Ok(service) => service,
            Err(err) => {
                streams
                    .mark_error(
                        stream.id,
                        &StepError::new(locations::STREAM_RESOLVE_SERVICE, err.to_string()),
                    )
                    .await?;
                return Ok(());
            }
        };

        if !streams.mark_processing(stream.id).await? {
            debug!("lost the claim on the stream, skipping");
            return Ok(());
        }

        let span = info_span!(
            "process_stream",
            stream_id = %stream.id,
            run_id = %run.id,
            tenant_id = %run.tenant_id,
            platform = %integration.platform,
            identifier = %stream.identifier,
        );
        let ctx = StreamContext::new(
            self.db.clone(),
            self.queue.clone(),
            &self.cache,
            run.clone(),
            &integration,
            stream.clone(),
        );

        match service.process_stream(&ctx).instrument(span).await {
            Ok(()) => {
                streams.mark_processed(stream.id).await?;
                counter!("ingest_stream_outcomes_total", "outcome" => "processed").increment(1);
                Ok(())
            }
            Err(err) => {
                self.handle_failure(&streams, &runs, &stream, &run, err)
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        streams: &StreamRepository,
        runs: &RunRepository,
        stream: &stream::Model,
        run: &run::Model,
        err: HandlerError,
    ) -> Result<(), PipelineError> {
        match err {
            HandlerError::RateLimit { reset_seconds } => {
                // The whole run pauses; the stream goes back to pending with
                // its retry budget untouched.
                let delayed_until =
                    Utc::now().fixed_offset() + chrono::Duration::seconds(reset_seconds as i64);
                streams.reset_to_pending(stream.id).await?;
                runs.mark_delayed(run.id, delayed_until).await?;
                info!(reset_seconds, "rate limited, run delayed");
                counter!("ingest_stream_outcomes_total", "outcome" => "rate_limited").increment(1);
                Ok(())
            }
            HandlerError::Abort { message, metadata } => {
                let mut error = StepError::new(locations::STREAM_PROCESS, message);
                if let Some(metadata) = metadata {
                    error = error.with_metadata(metadata);
                }
                streams.mark_error(stream.id, &error).await?;
                counter!("ingest_stream_outcomes_total", "outcome" => "aborted").increment(1);
                Ok(())
            }
            HandlerError::AbortRun { message, metadata } => {
                let mut stream_error = StepError::new(locations::STREAM_PROCESS, message.clone());
                if let Some(metadata) = metadata {
                    stream_error = stream_error.with_metadata(metadata);
                }
                let run_error = StepError::new(locations::STREAM_RUN_ABORT, message)
                    .with_metadata(json!({"streamId": stream.id}));
                streams
                    .mark_error_and_stop_run(stream.id, None, &stream_error, run.id, &run_error)
                    .await?;
                counter!("ingest_stream_outcomes_total", "outcome" => "run_aborted").increment(1);
                Ok(())
            }
            HandlerError::Unsupported { .. } => {
                streams
                    .mark_error(
                        stream.id,
                        &StepError::new(locations::STREAM_RESOLVE_SERVICE, err.to_string()),
                    )
                    .await?;
                Ok(())
            }
            HandlerError::Other(err) => {
                let attempt = stream.retries + 1;
                let error = StepError::new(locations::STREAM_PROCESS, err.to_string())
                    .with_metadata(json!({"attempt": attempt}));

                if attempt <= self.max_stream_retries {
                    let delayed_until = Utc::now().fixed_offset() + retry_backoff(attempt);
                    streams
                        .delay_for_retry(stream.id, attempt, delayed_until, &error)
                        .await?;
                    warn!(attempt, "stream failed, delayed for retry");
                    counter!("ingest_stream_outcomes_total", "outcome" => "retried").increment(1);
                } else {
                    let run_error = StepError::new(
                        locations::STREAM_RUN_STOP,
                        format!("stream {} exhausted its retries", stream.id),
                    )
                    .with_metadata(json!({"streamId": stream.id, "retries": attempt}));
                    streams
                        .mark_error_and_stop_run(
                            stream.id,
                            Some(attempt),
                            &error,
                            run.id,
                            &run_error,
                        )
                        .await?;
                    warn!(attempt, "stream retries exhausted, run stopped");
                    counter!("ingest_stream_outcomes_total", "outcome" => "exhausted").increment(1);
                }
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageProcessor for StreamWorker {
    fn queue(&self) -> QueueName {
        QueueName::Streams
    }

    async fn process(&self, message: PipelineMessage) -> Result<(), PipelineError> {
        match message {
            PipelineMessage::ProcessStream { stream_id } => self.process_stream(stream_id).await,
            PipelineMessage::StreamError {
                stream_id,
                location,
                message,
                metadata,
            } => {
                warn!(%stream_id, location, message, ?metadata, "stream error report");
                Ok(())
            }
            other => {
                warn!(?other, "unexpected message on the streams queue");
                Ok(())
            }
        }
    }
}
