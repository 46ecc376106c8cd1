//! Receiver loop
//!
//! Drives one queue consumer: polls for messages, dispatches them to the
//! stage processor with bounded concurrency, and acknowledges a message only
//! after the processor persisted an outcome. When every slot is busy the
//! loop sleeps instead of polling, providing cooperative backpressure.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::queue::{PipelineMessage, QueueClient, QueueName};

/// A pipeline stage consuming one queue.
#[async_trait::async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    /// The queue this processor consumes.
    fn queue(&self) -> QueueName;

    /// Processes one message. `Ok` acknowledges the message; `Err` leaves it
    /// unacked so the visibility timeout re-drives the unit.
    async fn process(&self, message: PipelineMessage) -> Result<(), PipelineError>;
}

/// Backpressure-aware consumer loop for one queue.
pub struct ReceiverLoop {
    queue: Arc<dyn QueueClient>,
    processor: Arc<dyn MessageProcessor>,
    max_concurrency: usize,
    idle_sleep: Duration,
}

impl ReceiverLoop {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        processor: Arc<dyn MessageProcessor>,
        max_concurrency: usize,
        idle_sleep: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            max_concurrency: max_concurrency.max(1),
            idle_sleep,
        }
    }

    /// Run the loop until the shutdown token fires, then drain in-flight
    /// work before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let queue_name = self.processor.queue();
        self.queue.init(queue_name).await?;

        info!(queue = %queue_name, concurrency = self.max_concurrency, "starting receiver loop");

        let slots = Arc::new(Semaphore::new(self.max_concurrency));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // All slots busy: wait before polling again.
            if slots.available_permits() == 0 {
                self.idle_wait(&shutdown, Duration::from_secs(1)).await;
                continue;
            }

            let received = match self.queue.receive(queue_name).await {
                Ok(Some(received)) => received,
                Ok(None) => {
                    self.idle_wait(&shutdown, self.idle_sleep).await;
                    continue;
                }
                Err(err) => {
                    error!(queue = %queue_name, error = %err, "receive failed");
                    self.idle_wait(&shutdown, self.idle_sleep).await;
                    continue;
                }
            };

            let permit = match slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let queue = self.queue.clone();
            let processor = self.processor.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let started = std::time::Instant::now();
                let receipt_handle = received.receipt_handle;

                let outcome = processor.process(received.message).await;

                histogram!("ingest_worker_processing_seconds", "queue" => queue_name.as_str())
                    .record(started.elapsed().as_secs_f64());

                match outcome {
                    Ok(()) => {
                        counter!("ingest_worker_messages_total", "queue" => queue_name.as_str(), "outcome" => "handled")
                            .increment(1);
                        if let Err(err) = queue.delete_message(queue_name, receipt_handle).await {
                            error!(queue = %queue_name, error = %err, "failed to ack message");
                        }
                    }
                    Err(err) => {
                        // Leave the message; it redelivers after the
                        // visibility timeout and pickup re-reads state.
                        counter!("ingest_worker_messages_total", "queue" => queue_name.as_str(), "outcome" => "requeued")
                            .increment(1);
                        warn!(queue = %queue_name, error = %err, "processing failed, message will redeliver");
                    }
                }
            });
        }

        // Drain: every permit back means every spawned task finished.
        let _ = slots.acquire_many(self.max_concurrency as u32).await;
        info!(queue = %queue_name, "receiver loop stopped");

        Ok(())
    }

    async fn idle_wait(&self, shutdown: &CancellationToken, duration: Duration) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(duration) => {}
        }
    }
}
