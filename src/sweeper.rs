//! # Delay/Resume Sweeper
//!
//! Background task that promotes delayed streams, data records and runs
//! whose `delayed_until` has lapsed, re-enqueues their messages, and
//! finalizes processing runs with no open work left. This is the only
//! mechanism by which rate-limited work resumes. Every promotion is a
//! guarded update, so sweeping an already-promoted item is a no-op and
//! multiple sweeper instances may coordinate safely.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use rand::Rng;
use sea_orm::DatabaseConnection;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::cache::CacheStore;
use crate::config::SweeperConfig;
use crate::error::PipelineError;
use crate::queue::{PipelineMessage, QueueClient, QueueName};
use crate::repositories::{DataRepository, RunRepository, StreamRepository};

/// Background sweeper service.
pub struct Sweeper {
    config: SweeperConfig,
    queue: Arc<dyn QueueClient>,
    runs: RunRepository,
    streams: StreamRepository,
    data: DataRepository,
    cache: CacheStore,
}

/// What one sweep accomplished; logged each tick and returned for tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub runs_promoted: u64,
    pub streams_promoted: u64,
    pub data_promoted: u64,
    pub runs_finalized: u64,
    pub items_with_errors: u64,
}

impl Sweeper {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn QueueClient>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            runs: RunRepository::new(db.clone()),
            streams: StreamRepository::new(db.clone()),
            data: DataRepository::new(db.clone()),
            cache: CacheStore::new(db),
            queue,
            config,
        }
    }

    /// Run the sweeper loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        info!("starting sweeper");

        loop {
            let tick_interval = TokioDuration::from_secs(
                self.config.tick_interval_seconds + self.sample_jitter_seconds(),
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sweeper shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    match self.tick().await {
                        Ok(stats) => {
                            debug!(
                                runs_promoted = stats.runs_promoted,
                                streams_promoted = stats.streams_promoted,
                                data_promoted = stats.data_promoted,
                                runs_finalized = stats.runs_finalized,
                                errors = stats.items_with_errors,
                                "sweeper tick completed"
                            );
                        }
                        Err(err) => {
                            error!(error = ?err, "sweeper tick failed");
                        }
                    }
                    histogram!("ingest_sweeper_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("sweeper stopped");
        Ok(())
    }

    /// One pass: promote due runs first (their pending streams re-enqueue),
    /// then due streams and data records, then finalize runs with no open
    /// work. Per-item failures are isolated so one bad row cannot stall the
    /// sweep.
    pub async fn tick(&self) -> Result<TickOutcome, PipelineError> {
        let now = Utc::now().fixed_offset();
        let mut stats = TickOutcome::default();

        for run in self.runs.due_delayed(now, self.config.batch_size).await? {
            match self.resume_run(&run).await {
                Ok(true) => stats.runs_promoted += 1,
                Ok(false) => {}
                Err(err) => {
                    stats.items_with_errors += 1;
                    error!(run_id = %run.id, error = ?err, "failed to resume delayed run");
                }
            }
        }

        for stream in self.streams.due_delayed(now, self.config.batch_size).await? {
            match self.resume_stream(&stream).await {
                Ok(true) => stats.streams_promoted += 1,
                Ok(false) => {}
                Err(err) => {
                    stats.items_with_errors += 1;
                    error!(stream_id = %stream.id, error = ?err, "failed to resume delayed stream");
                }
            }
        }

        for record in self.data.due_delayed(now, self.config.batch_size).await? {
            match self.resume_data(&record).await {
                Ok(true) => stats.data_promoted += 1,
                Ok(false) => {}
                Err(err) => {
                    stats.items_with_errors += 1;
                    error!(data_id = %record.id, error = ?err, "failed to resume delayed data record");
                }
            }
        }

        for run in self.runs.processing(self.config.batch_size).await? {
            match self.finalize_run(run.id).await {
                Ok(true) => stats.runs_finalized += 1,
                Ok(false) => {}
                Err(err) => {
                    stats.items_with_errors += 1;
                    error!(run_id = %run.id, error = ?err, "failed to finalize run");
                }
            }
        }

        if let Err(err) = self.cache.evict_expired().await {
            debug!(error = ?err, "cache eviction failed");
        }

        counter!("ingest_sweeper_runs_promoted_total").increment(stats.runs_promoted);
        counter!("ingest_sweeper_streams_promoted_total").increment(stats.streams_promoted);
        counter!("ingest_sweeper_runs_finalized_total").increment(stats.runs_finalized);
        gauge!("ingest_sweeper_errors_gauge").set(stats.items_with_errors as f64);

        Ok(stats)
    }

    /// Delayed run back to processing; its pending streams re-enqueue.
    async fn resume_run(&self, run: &crate::models::run::Model) -> Result<bool, PipelineError> {
        if !self.runs.promote_to_processing(run.id).await? {
            return Ok(false);
        }

        let group_id = run.tenant_id.to_string();
        for stream in self.streams.pending_for_run(run.id).await? {
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

        info!(run_id = %run.id, "delayed run resumed");
        Ok(true)
    }

    /// Delayed stream back to pending and onto the queue.
    async fn resume_stream(
        &self,
        stream: &crate::models::stream::Model,
    ) -> Result<bool, PipelineError> {
        if !self.streams.promote_to_pending(stream.id).await? {
            return Ok(false);
        }

        self.queue
            .send(
                QueueName::Streams,
                &stream.tenant_id.to_string(),
                &PipelineMessage::ProcessStream {
                    stream_id: stream.id,
                },
            )
            .await?;

        Ok(true)
    }

    /// Delayed data record back to pending and onto the queue.
    async fn resume_data(&self, record: &crate::models::data::Model) -> Result<bool, PipelineError> {
        if !self.data.promote_to_pending(record.id).await? {
            return Ok(false);
        }

        self.queue
            .send(
                QueueName::Data,
                &record.tenant_id.to_string(),
                &PipelineMessage::ProcessData { data_id: record.id },
            )
            .await?;

        Ok(true)
    }

    /// Processing run with no open descendant work becomes processed. Run
    /// errors were already applied synchronously when a stream stopped the
    /// run, so a still-processing run with all work terminal finished.
    async fn finalize_run(&self, run_id: uuid::Uuid) -> Result<bool, PipelineError> {
        if self.runs.has_open_work(run_id).await? {
            return Ok(false);
        }

        let finalized = self.runs.mark_processed(run_id).await?;
        if finalized {
            info!(%run_id, "run processed");
        }
        Ok(finalized)
    }

    fn sample_jitter_seconds(&self) -> u64 {
        let mut rng = rand::thread_rng();
        compute_jitter_seconds(&self.config, &mut rng)
    }
}

fn compute_jitter_seconds<R: Rng + ?Sized>(config: &SweeperConfig, rng: &mut R) -> u64 {
    let min = config.jitter_pct_min.max(0.0);
    let max = config.jitter_pct_max.max(min);

    if min == 0.0 && max == 0.0 {
        return 0;
    }

    let jitter_pct = if (max - min).abs() < f64::EPSILON {
        min
    } else {
        rng.gen_range(min..=max)
    };

    (config.tick_interval_seconds as f64 * jitter_pct).round() as u64
}
