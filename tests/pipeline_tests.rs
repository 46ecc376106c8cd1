//! End-to-end pipeline behavior: run fan-out, resume without re-seeding,
//! child publication with dedupe, rate-limit pauses, retry exhaustion and
//! abort handling.

mod test_utils;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use ingest::context::{DataContext, RunContext, StreamContext};
use ingest::error::{HandlerError, locations};
use ingest::models::{WorkState, data, stream};
use ingest::platforms::{IntegrationService, Registry};
use ingest::queue::QueueName;
use ingest::repositories::{
    DataRepository, IntegrationRepository, RunRepository, StreamRepository,
};
use ingest::workers::{DataWorker, RunWorker, StreamWorker};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use test_utils::{
    assert_state, default_settings, insert_integration, insert_processing_run_with_stream,
    insert_run, queue_depth, setup_test_db, test_queue,
};

#[derive(Default)]
struct FanoutService {
    generate_calls: AtomicUsize,
}

#[async_trait]
impl IntegrationService for FanoutService {
    fn platform(&self) -> &str {
        "fanout"
    }

    async fn generate_streams(&self, ctx: &RunContext) -> Result<(), HandlerError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        for identifier in ["s1", "s2", "s3"] {
            ctx.publish_stream(identifier, None).await?;
        }
        Ok(())
    }

    async fn process_stream(&self, _ctx: &StreamContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[derive(Default)]
struct EchoService {
    stream_calls: AtomicUsize,
}

#[async_trait]
impl IntegrationService for EchoService {
    fn platform(&self) -> &str {
        "echo"
    }

    async fn process_stream(&self, ctx: &StreamContext) -> Result<(), HandlerError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if ctx.stream().identifier == "root" {
            ctx.publish_stream("child-a", Some(json!({"cursor": "x"})))
                .await?;
            ctx.publish_data(json!({"kind": "item", "id": "42"})).await?;
        }
        Ok(())
    }
}

struct RateLimitedService {
    reset_seconds: u64,
}

#[async_trait]
impl IntegrationService for RateLimitedService {
    fn platform(&self) -> &str {
        "ratelimited"
    }

    async fn process_stream(&self, _ctx: &StreamContext) -> Result<(), HandlerError> {
        Err(HandlerError::RateLimit {
            reset_seconds: self.reset_seconds,
        })
    }
}

struct FlakyService;

#[async_trait]
impl IntegrationService for FlakyService {
    fn platform(&self) -> &str {
        "flaky"
    }

    async fn process_stream(&self, _ctx: &StreamContext) -> Result<(), HandlerError> {
        Err(HandlerError::Other(anyhow!("upstream returned 500")))
    }
}

struct AbortingService;

#[async_trait]
impl IntegrationService for AbortingService {
    fn platform(&self) -> &str {
        "aborting"
    }

    async fn process_stream(&self, _ctx: &StreamContext) -> Result<(), HandlerError> {
        Err(HandlerError::abort_run("credentials were revoked"))
    }

    async fn process_data(&self, _ctx: &DataContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn registry_with(service: Arc<dyn IntegrationService>) -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register(service);
    Arc::new(registry)
}

#[tokio::test]
async fn run_worker_fans_out_root_streams() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let service = Arc::new(FanoutService::default());
    let registry = registry_with(service.clone());

    let integration = insert_integration(&db, "fanout", default_settings()).await?;
    let run = insert_run(&db, &integration, true).await?;

    let worker = RunWorker::new(db.clone(), queue.clone(), registry);
    worker.process_run(run.id).await?;

    let runs = RunRepository::new(db.clone());
    let run = runs.find_by_id(run.id).await?.expect("run exists");
    assert_state(run.state, WorkState::Processing, "run");

    let streams = stream::Entity::find()
        .filter(stream::Column::RunId.eq(run.id))
        .all(db.as_ref())
        .await?;
    assert_eq!(streams.len(), 3);
    for s in &streams {
        assert_state(s.state, WorkState::Pending, "root stream");
        assert!(s.parent_id.is_none(), "fanned-out streams are roots");
    }

    assert_eq!(queue_depth(&db, QueueName::Streams).await?, 3);
    assert_eq!(service.generate_calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn redelivered_run_message_redrives_without_reseeding() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let service = Arc::new(FanoutService::default());
    let registry = registry_with(service.clone());

    let integration = insert_integration(&db, "fanout", default_settings()).await?;
    let run = insert_run(&db, &integration, false).await?;

    let worker = RunWorker::new(db.clone(), queue.clone(), registry);
    worker.process_run(run.id).await?;
    worker.process_run(run.id).await?;

    // Still exactly three streams, but their messages were re-published.
    let streams = stream::Entity::find()
        .filter(stream::Column::RunId.eq(run.id))
        .all(db.as_ref())
        .await?;
    assert_eq!(streams.len(), 3);
    assert_eq!(service.generate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue_depth(&db, QueueName::Streams).await?, 6);

    Ok(())
}

#[tokio::test]
async fn missing_integration_errors_the_run() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = registry_with(Arc::new(FanoutService::default()));

    let integration = insert_integration(&db, "fanout", default_settings()).await?;
    let run = insert_run(&db, &integration, false).await?;

    // Soft-delete the integration before the run is picked up.
    let mut active: ingest::models::integration::ActiveModel = integration.into();
    active.deleted_at = sea_orm::Set(Some(Utc::now().fixed_offset()));
    sea_orm::ActiveModelTrait::update(active, db.as_ref()).await?;

    let worker = RunWorker::new(db.clone(), queue.clone(), registry);
    worker.process_run(run.id).await?;

    let run = RunRepository::new(db.clone())
        .find_by_id(run.id)
        .await?
        .expect("run exists");
    assert_state(run.state, WorkState::Error, "run");
    let error = run.error.expect("error recorded");
    assert_eq!(error["location"], locations::RUN_CHECK_INTEGRATION);

    Ok(())
}

#[tokio::test]
async fn unregistered_platform_errors_the_run() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = Arc::new(Registry::new());

    let integration = insert_integration(&db, "unknown-platform", default_settings()).await?;
    let run = insert_run(&db, &integration, false).await?;

    let worker = RunWorker::new(db.clone(), queue.clone(), registry);
    worker.process_run(run.id).await?;

    let run = RunRepository::new(db.clone())
        .find_by_id(run.id)
        .await?
        .expect("run exists");
    assert_state(run.state, WorkState::Error, "run");

    Ok(())
}

#[tokio::test]
async fn stream_publishes_child_and_data() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let service = Arc::new(EchoService::default());
    let registry = registry_with(service.clone());

    let integration = insert_integration(&db, "echo", default_settings()).await?;
    let (run, root) =
        insert_processing_run_with_stream(&db, &integration, "root", None).await?;

    let worker = StreamWorker::new(db.clone(), queue.clone(), registry, 3);
    worker.process_stream(root.id).await?;

    let root_row = StreamRepository::new(db.clone())
        .find_by_id(root.id)
        .await?
        .expect("root stream exists");
    assert_state(root_row.state, WorkState::Processed, "root stream");
    assert!(root_row.processed_at.is_some());

    let child = stream::Entity::find()
        .filter(stream::Column::RunId.eq(run.id))
        .filter(stream::Column::Identifier.eq("child-a"))
        .one(db.as_ref())
        .await?
        .expect("child stream created");
    assert_eq!(child.parent_id, Some(root.id));
    assert_eq!(child.data, Some(json!({"cursor": "x"})));
    assert_state(child.state, WorkState::Pending, "child stream");

    let records = data::Entity::find()
        .filter(data::Column::RunId.eq(run.id))
        .all(db.as_ref())
        .await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].stream_id, root.id);
    assert_eq!(records[0].data, json!({"kind": "item", "id": "42"}));

    // One child stream message plus one data message.
    assert_eq!(queue_depth(&db, QueueName::Streams).await?, 1);
    assert_eq!(queue_depth(&db, QueueName::Data).await?, 1);

    Ok(())
}

#[tokio::test]
async fn redelivered_stream_message_is_a_noop_for_processed_stream() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let service = Arc::new(EchoService::default());
    let registry = registry_with(service.clone());

    let integration = insert_integration(&db, "echo", default_settings()).await?;
    let (_run, root) =
        insert_processing_run_with_stream(&db, &integration, "root", None).await?;

    let worker = StreamWorker::new(db.clone(), queue.clone(), registry, 3);
    worker.process_stream(root.id).await?;
    worker.process_stream(root.id).await?;

    // No second handler invocation, no duplicate children or messages.
    assert_eq!(service.stream_calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue_depth(&db, QueueName::Streams).await?, 1);
    assert_eq!(queue_depth(&db, QueueName::Data).await?, 1);

    Ok(())
}

#[tokio::test]
async fn republished_identifier_dedupes_under_the_run() -> Result<()> {
    let db = setup_test_db().await?;

    let integration = insert_integration(&db, "echo", default_settings()).await?;
    let (run, root) =
        insert_processing_run_with_stream(&db, &integration, "root", None).await?;

    let streams = StreamRepository::new(db.clone());
    let first = streams
        .create_child(&run, root.id, "child-a", Some(json!({"cursor": "x"})))
        .await?;
    assert!(first.is_some());

    let second = streams
        .create_child(&run, root.id, "child-a", Some(json!({"cursor": "y"})))
        .await?;
    assert!(second.is_none(), "duplicate identifier must be a no-op");

    Ok(())
}

#[tokio::test]
async fn rate_limit_pauses_the_run_and_keeps_the_retry_budget() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = registry_with(Arc::new(RateLimitedService { reset_seconds: 60 }));

    let integration = insert_integration(&db, "ratelimited", default_settings()).await?;
    let (run, s) = insert_processing_run_with_stream(&db, &integration, "s", None).await?;

    let before = Utc::now().fixed_offset();
    let worker = StreamWorker::new(db.clone(), queue.clone(), registry, 3);
    worker.process_stream(s.id).await?;

    let s = StreamRepository::new(db.clone())
        .find_by_id(s.id)
        .await?
        .expect("stream exists");
    assert_state(s.state, WorkState::Pending, "rate-limited stream");
    assert_eq!(s.retries, 0, "rate limits do not consume retries");

    let run = RunRepository::new(db.clone())
        .find_by_id(run.id)
        .await?
        .expect("run exists");
    assert_state(run.state, WorkState::Delayed, "run");
    let delayed_until = run.delayed_until.expect("delayed_until set");
    assert!(delayed_until >= before + Duration::seconds(59));
    assert!(delayed_until <= Utc::now().fixed_offset() + Duration::seconds(61));

    Ok(())
}

#[tokio::test]
async fn sibling_stream_fails_the_run_state_check_while_run_is_delayed() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = registry_with(Arc::new(EchoService::default()));

    let integration = insert_integration(&db, "echo", default_settings()).await?;
    let (run, sibling) =
        insert_processing_run_with_stream(&db, &integration, "sibling", None).await?;

    RunRepository::new(db.clone())
        .mark_delayed(run.id, Utc::now().fixed_offset() + Duration::seconds(60))
        .await?;

    let worker = StreamWorker::new(db.clone(), queue.clone(), registry, 3);
    worker.process_stream(sibling.id).await?;

    let sibling = StreamRepository::new(db.clone())
        .find_by_id(sibling.id)
        .await?
        .expect("stream exists");
    assert_state(sibling.state, WorkState::Error, "sibling under a delayed run");
    let error = sibling.error.expect("error recorded");
    assert_eq!(error["location"], locations::CHECK_STREAM_RUN_STATE);

    Ok(())
}

#[tokio::test]
async fn stream_under_errored_run_short_circuits() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = registry_with(Arc::new(EchoService::default()));

    let integration = insert_integration(&db, "echo", default_settings()).await?;
    let (run, s) = insert_processing_run_with_stream(&db, &integration, "s", None).await?;

    RunRepository::new(db.clone())
        .mark_error(
            run.id,
            &ingest::error::StepError::new(locations::STREAM_RUN_ABORT, "cancelled"),
        )
        .await?;

    let worker = StreamWorker::new(db.clone(), queue.clone(), registry, 3);
    worker.process_stream(s.id).await?;

    let s = StreamRepository::new(db.clone())
        .find_by_id(s.id)
        .await?
        .expect("stream exists");
    assert_state(s.state, WorkState::Error, "short-circuited stream");
    let error = s.error.expect("error recorded");
    assert_eq!(error["location"], locations::CHECK_STREAM_RUN_STATE);

    Ok(())
}

#[tokio::test]
async fn transient_failures_back_off_linearly_then_stop_the_run() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = registry_with(Arc::new(FlakyService));

    let integration = insert_integration(&db, "flaky", default_settings()).await?;
    let (run, s) = insert_processing_run_with_stream(&db, &integration, "s", None).await?;

    let streams = StreamRepository::new(db.clone());
    let runs = RunRepository::new(db.clone());
    let worker = StreamWorker::new(db.clone(), queue.clone(), registry, 2);

    // First failure: one retry consumed, 15 minute backoff.
    let before = Utc::now().fixed_offset();
    worker.process_stream(s.id).await?;
    let row = streams.find_by_id(s.id).await?.expect("stream exists");
    assert_state(row.state, WorkState::Delayed, "stream after first failure");
    assert_eq!(row.retries, 1);
    let delayed_until = row.delayed_until.expect("delayed_until set");
    assert!(delayed_until >= before + Duration::minutes(14));
    assert!(delayed_until <= Utc::now().fixed_offset() + Duration::minutes(16));

    // Second failure: 30 minute backoff.
    streams.promote_to_pending(s.id).await?;
    let before = Utc::now().fixed_offset();
    worker.process_stream(s.id).await?;
    let row = streams.find_by_id(s.id).await?.expect("stream exists");
    assert_eq!(row.retries, 2);
    let delayed_until = row.delayed_until.expect("delayed_until set");
    assert!(delayed_until >= before + Duration::minutes(29));

    // Third failure exhausts the budget: stream and run both error.
    streams.promote_to_pending(s.id).await?;
    worker.process_stream(s.id).await?;

    let row = streams.find_by_id(s.id).await?.expect("stream exists");
    assert_state(row.state, WorkState::Error, "exhausted stream");
    assert_eq!(row.retries, 3);

    let run = runs.find_by_id(run.id).await?.expect("run exists");
    assert_state(run.state, WorkState::Error, "stopped run");
    let error = run.error.expect("error recorded");
    assert_eq!(error["location"], locations::STREAM_RUN_STOP);

    Ok(())
}

#[tokio::test]
async fn abort_run_terminates_run_and_stream_together() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = registry_with(Arc::new(AbortingService));

    let integration = insert_integration(&db, "aborting", default_settings()).await?;
    let (run, s) = insert_processing_run_with_stream(&db, &integration, "s", None).await?;

    let worker = StreamWorker::new(db.clone(), queue.clone(), registry, 3);
    worker.process_stream(s.id).await?;

    let s = StreamRepository::new(db.clone())
        .find_by_id(s.id)
        .await?
        .expect("stream exists");
    assert_state(s.state, WorkState::Error, "aborted stream");

    let run = RunRepository::new(db.clone())
        .find_by_id(run.id)
        .await?
        .expect("run exists");
    assert_state(run.state, WorkState::Error, "aborted run");
    let error = run.error.expect("error recorded");
    assert_eq!(error["location"], locations::STREAM_RUN_ABORT);

    Ok(())
}

#[tokio::test]
async fn settings_merge_replaces_only_named_keys() -> Result<()> {
    let db = setup_test_db().await?;

    let integration =
        insert_integration(&db, "echo", json!({"posts": [], "lastSync": null})).await?;

    let integrations = IntegrationRepository::new(db.clone());
    integrations
        .update_settings(integration.id, &json!({"lastSync": "2024-01-01"}))
        .await?;

    let updated = integrations
        .find_active(integration.id)
        .await?
        .expect("integration exists");
    assert_eq!(
        updated.settings,
        json!({"posts": [], "lastSync": "2024-01-01"})
    );

    Ok(())
}

#[tokio::test]
async fn data_worker_feeds_the_sink() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let service = Arc::new(ingest::platforms::SampleService::new());
    let registry = registry_with(service);
    let sink = Arc::new(ingest::sink::RecordingSink::new());

    let integration =
        insert_integration(&db, ingest::platforms::SAMPLE_PLATFORM, default_settings()).await?;
    let (run, s) = insert_processing_run_with_stream(
        &db,
        &integration,
        "posts:general",
        Some(json!({"board": "general", "page": 1})),
    )
    .await?;

    let records = DataRepository::new(db.clone());
    let record = records
        .create(&s, json!({"kind": "post", "sourceId": "general-p1-1", "author": "ada"}))
        .await?;

    let worker = DataWorker::new(db.clone(), queue.clone(), registry, sink.clone(), 3);
    worker.process_data(record.id).await?;

    let record = records.find_by_id(record.id).await?.expect("record exists");
    assert_state(record.state, WorkState::Processed, "data record");
    assert_eq!(sink.activity_count(), 1);
    assert_eq!(sink.member_count(), 1);
    assert!(sink.activity(run.tenant_id, "general-p1-1").is_some());

    Ok(())
}

#[tokio::test]
async fn data_without_source_id_aborts_the_record_only() -> Result<()> {
    let db = setup_test_db().await?;
    let queue = test_queue(&db);
    let registry = registry_with(Arc::new(ingest::platforms::SampleService::new()));
    let sink = Arc::new(ingest::sink::RecordingSink::new());

    let integration =
        insert_integration(&db, ingest::platforms::SAMPLE_PLATFORM, default_settings()).await?;
    let (run, s) = insert_processing_run_with_stream(
        &db,
        &integration,
        "posts:general",
        Some(json!({"board": "general", "page": 1})),
    )
    .await?;

    let records = DataRepository::new(db.clone());
    let record = records.create(&s, json!({"kind": "post"})).await?;

    let worker = DataWorker::new(db.clone(), queue.clone(), registry, sink, 3);
    worker.process_data(record.id).await?;

    let record = records.find_by_id(record.id).await?.expect("record exists");
    assert_state(record.state, WorkState::Error, "aborted record");

    let run = RunRepository::new(db.clone())
        .find_by_id(run.id)
        .await?
        .expect("run exists");
    assert_state(run.state, WorkState::Processing, "run keeps going");

    Ok(())
}
