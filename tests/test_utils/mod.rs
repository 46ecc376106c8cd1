//! Test utilities for database testing.
//!
//! Sets up in-memory SQLite databases with migrations applied and provides
//! fixture helpers for integrations, runs and streams.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use ingest::models::{WorkState, integration, queue_message};
use ingest::queue::{DatabaseQueue, QueueName};
use ingest::repositories::{RunRepository, StreamRepository};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, Statement,
};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    // SQLite does not enforce our Postgres foreign key semantics; disable FK
    // checks so fixtures may be inserted without full relation chains.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(Arc::new(db))
}

/// Queue client over the test database with a short visibility timeout.
#[allow(dead_code)]
pub fn test_queue(db: &Arc<DatabaseConnection>) -> Arc<DatabaseQueue> {
    Arc::new(DatabaseQueue::new(db.clone(), Duration::from_millis(200)))
}

/// Inserts an integration row for the given platform.
#[allow(dead_code)]
pub async fn insert_integration(
    db: &Arc<DatabaseConnection>,
    platform: &str,
    settings: JsonValue,
) -> Result<integration::Model> {
    let now = Utc::now().fixed_offset();

    let model = integration::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(Uuid::new_v4()),
        platform: Set(platform.to_string()),
        identifier: Set(None),
        status: Set("active".to_string()),
        settings: Set(settings),
        deleted_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    Ok(model.insert(db.as_ref()).await?)
}

/// Creates a pending run for the integration.
#[allow(dead_code)]
pub async fn insert_run(
    db: &Arc<DatabaseConnection>,
    integration: &integration::Model,
    onboarding: bool,
) -> Result<ingest::models::run::Model> {
    Ok(RunRepository::new(db.clone())
        .create(integration, onboarding)
        .await?)
}

/// Creates a processing run with one pending root stream, the usual
/// starting point for stream worker tests.
#[allow(dead_code)]
pub async fn insert_processing_run_with_stream(
    db: &Arc<DatabaseConnection>,
    integration: &integration::Model,
    identifier: &str,
    data: Option<JsonValue>,
) -> Result<(ingest::models::run::Model, ingest::models::stream::Model)> {
    let runs = RunRepository::new(db.clone());
    let streams = StreamRepository::new(db.clone());

    let run = runs.create(integration, false).await?;
    runs.mark_processing(run.id).await?;
    let run = runs.find_by_id(run.id).await?.expect("run exists");

    let stream = streams
        .create_root(&run, identifier, data)
        .await?
        .expect("stream created");

    Ok((run, stream))
}

/// Number of messages currently on a queue, regardless of visibility.
#[allow(dead_code)]
pub async fn queue_depth(db: &Arc<DatabaseConnection>, queue: QueueName) -> Result<u64> {
    Ok(queue_message::Entity::find()
        .filter(queue_message::Column::Queue.eq(queue.as_str()))
        .count(db.as_ref())
        .await?)
}

/// Default sample-ish settings used where the contents do not matter.
#[allow(dead_code)]
pub fn default_settings() -> JsonValue {
    json!({"posts": [], "lastSync": null})
}

/// Asserts a work state, with a readable failure message.
#[allow(dead_code)]
pub fn assert_state(actual: WorkState, expected: WorkState, what: &str) {
    assert_eq!(actual, expected, "{what} should be {expected:?}");
}
