//! Run-scoped cache.
//!
//! Namespaced key/value store with TTL over the `cache_entries` table.
//! Handlers get a [`RunCache`] namespaced to `run-{run_id}` and use it to
//! memoize external lookups across the streams of one run; writes are
//! idempotent upserts so concurrent streams may set the same key freely.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::cache_entry::{ActiveModel, Column, Entity};

/// Factory handing out per-run cache handles.
#[derive(Clone)]
pub struct CacheStore {
    db: Arc<DatabaseConnection>,
}

impl CacheStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Cache handle scoped to one run.
    pub fn for_run(&self, run_id: Uuid) -> RunCache {
        RunCache {
            db: self.db.clone(),
            namespace: format!("run-{run_id}"),
        }
    }

    /// Drops expired entries; called opportunistically by the sweeper.
    pub async fn evict_expired(&self) -> Result<u64, PipelineError> {
        let now = Utc::now().fixed_offset();
        let deleted = Entity::delete_many()
            .filter(Column::ExpiresAt.lte(now))
            .exec(self.db.as_ref())
            .await?;
        Ok(deleted.rows_affected)
    }
}

/// Key/value cache namespaced to a single run.
#[derive(Clone)]
pub struct RunCache {
    db: Arc<DatabaseConnection>,
    namespace: String,
}

impl RunCache {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fetches a value; expired entries read as absent.
    pub async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let entry = Entity::find_by_id((self.namespace.clone(), key.to_string()))
            .one(self.db.as_ref())
            .await?;

        let now = Utc::now().fixed_offset();
        Ok(entry.filter(|e| e.expires_at > now).map(|e| e.value))
    }

    /// Stores a value with a TTL, replacing any previous entry.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PipelineError> {
        let expires_at = Utc::now().fixed_offset()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));

        let row = ActiveModel {
            namespace: Set(self.namespace.clone()),
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            expires_at: Set(expires_at),
        };

        Entity::insert(row)
            .on_conflict(
                OnConflict::columns([Column::Namespace, Column::Key])
                    .update_columns([Column::Value, Column::ExpiresAt])
                    .to_owned(),
            )
            .exec(self.db.as_ref())
            .await?;

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        Entity::delete_many()
            .filter(Column::Namespace.eq(self.namespace.clone()))
            .filter(Column::Key.eq(key))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }
}
