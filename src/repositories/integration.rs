//! # Integration Repository
//!
//! Lookups for live integrations and the server-side settings merge.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, Set, Statement, TransactionTrait, Value,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::integration::{ActiveModel, Column, Entity, Model};

/// Repository for integration rows.
pub struct IntegrationRepository {
    db: Arc<DatabaseConnection>,
}

impl IntegrationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Loads an integration unless it has been soft-deleted.
    pub async fn find_active(&self, integration_id: Uuid) -> Result<Option<Model>, PipelineError> {
        Ok(Entity::find_by_id(integration_id)
            .filter(Column::DeletedAt.is_null())
            .one(self.db.as_ref())
            .await?)
    }

    /// Merges `partial` into the integration settings, shallow at the top
    /// level: each key in `partial` replaces that key wholesale, other keys
    /// stay untouched. On Postgres the merge runs server-side
    /// (`settings || $partial`) so sibling streams updating different keys
    /// do not clobber each other; elsewhere an equivalent transactional
    /// read-merge-write keeps the same contract.
    pub async fn update_settings(
        &self,
        integration_id: Uuid,
        partial: &JsonValue,
    ) -> Result<(), PipelineError> {
        let now = Utc::now().fixed_offset();

        match self.db.get_database_backend() {
            DatabaseBackend::Postgres => {
                self.db
                    .execute(Statement::from_sql_and_values(
                        DatabaseBackend::Postgres,
                        "UPDATE integrations SET settings = settings || $1, updated_at = $2 \
                         WHERE id = $3 AND deleted_at IS NULL",
                        vec![
                            Value::from(partial.clone()),
                            Value::from(now),
                            Value::from(integration_id),
                        ],
                    ))
                    .await?;
                Ok(())
            }
            _ => {
                let txn = self.db.begin().await?;

                let Some(integration) = Entity::find_by_id(integration_id)
                    .filter(Column::DeletedAt.is_null())
                    .one(&txn)
                    .await?
                else {
                    txn.rollback().await?;
                    return Err(PipelineError::IntegrationNotFound(integration_id));
                };

                let merged = shallow_merge(&integration.settings, partial);

                let mut active: ActiveModel = integration.into();
                active.settings = Set(merged);
                active.updated_at = Set(now);
                active.update(&txn).await?;

                txn.commit().await?;
                Ok(())
            }
        }
    }
}

/// Shallow top-level merge matching Postgres `jsonb ||`: keys of `partial`
/// replace those of `base` wholesale; non-object operands replace entirely.
fn shallow_merge(base: &JsonValue, partial: &JsonValue) -> JsonValue {
    match (base, partial) {
        (JsonValue::Object(base_map), JsonValue::Object(partial_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in partial_map {
                merged.insert(key.clone(), value.clone());
            }
            JsonValue::Object(merged)
        }
        _ => partial.clone(),
    }
}
