//! # Stream Repository
//!
//! Creation with per-run identifier dedupe, guarded state transitions and
//! the combined stream-plus-run error applied in one transaction.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::prelude::{DateTimeWithTimeZone, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, StepError, is_unique_violation};
use crate::models::WorkState;
use crate::models::run;
use crate::models::stream::{ActiveModel, Column, Entity, Model};
use crate::repositories::run as run_repo;

/// Repository for stream state and traversal queries.
pub struct StreamRepository {
    db: Arc<DatabaseConnection>,
}

impl StreamRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts a root stream under a run. Returns `None` when the identifier
    /// already exists for the run (republish is a no-op).
    pub async fn create_root(
        &self,
        run: &run::Model,
        identifier: &str,
        data: Option<JsonValue>,
    ) -> Result<Option<Model>, PipelineError> {
        self.insert(run, None, identifier, data).await
    }

    /// Inserts a child stream under the given parent, same dedupe rule.
    pub async fn create_child(
        &self,
        run: &run::Model,
        parent_id: Uuid,
        identifier: &str,
        data: Option<JsonValue>,
    ) -> Result<Option<Model>, PipelineError> {
        self.insert(run, Some(parent_id), identifier, data).await
    }

    async fn insert(
        &self,
        run: &run::Model,
        parent_id: Option<Uuid>,
        identifier: &str,
        data: Option<JsonValue>,
    ) -> Result<Option<Model>, PipelineError> {
        let now = Utc::now().fixed_offset();

        let stream = ActiveModel {
            id: Set(Uuid::new_v4()),
            run_id: Set(run.id),
            parent_id: Set(parent_id),
            tenant_id: Set(run.tenant_id),
            integration_id: Set(run.integration_id),
            identifier: Set(identifier.to_string()),
            data: Set(data),
            state: Set(WorkState::Pending),
            delayed_until: Set(None),
            retries: Set(0),
            error: Set(None),
            processed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match stream.insert(self.db.as_ref()).await {
            Ok(model) => Ok(Some(model)),
            Err(err) if is_unique_violation(&err) => {
                debug!(run_id = %run.id, identifier, "stream identifier already present, skipping");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_by_id(&self, stream_id: Uuid) -> Result<Option<Model>, PipelineError> {
        Ok(Entity::find_by_id(stream_id).one(self.db.as_ref()).await?)
    }

    /// Loads a stream together with its run.
    pub async fn find_with_run(
        &self,
        stream_id: Uuid,
    ) -> Result<Option<(Model, Option<run::Model>)>, PipelineError> {
        Ok(Entity::find_by_id(stream_id)
            .find_also_related(run::Entity)
            .one(self.db.as_ref())
            .await?)
    }

    /// Claims the stream for processing. Allowed from pending and from
    /// processing itself (a crashed worker's message redelivers after the
    /// visibility timeout and the unit re-runs). Delayed and terminal
    /// states refuse the claim.
    pub async fn mark_processing(&self, stream_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Processing))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(stream_id))
            .filter(Column::State.is_in([WorkState::Pending, WorkState::Processing]))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    pub async fn mark_processed(&self, stream_id: Uuid) -> Result<bool, PipelineError> {
        let now = Utc::now().fixed_offset();
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Processed))
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(stream_id))
            .filter(Column::State.eq(WorkState::Processing))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Rate-limit path: back to pending without consuming the retry budget.
    pub async fn reset_to_pending(&self, stream_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Pending))
            .col_expr(
                Column::DelayedUntil,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(stream_id))
            .filter(Column::State.is_in([WorkState::Processing, WorkState::Delayed]))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Transient-failure path: record the error, bump retries and park the
    /// stream until `delayed_until`.
    pub async fn delay_for_retry(
        &self,
        stream_id: Uuid,
        retries: i32,
        delayed_until: DateTimeWithTimeZone,
        error: &StepError,
    ) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Delayed))
            .col_expr(Column::Retries, Expr::value(retries))
            .col_expr(Column::DelayedUntil, Expr::value(delayed_until))
            .col_expr(Column::Error, Expr::value(error.to_json()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(stream_id))
            .filter(Column::State.eq(WorkState::Processing))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Terminates the stream as errored.
    pub async fn mark_error(
        &self,
        stream_id: Uuid,
        error: &StepError,
    ) -> Result<bool, PipelineError> {
        set_error(self.db.as_ref(), stream_id, error, None).await
    }

    /// Retry exhaustion and run aborts: stream error and run error applied
    /// in the same transaction.
    pub async fn mark_error_and_stop_run(
        &self,
        stream_id: Uuid,
        retries: Option<i32>,
        stream_error: &StepError,
        run_id: Uuid,
        run_error: &StepError,
    ) -> Result<(), PipelineError> {
        let txn = self.db.begin().await?;
        set_error(&txn, stream_id, stream_error, retries).await?;
        run_repo::set_error(&txn, run_id, run_error).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Promotes a due delayed stream back to pending. Idempotent.
    pub async fn promote_to_pending(&self, stream_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Pending))
            .col_expr(
                Column::DelayedUntil,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(stream_id))
            .filter(Column::State.eq(WorkState::Delayed))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Delayed streams whose backoff has lapsed.
    pub async fn due_delayed(
        &self,
        now: DateTimeWithTimeZone,
        limit: u64,
    ) -> Result<Vec<Model>, PipelineError> {
        Ok(Entity::find()
            .filter(Column::State.eq(WorkState::Delayed))
            .filter(Column::DelayedUntil.lte(now))
            .order_by_asc(Column::DelayedUntil)
            .limit(limit)
            .all(self.db.as_ref())
            .await?)
    }

    /// Pending streams of a run, oldest first (resume re-drive).
    pub async fn pending_for_run(&self, run_id: Uuid) -> Result<Vec<Model>, PipelineError> {
        Ok(Entity::find()
            .filter(Column::RunId.eq(run_id))
            .filter(Column::State.eq(WorkState::Pending))
            .order_by_asc(Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }
}

/// Guarded error transition, usable inside a caller-owned transaction.
/// `retries` optionally records the final attempt count.
pub(crate) async fn set_error<C: ConnectionTrait>(
    conn: &C,
    stream_id: Uuid,
    error: &StepError,
    retries: Option<i32>,
) -> Result<bool, PipelineError> {
    let mut update = Entity::update_many()
        .col_expr(Column::State, Expr::value(WorkState::Error))
        .col_expr(Column::Error, Expr::value(error.to_json()))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()));

    if let Some(retries) = retries {
        update = update.col_expr(Column::Retries, Expr::value(retries));
    }

    let updated = update
        .filter(Column::Id.eq(stream_id))
        .filter(Column::State.is_in([
            WorkState::Pending,
            WorkState::Processing,
            WorkState::Delayed,
        ]))
        .exec(conn)
        .await?;

    Ok(updated.rows_affected > 0)
}
