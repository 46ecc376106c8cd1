//! # Data Repository
//!
//! State transitions for produced records awaiting sink ingestion. Mirrors
//! the stream transitions one level down, with its own retry cap.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::prelude::{DateTimeWithTimeZone, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{PipelineError, StepError};
use crate::models::WorkState;
use crate::models::data::{ActiveModel, Column, Entity, Model};
use crate::models::{run, stream};
use crate::repositories::run as run_repo;

/// Repository for data-record state.
pub struct DataRepository {
    db: Arc<DatabaseConnection>,
}

impl DataRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts a pending data record produced by a stream.
    pub async fn create(
        &self,
        stream: &stream::Model,
        payload: JsonValue,
    ) -> Result<Model, PipelineError> {
        let now = Utc::now().fixed_offset();

        let record = ActiveModel {
            id: Set(Uuid::new_v4()),
            stream_id: Set(stream.id),
            run_id: Set(stream.run_id),
            tenant_id: Set(stream.tenant_id),
            data: Set(payload),
            state: Set(WorkState::Pending),
            retries: Set(0),
            error: Set(None),
            delayed_until: Set(None),
            processed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Ok(record.insert(self.db.as_ref()).await?)
    }

    pub async fn find_by_id(&self, data_id: Uuid) -> Result<Option<Model>, PipelineError> {
        Ok(Entity::find_by_id(data_id).one(self.db.as_ref()).await?)
    }

    /// Loads a data record together with its run.
    pub async fn find_with_run(
        &self,
        data_id: Uuid,
    ) -> Result<Option<(Model, Option<run::Model>)>, PipelineError> {
        Ok(Entity::find_by_id(data_id)
            .find_also_related(run::Entity)
            .one(self.db.as_ref())
            .await?)
    }

    /// Claims the record for processing; same rules as streams.
    pub async fn mark_processing(&self, data_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Processing))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(data_id))
            .filter(Column::State.is_in([WorkState::Pending, WorkState::Processing]))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    pub async fn mark_processed(&self, data_id: Uuid) -> Result<bool, PipelineError> {
        let now = Utc::now().fixed_offset();
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Processed))
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(data_id))
            .filter(Column::State.eq(WorkState::Processing))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Rate-limit path: back to pending, retry budget untouched.
    pub async fn reset_to_pending(&self, data_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Pending))
            .col_expr(
                Column::DelayedUntil,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(data_id))
            .filter(Column::State.is_in([WorkState::Processing, WorkState::Delayed]))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Transient-failure path: record the error, bump retries, park.
    pub async fn delay_for_retry(
        &self,
        data_id: Uuid,
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
            .filter(Column::Id.eq(data_id))
            .filter(Column::State.eq(WorkState::Processing))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    pub async fn mark_error(&self, data_id: Uuid, error: &StepError) -> Result<bool, PipelineError> {
        set_error(self.db.as_ref(), data_id, error, None).await
    }

    /// Retry exhaustion: data error and run error in one transaction.
    pub async fn mark_error_and_stop_run(
        &self,
        data_id: Uuid,
        retries: Option<i32>,
        data_error: &StepError,
        run_id: Uuid,
        run_error: &StepError,
    ) -> Result<(), PipelineError> {
        let txn = self.db.begin().await?;
        set_error(&txn, data_id, data_error, retries).await?;
        run_repo::set_error(&txn, run_id, run_error).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Promotes a due delayed record back to pending. Idempotent.
    pub async fn promote_to_pending(&self, data_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Pending))
            .col_expr(
                Column::DelayedUntil,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(data_id))
            .filter(Column::State.eq(WorkState::Delayed))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Delayed records whose backoff has lapsed.
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
}

pub(crate) async fn set_error<C: ConnectionTrait>(
    conn: &C,
    data_id: Uuid,
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
        .filter(Column::Id.eq(data_id))
        .filter(Column::State.is_in([
            WorkState::Pending,
            WorkState::Processing,
            WorkState::Delayed,
        ]))
        .exec(conn)
        .await?;

    Ok(updated.rows_affected > 0)
}
