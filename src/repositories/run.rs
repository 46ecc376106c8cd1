//! # Run Repository
//!
//! State transitions and finders for integration runs.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::prelude::{DateTimeWithTimeZone, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::error::{PipelineError, StepError};
use crate::models::data::{Column as DataColumn, Entity as DataEntity};
use crate::models::integration;
use crate::models::run::{ActiveModel, Column, Entity, Model};
use crate::models::stream::{Column as StreamColumn, Entity as StreamEntity};
use crate::models::WorkState;

/// Repository for run state and lifecycle queries.
pub struct RunRepository {
    db: Arc<DatabaseConnection>,
}

impl RunRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Creates a pending run for an integration.
    pub async fn create(
        &self,
        integration: &integration::Model,
        onboarding: bool,
    ) -> Result<Model, PipelineError> {
        let now = Utc::now().fixed_offset();

        let run = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(integration.tenant_id),
            integration_id: Set(integration.id),
            onboarding: Set(onboarding),
            state: Set(WorkState::Pending),
            delayed_until: Set(None),
            error: Set(None),
            processed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Ok(run.insert(self.db.as_ref()).await?)
    }

    pub async fn find_by_id(&self, run_id: Uuid) -> Result<Option<Model>, PipelineError> {
        Ok(Entity::find_by_id(run_id).one(self.db.as_ref()).await?)
    }

    /// Loads a run together with its integration.
    pub async fn find_with_integration(
        &self,
        run_id: Uuid,
    ) -> Result<Option<(Model, Option<integration::Model>)>, PipelineError> {
        Ok(Entity::find_by_id(run_id)
            .find_also_related(integration::Entity)
            .one(self.db.as_ref())
            .await?)
    }

    /// Transitions the run to processing. Allowed from pending, delayed and
    /// processing itself (resume after redelivery); terminal states refuse.
    pub async fn mark_processing(&self, run_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Processing))
            .col_expr(
                Column::DelayedUntil,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(run_id))
            .filter(Column::State.is_in([
                WorkState::Pending,
                WorkState::Delayed,
                WorkState::Processing,
            ]))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Pauses the run until `delayed_until` (rate limit).
    pub async fn mark_delayed(
        &self,
        run_id: Uuid,
        delayed_until: DateTimeWithTimeZone,
    ) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Delayed))
            .col_expr(Column::DelayedUntil, Expr::value(delayed_until))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(run_id))
            .filter(Column::State.is_in([WorkState::Pending, WorkState::Processing]))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Terminates the run as errored.
    pub async fn mark_error(&self, run_id: Uuid, error: &StepError) -> Result<bool, PipelineError> {
        set_error(self.db.as_ref(), run_id, error).await
    }

    /// Finalizes the run; only a processing run may become processed.
    pub async fn mark_processed(&self, run_id: Uuid) -> Result<bool, PipelineError> {
        let now = Utc::now().fixed_offset();
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Processed))
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(run_id))
            .filter(Column::State.eq(WorkState::Processing))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Promotes a due delayed run back to processing. Idempotent: a run no
    /// longer delayed is left alone.
    pub async fn promote_to_processing(&self, run_id: Uuid) -> Result<bool, PipelineError> {
        let updated = Entity::update_many()
            .col_expr(Column::State, Expr::value(WorkState::Processing))
            .col_expr(
                Column::DelayedUntil,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(run_id))
            .filter(Column::State.eq(WorkState::Delayed))
            .exec(self.db.as_ref())
            .await?;

        Ok(updated.rows_affected > 0)
    }

    /// Delayed runs whose pause has lapsed.
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

    /// Processing runs, oldest first; candidates for finalization.
    pub async fn processing(&self, limit: u64) -> Result<Vec<Model>, PipelineError> {
        Ok(Entity::find()
            .filter(Column::State.eq(WorkState::Processing))
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?)
    }

    /// True while any descendant stream or data row is still open.
    pub async fn has_open_work(&self, run_id: Uuid) -> Result<bool, PipelineError> {
        let open_streams = StreamEntity::find()
            .filter(StreamColumn::RunId.eq(run_id))
            .filter(StreamColumn::State.is_in([
                WorkState::Pending,
                WorkState::Processing,
                WorkState::Delayed,
            ]))
            .count(self.db.as_ref())
            .await?;

        if open_streams > 0 {
            return Ok(true);
        }

        let open_data = DataEntity::find()
            .filter(DataColumn::RunId.eq(run_id))
            .filter(DataColumn::State.is_in([
                WorkState::Pending,
                WorkState::Processing,
                WorkState::Delayed,
            ]))
            .count(self.db.as_ref())
            .await?;

        Ok(open_data > 0)
    }

    /// Number of streams ever created under the run (resume detection).
    pub async fn stream_count(&self, run_id: Uuid) -> Result<u64, PipelineError> {
        Ok(StreamEntity::find()
            .filter(StreamColumn::RunId.eq(run_id))
            .count(self.db.as_ref())
            .await?)
    }
}

/// Guarded error transition, usable inside a caller-owned transaction.
pub(crate) async fn set_error<C: ConnectionTrait>(
    conn: &C,
    run_id: Uuid,
    error: &StepError,
) -> Result<bool, PipelineError> {
    let updated = Entity::update_many()
        .col_expr(Column::State, Expr::value(WorkState::Error))
        .col_expr(Column::Error, Expr::value(error.to_json()))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
        .filter(Column::Id.eq(run_id))
        .filter(Column::State.is_in([
            WorkState::Pending,
            WorkState::Processing,
            WorkState::Delayed,
        ]))
        .exec(conn)
        .await?;

    Ok(updated.rows_affected > 0)
}
