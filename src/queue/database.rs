//! Relational queue implementation.
//!
//! Messages live in the `queue_messages` table. Receive claims the oldest
//! visible message whose group has no leased message still inside its
//! visibility window: a candidate select followed by a guarded UPDATE, so
//! two concurrent receivers cannot lease the same row. An unacknowledged
//! message becomes visible again once `visible_at` lapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::prelude::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, QueryTrait, Set, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, is_unique_violation};
use crate::models::queue_message::{ActiveModel, Column, Entity};
use crate::queue::{PipelineMessage, QueueClient, QueueName, ReceivedMessage, next_dedup_id};

/// Queue client backed by the relational store.
#[derive(Clone)]
pub struct DatabaseQueue {
    db: Arc<DatabaseConnection>,
    visibility_timeout: Duration,
}

impl DatabaseQueue {
    pub fn new(db: Arc<DatabaseConnection>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

#[async_trait::async_trait]
impl QueueClient for DatabaseQueue {
    async fn init(&self, queue: QueueName) -> Result<(), PipelineError> {
        // Schema is owned by migrations; init only verifies the backing
        // table is reachable.
        Entity::find()
            .filter(Column::Queue.eq(queue.as_str()))
            .limit(1)
            .all(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        queue: QueueName,
        group_id: &str,
        message: &PipelineMessage,
    ) -> Result<(), PipelineError> {
        let now = Utc::now().fixed_offset();
        let payload = serde_json::to_value(message)?;

        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            queue: Set(queue.as_str().to_string()),
            group_id: Set(group_id.to_string()),
            dedup_id: Set(next_dedup_id(group_id)),
            payload: Set(payload),
            visible_at: Set(now),
            receipt_handle: Set(None),
            receive_count: Set(0),
            created_at: Set(now),
        };

        match row.insert(self.db.as_ref()).await {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                debug!(queue = %queue, group_id, "duplicate dedup id, message dropped");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn receive(&self, queue: QueueName) -> Result<Option<ReceivedMessage>, PipelineError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        // Groups with a message still leased out: FIFO means they must not
        // deliver a second message until the lease resolves.
        let busy_groups = Entity::find()
            .select_only()
            .column(Column::GroupId)
            .filter(Column::Queue.eq(queue.as_str()))
            .filter(Column::ReceiptHandle.is_not_null())
            .filter(Column::VisibleAt.gt(now))
            .into_query();

        let candidate = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Queue.eq(queue.as_str()))
            .filter(Column::VisibleAt.lte(now))
            .filter(Column::GroupId.not_in_subquery(busy_groups))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::DedupId)
            .limit(1)
            .into_tuple::<Uuid>()
            .one(&txn)
            .await?;

        let Some(message_id) = candidate else {
            txn.commit().await?;
            return Ok(None);
        };

        let receipt_handle = Uuid::new_v4();
        let visible_at = now
            + chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        // Guarded on visibility so a racing receiver loses.
        let update = Entity::update_many()
            .col_expr(Column::VisibleAt, Expr::value(visible_at))
            .col_expr(Column::ReceiptHandle, Expr::value(receipt_handle))
            .col_expr(
                Column::ReceiveCount,
                Expr::value(Expr::col(Column::ReceiveCount).add(1)),
            )
            .filter(Column::Id.eq(message_id))
            .filter(Column::VisibleAt.lte(now))
            .exec(&txn)
            .await?;

        if update.rows_affected == 0 {
            txn.commit().await?;
            return Ok(None);
        }

        let row = Entity::find_by_id(message_id).one(&txn).await?;
        txn.commit().await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message: PipelineMessage = serde_json::from_value(row.payload.clone())
            .map_err(|_| PipelineError::UnknownMessage(row.payload.to_string()))?;

        Ok(Some(ReceivedMessage {
            message,
            receipt_handle,
            receive_count: row.receive_count,
        }))
    }

    async fn delete_message(
        &self,
        queue: QueueName,
        receipt_handle: Uuid,
    ) -> Result<(), PipelineError> {
        let deleted = Entity::delete_many()
            .filter(Column::Queue.eq(queue.as_str()))
            .filter(Column::ReceiptHandle.eq(receipt_handle))
            .exec(self.db.as_ref())
            .await?;

        if deleted.rows_affected == 0 {
            // Expired receipt or double ack; both are harmless.
            debug!(queue = %queue, %receipt_handle, "delete matched no message");
        }

        Ok(())
    }
}
