//! Migration to create the queue_messages table.
//!
//! Backing store for the FIFO work queue: one row per in-flight or waiting
//! message, leased via `visible_at` + `receipt_handle`. `(queue, dedup_id)`
//! is unique so a repeated dedup id drops the duplicate send.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueueMessages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QueueMessages::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(QueueMessages::Queue).text().not_null())
                    .col(ColumnDef::new(QueueMessages::GroupId).text().not_null())
                    .col(ColumnDef::new(QueueMessages::DedupId).text().not_null())
                    .col(
                        ColumnDef::new(QueueMessages::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QueueMessages::VisibleAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(QueueMessages::ReceiptHandle).uuid().null())
                    .col(
                        ColumnDef::new(QueueMessages::ReceiveCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueueMessages::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_queue_messages_queue_dedup")
                    .table(QueueMessages::Table)
                    .col(QueueMessages::Queue)
                    .col(QueueMessages::DedupId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Receive scans the oldest visible message per queue.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_queue_messages_queue_visible_created \
                 ON queue_messages (queue, visible_at, created_at)"
                    .to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_queue_messages_queue_group")
                    .table(QueueMessages::Table)
                    .col(QueueMessages::Queue)
                    .col(QueueMessages::GroupId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("uq_queue_messages_queue_dedup")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_queue_messages_queue_visible_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_queue_messages_queue_group")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(QueueMessages::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QueueMessages {
    Table,
    Id,
    Queue,
    GroupId,
    DedupId,
    Payload,
    VisibleAt,
    ReceiptHandle,
    ReceiveCount,
    CreatedAt,
}
