//! Migration to create the integration_streams table.
//!
//! A stream is one unit of paginated or hierarchical traversal under a run.
//! Children reference their parent stream; `(run_id, identifier)` is unique
//! so republishing the same child is a no-op.

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
                    .table(IntegrationStreams::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IntegrationStreams::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IntegrationStreams::RunId).uuid().not_null())
                    .col(ColumnDef::new(IntegrationStreams::ParentId).uuid().null())
                    .col(
                        ColumnDef::new(IntegrationStreams::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::IntegrationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::Identifier)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IntegrationStreams::Data).json_binary().null())
                    .col(
                        ColumnDef::new(IntegrationStreams::State)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::DelayedUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::Retries)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::Error)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IntegrationStreams::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integration_streams_run_id")
                            .from(IntegrationStreams::Table, IntegrationStreams::RunId)
                            .to(IntegrationRuns::Table, IntegrationRuns::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Republished children dedupe on this; the queue message for the
        // duplicate is never sent.
        manager
            .create_index(
                Index::create()
                    .name("uq_integration_streams_run_identifier")
                    .table(IntegrationStreams::Table)
                    .col(IntegrationStreams::RunId)
                    .col(IntegrationStreams::Identifier)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_integration_streams_state_delayed_until \
                 ON integration_streams (state, delayed_until)"
                    .to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integration_streams_run_state")
                    .table(IntegrationStreams::Table)
                    .col(IntegrationStreams::RunId)
                    .col(IntegrationStreams::State)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("uq_integration_streams_run_identifier")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_integration_streams_state_delayed_until")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_integration_streams_run_state")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(IntegrationStreams::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IntegrationStreams {
    Table,
    Id,
    RunId,
    ParentId,
    TenantId,
    IntegrationId,
    Identifier,
    Data,
    State,
    DelayedUntil,
    Retries,
    Error,
    ProcessedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum IntegrationRuns {
    Table,
    Id,
}
