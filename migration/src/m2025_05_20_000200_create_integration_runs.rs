//! Migration to create the integration_runs table.
//!
//! A run is one execution of an integration for a tenant, tracked through
//! pending/processing/delayed/error/processed states with a structured error
//! column and a delay timestamp for rate-limit pauses.

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
                    .table(IntegrationRuns::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IntegrationRuns::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IntegrationRuns::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(IntegrationRuns::IntegrationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationRuns::Onboarding)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(IntegrationRuns::State)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(IntegrationRuns::DelayedUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(IntegrationRuns::Error).json_binary().null())
                    .col(
                        ColumnDef::new(IntegrationRuns::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationRuns::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IntegrationRuns::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integration_runs_integration_id")
                            .from(IntegrationRuns::Table, IntegrationRuns::IntegrationId)
                            .to(Integrations::Table, Integrations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Sweeper scans delayed runs by due time.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_integration_runs_state_delayed_until \
                 ON integration_runs (state, delayed_until)"
                    .to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integration_runs_integration_state")
                    .table(IntegrationRuns::Table)
                    .col(IntegrationRuns::IntegrationId)
                    .col(IntegrationRuns::State)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integration_runs_state_delayed_until")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_integration_runs_integration_state")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(IntegrationRuns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IntegrationRuns {
    Table,
    Id,
    TenantId,
    IntegrationId,
    Onboarding,
    State,
    DelayedUntil,
    Error,
    ProcessedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
}
