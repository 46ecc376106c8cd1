//! Migration to create the integration_data table.
//!
//! A data row is one record produced by a stream, waiting to be normalized
//! into the sink by the data worker.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IntegrationData::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IntegrationData::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IntegrationData::StreamId).uuid().not_null())
                    .col(ColumnDef::new(IntegrationData::RunId).uuid().not_null())
                    .col(ColumnDef::new(IntegrationData::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(IntegrationData::Data)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationData::State)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(IntegrationData::Retries)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(IntegrationData::Error).json_binary().null())
                    .col(
                        ColumnDef::new(IntegrationData::DelayedUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationData::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(IntegrationData::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IntegrationData::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integration_data_stream_id")
                            .from(IntegrationData::Table, IntegrationData::StreamId)
                            .to(IntegrationStreams::Table, IntegrationStreams::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integration_data_run_id")
                            .from(IntegrationData::Table, IntegrationData::RunId)
                            .to(IntegrationRuns::Table, IntegrationRuns::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integration_data_run_state")
                    .table(IntegrationData::Table)
                    .col(IntegrationData::RunId)
                    .col(IntegrationData::State)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integration_data_state_delayed_until")
                    .table(IntegrationData::Table)
                    .col(IntegrationData::State)
                    .col(IntegrationData::DelayedUntil)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integration_data_run_state")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_integration_data_state_delayed_until")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(IntegrationData::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IntegrationData {
    Table,
    Id,
    StreamId,
    RunId,
    TenantId,
    Data,
    State,
    Retries,
    Error,
    DelayedUntil,
    ProcessedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum IntegrationStreams {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum IntegrationRuns {
    Table,
    Id,
}
