//! Database migrations for the ingest pipeline.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_05_20_000100_create_integrations;
mod m2025_05_20_000200_create_integration_runs;
mod m2025_05_20_000300_create_integration_streams;
mod m2025_05_20_000400_create_integration_data;
mod m2025_05_20_000500_create_queue_messages;
mod m2025_05_20_000600_create_cache_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_05_20_000100_create_integrations::Migration),
            Box::new(m2025_05_20_000200_create_integration_runs::Migration),
            Box::new(m2025_05_20_000300_create_integration_streams::Migration),
            Box::new(m2025_05_20_000400_create_integration_data::Migration),
            Box::new(m2025_05_20_000500_create_queue_messages::Migration),
            Box::new(m2025_05_20_000600_create_cache_entries::Migration),
        ]
    }
}
