//! Integration entity model
//!
//! One row per configured connection between a tenant and an external
//! platform. `settings` is the mutable JSON blob platform services use for
//! incremental watermarks; rows are soft-deleted via `deleted_at`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Platform slug selecting the service triple (e.g. "discord", "github")
    pub platform: String,

    /// Optional stable external identifier (e.g. a guild or org id)
    pub identifier: Option<String>,

    /// Integration status (e.g. active, paused)
    pub status: String,

    /// Mutable per-integration settings, merged shallowly by handlers
    #[sea_orm(column_type = "JsonBinary")]
    pub settings: JsonValue,

    /// Soft-delete marker; deleted integrations refuse new work
    pub deleted_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::run::Entity")]
    Runs,
}

impl Related<super::run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Runs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
