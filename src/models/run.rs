//! Run entity model
//!
//! One execution of an integration. Runs fan out into streams; the sweeper
//! finalizes a processing run once no descendant stream or data row is open.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::WorkState;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "integration_runs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub integration_id: Uuid,

    /// First run for the integration; handlers may fetch deeper history
    pub onboarding: bool,

    pub state: WorkState,

    /// When a rate-limited run becomes eligible for promotion
    pub delayed_until: Option<DateTimeWithTimeZone>,

    /// Structured `{location, message, metadata}` error, if any
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub error: Option<JsonValue>,

    pub processed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::integration::Entity",
        from = "Column::IntegrationId",
        to = "super::integration::Column::Id"
    )]
    Integration,
    #[sea_orm(has_many = "super::stream::Entity")]
    Streams,
}

impl Related<super::integration::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Integration.def()
    }
}

impl Related<super::stream::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Streams.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
