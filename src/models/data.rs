//! Data entity model
//!
//! A record produced by a stream, waiting for the data worker to normalize
//! it into the sink.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::WorkState;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "integration_data")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub stream_id: Uuid,

    pub run_id: Uuid,

    pub tenant_id: Uuid,

    /// Opaque payload emitted by the stream handler
    #[sea_orm(column_type = "JsonBinary")]
    pub data: JsonValue,

    pub state: WorkState,

    pub retries: i32,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub error: Option<JsonValue>,

    pub delayed_until: Option<DateTimeWithTimeZone>,

    pub processed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::stream::Entity",
        from = "Column::StreamId",
        to = "super::stream::Column::Id"
    )]
    Stream,
    #[sea_orm(
        belongs_to = "super::run::Entity",
        from = "Column::RunId",
        to = "super::run::Column::Id"
    )]
    Run,
}

impl Related<super::stream::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Stream.def()
    }
}

impl Related<super::run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Run.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
