//! Stream entity model
//!
//! A unit of paginated or hierarchical traversal under a run. Root streams
//! are seeded by `generate_streams`; children carry a `parent_id` and are
//! published by `process_stream`. `(run_id, identifier)` is unique so
//! republishing an identifier under the same run is a no-op.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::WorkState;

/// Derived stream type: root iff the stream has no parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Root,
    Child,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "integration_streams")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub run_id: Uuid,

    /// Parent stream; `None` marks a root stream
    pub parent_id: Option<Uuid>,

    pub tenant_id: Uuid,

    pub integration_id: Uuid,

    /// Handler-chosen identifier, unique per run
    pub identifier: String,

    /// Opaque handler state, e.g. a pagination cursor
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub data: Option<JsonValue>,

    pub state: WorkState,

    pub delayed_until: Option<DateTimeWithTimeZone>,

    /// Failed attempts so far; only ever increases
    pub retries: i32,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub error: Option<JsonValue>,

    pub processed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn kind(&self) -> StreamKind {
        if self.parent_id.is_none() {
            StreamKind::Root
        } else {
            StreamKind::Child
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::run::Entity",
        from = "Column::RunId",
        to = "super::run::Column::Id"
    )]
    Run,
    #[sea_orm(has_many = "super::data::Entity")]
    Data,
}

impl Related<super::run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Run.def()
    }
}

impl Related<super::data::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Data.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
