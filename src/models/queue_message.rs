//! Queue message entity model
//!
//! One row per queued or in-flight message. A message is leased by stamping
//! `visible_at` into the future together with a fresh `receipt_handle`;
//! deleting by receipt handle acknowledges it.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "queue_messages")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Logical queue name (runs, streams, data)
    pub queue: String,

    /// FIFO group; the pipeline uses the tenant id
    pub group_id: String,

    /// Per-send deduplication id, unique per queue
    pub dedup_id: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Message is deliverable once `visible_at <= now`
    pub visible_at: DateTimeWithTimeZone,

    /// Lease token of the current receiver, if any
    pub receipt_handle: Option<Uuid>,

    pub receive_count: i32,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
