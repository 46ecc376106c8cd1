//! # Data Models
//!
//! SeaORM entity models for the pipeline tables, plus the shared state enum
//! that runs, streams and data rows move through.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub mod cache_entry;
pub mod data;
pub mod integration;
pub mod queue_message;
pub mod run;
pub mod stream;

pub use cache_entry::Entity as CacheEntry;
pub use data::Entity as Data;
pub use integration::Entity as Integration;
pub use queue_message::Entity as QueueMessage;
pub use run::Entity as Run;
pub use stream::{Entity as Stream, StreamKind};

/// Lifecycle state shared by runs, streams and data rows.
///
/// Transitions form a one-way lattice: `pending -> processing ->
/// (processed | error | delayed)` and `delayed -> pending/processing` via the
/// sweeper. `processed` and `error` are terminal. Every transition is guarded
/// on the current state in the `WHERE` clause so late writers lose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "delayed")]
    Delayed,
    #[sea_orm(string_value = "error")]
    Error,
    #[sea_orm(string_value = "processed")]
    Processed,
}

impl WorkState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::Processed | WorkState::Error)
    }

    /// States that count as open work when deciding run finalization.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkState::Processed.is_terminal());
        assert!(WorkState::Error.is_terminal());
        assert!(!WorkState::Pending.is_terminal());
        assert!(!WorkState::Processing.is_terminal());
        assert!(!WorkState::Delayed.is_terminal());
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let json = serde_json::to_string(&WorkState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
