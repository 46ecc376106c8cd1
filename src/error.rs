//! # Error Handling
//!
//! Error types for the pipeline: the structured `StepError` persisted on
//! runs, streams and data rows; the `HandlerError` platform services return
//! to signal rate limits and aborts; and the infrastructure-level
//! `PipelineError` used by repositories, the queue client and the workers.

use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::platforms::registry::RegistryError;

/// Well-known `location` values recorded in entity error columns.
pub mod locations {
    pub const RUN_CHECK_INTEGRATION: &str = "run-check-integration";
    pub const RUN_RESOLVE_SERVICE: &str = "run-resolve-service";
    pub const RUN_GENERATE_STREAMS: &str = "run-generate-streams";
    pub const CHECK_STREAM_RUN_STATE: &str = "check-stream-run-state";
    pub const STREAM_CHECK_INTEGRATION: &str = "stream-check-integration";
    pub const STREAM_RESOLVE_SERVICE: &str = "stream-resolve-service";
    pub const STREAM_PROCESS: &str = "stream-process";
    pub const STREAM_RUN_STOP: &str = "stream-run-stop";
    pub const STREAM_RUN_ABORT: &str = "stream-run-abort";
    pub const CHECK_DATA_RUN_STATE: &str = "check-data-run-state";
    pub const DATA_CHECK_INTEGRATION: &str = "data-check-integration";
    pub const DATA_RESOLVE_SERVICE: &str = "data-resolve-service";
    pub const DATA_PROCESS: &str = "data-process";
    pub const DATA_RUN_STOP: &str = "data-run-stop";
    pub const DATA_RUN_ABORT: &str = "data-run-abort";
}

/// Structured error persisted in the `error` column of runs, streams and
/// data rows. The UI surfaces this shape without reformatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Where in the pipeline the failure happened (see [`locations`])
    pub location: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl StepError {
    pub fn new<L: Into<String>, M: Into<String>>(location: L, message: M) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// JSON value for the entity `error` column.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "location": self.location,
                "message": self.message,
            })
        })
    }
}

/// Error a platform service returns from `generate_streams`,
/// `process_stream` or `process_data`. The worker translates each variant
/// into the matching state transition.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The upstream API rate-limited us; pause the whole run and retry the
    /// unit without consuming its retry budget.
    #[error("rate limited, reset in {reset_seconds}s")]
    RateLimit { reset_seconds: u64 },

    /// Terminate this unit as errored; the run continues.
    #[error("handler aborted: {message}")]
    Abort {
        message: String,
        metadata: Option<JsonValue>,
    },

    /// Terminate the owning run as errored; remaining work under the run
    /// short-circuits at pickup.
    #[error("handler aborted run: {message}")]
    AbortRun {
        message: String,
        metadata: Option<JsonValue>,
    },

    /// The platform does not implement this operation.
    #[error("platform '{platform}' does not support {operation}")]
    Unsupported {
        platform: String,
        operation: &'static str,
    },

    /// Anything else; consumes one retry.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn abort<M: Into<String>>(message: M) -> Self {
        Self::Abort {
            message: message.into(),
            metadata: None,
        }
    }

    pub fn abort_run<M: Into<String>>(message: M) -> Self {
        Self::AbortRun {
            message: message.into(),
            metadata: None,
        }
    }
}

impl From<PipelineError> for HandlerError {
    fn from(err: PipelineError) -> Self {
        Self::Other(anyhow::Error::new(err))
    }
}

/// Infrastructure-level failures: database, serialization, missing rows.
/// These are not persisted on entities; a worker returning one leaves the
/// queue message unacked so the visibility timeout re-drives the unit.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("integration {0} not found")]
    IntegrationNotFound(Uuid),

    #[error("queue message payload is not a known message type: {0}")]
    UnknownMessage(String),
}

/// True when a database error is a unique-constraint violation (Postgres
/// `23505`, SQLite `2067`/`1555`). Used to turn duplicate inserts into
/// no-ops for stream identifiers and queue dedup ids.
pub fn is_unique_violation(err: &DbErr) -> bool {
    use sea_orm::RuntimeErr;

    let runtime_err = match err {
        DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => e,
        _ => return false,
    };

    match runtime_err {
        sea_orm::SqlxError::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("23505") | Some("2067") | Some("1555")
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_error_round_trips_through_json() {
        let err = StepError::new(locations::STREAM_RUN_STOP, "retries exhausted")
            .with_metadata(json!({"retries": 3}));

        let value = err.to_json();
        assert_eq!(value["location"], "stream-run-stop");
        assert_eq!(value["message"], "retries exhausted");
        assert_eq!(value["metadata"]["retries"], 3);

        let parsed: StepError = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn step_error_omits_empty_metadata() {
        let value = StepError::new(locations::STREAM_PROCESS, "boom").to_json();
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn handler_error_display() {
        let err = HandlerError::RateLimit { reset_seconds: 60 };
        assert_eq!(err.to_string(), "rate limited, reset in 60s");

        let err = HandlerError::abort("bad credentials");
        assert_eq!(err.to_string(), "handler aborted: bad credentials");
    }
}
