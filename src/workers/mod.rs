//! Workers module
//!
//! The three pipeline stages as queue consumers, plus the shared receiver
//! loop that drives them. Each worker re-reads entity state from the
//! database on pickup, so redelivered messages are safe to re-enter.

pub mod data;
pub mod receiver;
pub mod run;
pub mod stream;

pub use data::DataWorker;
pub use receiver::{MessageProcessor, ReceiverLoop};
pub use run::RunWorker;
pub use stream::StreamWorker;

use chrono::Duration;

/// Linear retry backoff: the n-th retry waits n times this long.
pub(crate) const RETRY_BACKOFF_MINUTES: i64 = 15;

/// Backoff before the given attempt (1-based) runs again.
pub(crate) fn retry_backoff(attempt: i32) -> Duration {
    Duration::minutes(RETRY_BACKOFF_MINUTES * i64::from(attempt.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_in_attempts() {
        assert_eq!(retry_backoff(1), Duration::minutes(15));
        assert_eq!(retry_backoff(2), Duration::minutes(30));
        assert_eq!(retry_backoff(3), Duration::minutes(45));
    }

    #[test]
    fn backoff_clamps_non_positive_attempts() {
        assert_eq!(retry_backoff(0), Duration::minutes(15));
    }
}
