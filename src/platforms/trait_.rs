//! Platform service trait definition
//!
//! The interface every platform integration implements. A platform receives
//! a context object carrying the full side-effect surface; anything else it
//! needs (HTTP clients, credentials) it owns itself.

use async_trait::async_trait;

use crate::context::{DataContext, RunContext, StreamContext};
use crate::error::HandlerError;

#[async_trait]
pub trait IntegrationService: Send + Sync {
    /// Platform slug this service handles (e.g. "discord", "github").
    fn platform(&self) -> &str;

    /// Seeds the root streams of a fresh run by calling
    /// `ctx.publish_stream` once per root resource.
    async fn generate_streams(&self, _ctx: &RunContext) -> Result<(), HandlerError> {
        Err(HandlerError::Unsupported {
            platform: self.platform().to_string(),
            operation: "generate_streams",
        })
    }

    /// Processes one stream: fetch a page, publish data records and child
    /// streams, advance watermarks through the settings merge.
    async fn process_stream(&self, ctx: &StreamContext) -> Result<(), HandlerError>;

    /// Normalizes one produced record into the sink.
    async fn process_data(&self, _ctx: &DataContext) -> Result<(), HandlerError> {
        Err(HandlerError::Unsupported {
            platform: self.platform().to_string(),
            operation: "process_data",
        })
    }
}
