//! Tracing setup for the pipeline processes.
//!
//! JSON output with the enclosing worker span surfaced on every event, so
//! lines emitted inside a handler carry the run/stream/tenant/platform
//! fields the workers attach.

use crate::config::AppConfig;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

pub fn init_subscriber(config: &AppConfig) {
    // Cap sqlx statement logging regardless of the configured level; the
    // queue poll would flood the output at debug.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.log_level)));

    let formatter = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    let subscriber = Registry::default().with(filter).with(formatter);

    tracing::subscriber::set_global_default(subscriber)
        .expect("global tracing subscriber already installed");
}
