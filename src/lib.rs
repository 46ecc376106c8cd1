//! # Ingest Pipeline Library
//!
//! Integration execution pipeline: runs fan out into streams, streams
//! produce data records, and data records are normalized into the sink.
//! Coordination happens exclusively through the database and the work
//! queue, so every stage can run as an independent process and resume
//! across restarts.

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod platforms;
pub mod queue;
pub mod repositories;
pub mod sink;
pub mod sweeper;
pub mod workers;
pub use migration;
