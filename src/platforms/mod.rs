//! Platforms module
//!
//! The platform SDK:
//! - The `IntegrationService` trait each platform implements
//! - The registry used by the workers to resolve platforms at pickup
//! - The sample platform used by tests and the local profile

pub mod registry;
pub mod sample;
pub mod trait_;

pub use registry::{Registry, RegistryError};
pub use sample::{SAMPLE_PLATFORM, SampleService};
pub use trait_::IntegrationService;
