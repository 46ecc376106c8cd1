//! # Repository Layer
//!
//! Repositories encapsulating SeaORM operations for the pipeline entities.
//! Every state transition is guarded on the current state in the `WHERE`
//! clause and reports through its return value whether it applied, so late
//! writers of earlier states lose instead of clobbering.

pub mod data;
pub mod integration;
pub mod run;
pub mod stream;

pub use data::DataRepository;
pub use integration::IntegrationRepository;
pub use run::RunRepository;
pub use stream::StreamRepository;
