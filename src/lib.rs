//! Elastic Transcode - segmented parallel transcoding library
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (jobs, segmentation, probe model, encoding presets)
//! - ports/: Trait definitions (storage, external tools, job state)
//! - adapters/: Concrete implementations
//! - application/: Pipeline stages (prober, dispatcher, worker, assembler, cleanup, orchestrator)
//! - config: Environment configuration
//!
//! # Features
//! - `local`: Filesystem storage and in-process adapters
//! - `aws`: S3 storage adapter
//! - `full`: All features

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

#[cfg(all(test, feature = "local"))]
pub(crate) mod test_support;

// Re-exports for convenience
pub use application::orchestrator::OrchestratorService;
pub use config::PipelineConfig;
pub use domain::jobs::{JobInput, JobOutput};
pub use error::{JobError, JobFailure};
