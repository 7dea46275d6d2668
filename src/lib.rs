//! facesort groups a folder of photographs by the people in them.
//!
//! The pipeline decodes images (unicode-safe), detects faces and derives
//! per-face embeddings through a pluggable backend, clusters embeddings
//! into identities, and materializes one destination folder per identity
//! plus an `unsorted` bucket. See [`pipeline::run`] for the entry point.

pub mod backend;
pub mod cluster;
pub mod config;
pub mod error;
pub mod index;
pub mod loader;
pub mod logging;
pub mod materialize;
pub mod pipeline;
pub mod plan;
pub mod scanner;
pub mod tasks;

pub use config::Config;
pub use error::{FailureRecord, PipelineError, Stage};
pub use pipeline::{run, RunSummary};
