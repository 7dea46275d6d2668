//! Error taxonomy for the sorting pipeline.
//!
//! Per-image failures (decode, detection, materialization) are recovered
//! locally and collected into [`FailureRecord`]s; configuration and backend
//! availability errors surface before any work starts.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The image could not be decoded by any strategy.
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// A detection backend could not be initialized.
    #[error("backend `{backend}` unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// Detection raised an error on one specific image.
    #[error("face detection failed for {path}: {reason}")]
    Detection { path: PathBuf, reason: String },

    /// A copy/move against the destination tree failed.
    #[error("failed to materialize {path}: {reason}")]
    Materialization { path: PathBuf, reason: String },

    /// Invalid parameters; fatal before any work starts.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// Pipeline stage a per-file failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Decode,
    Detection,
    Materialization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Decode => write!(f, "decode"),
            Stage::Detection => write!(f, "detection"),
            Stage::Materialization => write!(f, "materialization"),
        }
    }
}

/// One entry of the failure report returned at run end.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub path: PathBuf,
    pub stage: Stage,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(path: impl Into<PathBuf>, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stage,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.path.display(), self.reason)
    }
}
