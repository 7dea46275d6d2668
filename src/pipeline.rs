//! End-to-end run orchestration.
//!
//! Discover candidate files, scan them under the worker pools, then run
//! the single-threaded phases: cluster the accumulated embeddings, plan
//! destinations, and materialize the plan. The run always completes and
//! returns a summary plus the full failure report.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::backend::{self, FaceBackend};
use crate::cluster;
use crate::config::Config;
use crate::error::FailureRecord;
use crate::materialize;
use crate::plan;
use crate::scanner;
use crate::tasks::{ProgressFn, TaskScheduler};

/// Result summary returned to the caller at run end.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    /// Backend that actually ran (after any fallback).
    pub backend: String,
    pub discovered: usize,
    /// Images that completed decode and detection.
    pub scanned: usize,
    pub faces: usize,
    pub clusters: usize,
    pub noise_faces: usize,
    /// Copies/moves that landed in the destination tree.
    pub placed: usize,
    pub cancelled: bool,
    /// Every per-file failure, never discarded silently.
    pub failures: Vec<FailureRecord>,
}

/// Run the full pipeline with the configured backend.
pub fn run(
    config: &Config,
    input_root: &Path,
    dest_root: &Path,
    progress: Option<Arc<ProgressFn>>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<RunSummary> {
    config.validate()?;
    // Backend availability surfaces here, before any scanning starts.
    let backend: Arc<dyn FaceBackend> = Arc::from(backend::resolve_backend(config.backend)?);
    run_with_backend(config, backend, input_root, dest_root, progress, cancel)
}

/// Run the full pipeline with an already-constructed backend.
pub fn run_with_backend(
    config: &Config,
    backend: Arc<dyn FaceBackend>,
    input_root: &Path,
    dest_root: &Path,
    progress: Option<Arc<ProgressFn>>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<RunSummary> {
    config.validate()?;

    let paths = scanner::discover_images(input_root, &config.scanner)?;
    let images = scanner::source_images(paths);
    let discovered = images.len();
    tracing::info!(discovered, backend = backend.name(), "scan starting");

    let cancel = cancel.unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    let scheduler = TaskScheduler::new(backend.clone(), &config.scanner);
    let handle = scheduler.submit(images.clone(), progress, cancel.clone());

    // Barrier: clustering needs the globally consistent embedding set.
    let scan = handle.join();
    let cancelled = cancel.load(std::sync::atomic::Ordering::SeqCst);
    if cancelled {
        tracing::info!(
            scanned = scan.scanned.len(),
            "scan cancelled; continuing over the partial set"
        );
    }

    let assignment = cluster::cluster(&scan.index, &config.clustering);
    let entries = plan::build_plan(&scan.scanned, &scan.index, &assignment);
    let outcome = materialize::materialize(
        &entries,
        &images,
        &scan.index,
        &assignment,
        dest_root,
        &config.output,
    )?;

    let mut failures = scan.failures;
    failures.extend(outcome.failures);

    let summary = RunSummary {
        backend: backend.name().to_string(),
        discovered,
        scanned: scan.scanned.len(),
        faces: scan.index.len(),
        clusters: assignment.clusters.len(),
        noise_faces: assignment.noise_count(),
        placed: outcome.placements.len(),
        cancelled,
        failures,
    };

    tracing::info!(
        scanned = summary.scanned,
        faces = summary.faces,
        clusters = summary.clusters,
        placed = summary.placed,
        failures = summary.failures.len(),
        "run complete"
    );

    Ok(summary)
}
