//! Two-stage scan executor: a decode pool feeds a detect pool through a
//! bounded channel.
//!
//! Decoding is I/O bound and gets the larger pool; detection is CPU bound
//! and is sized to available parallelism. The bounded handoff also caps
//! how many decoded pixel buffers exist at once, so memory stays bounded
//! on large libraries. Each worker blocks only on its own work, never on
//! another worker's state.
//!
//! Results land in a slot array keyed by discovery index and are
//! flattened in that order after the barrier, so the embedding index has
//! a reproducible insertion order no matter how workers interleave.

use image::DynamicImage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{ProgressFn, ScanCounters, ScanProgress};
use crate::backend::{
    dedupe_detections, DetectedFace, FaceBackend, DEDUPE_COSINE_THRESHOLD, DEDUPE_IOU_THRESHOLD,
};
use crate::config::ScannerConfig;
use crate::error::{FailureRecord, Stage};
use crate::index::{EmbeddingIndex, FaceObservation};
use crate::loader;
use crate::scanner::SourceImage;

/// Drives decode and detection across many files concurrently.
pub struct TaskScheduler {
    backend: Arc<dyn FaceBackend>,
    detect_workers: usize,
    decode_workers: usize,
    per_item_timeout: Option<Duration>,
    max_detect_edge: u32,
}

/// A decoded image in flight between the two stages.
struct DecodedUnit {
    index: usize,
    path: std::path::PathBuf,
    started: Instant,
    buffer: DynamicImage,
    /// Downscale factor applied before detection; regions are mapped back.
    scale: f32,
}

enum UnitOutcome {
    Scanned(Vec<DetectedFace>),
    Failed(FailureRecord),
}

impl TaskScheduler {
    pub fn new(backend: Arc<dyn FaceBackend>, config: &ScannerConfig) -> Self {
        let detect_workers = config
            .max_workers
            .unwrap_or_else(available_parallelism)
            .max(1);
        let decode_workers = config.decode_workers.unwrap_or(detect_workers * 2).max(1);
        let per_item_timeout = match config.per_item_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Self {
            backend,
            detect_workers,
            decode_workers,
            per_item_timeout,
            max_detect_edge: config.max_detect_edge,
        }
    }

    /// Start scanning. Returns immediately; the handle reports progress,
    /// accepts cancellation, and joins into the accumulated results.
    pub fn submit(
        &self,
        images: Vec<SourceImage>,
        progress: Option<Arc<ProgressFn>>,
        cancel: Arc<AtomicBool>,
    ) -> ScanHandle {
        let total = images.len();
        let images = Arc::new(images);
        let counters = Arc::new(ScanCounters::new(total));

        let (decoded_tx, decoded_rx) =
            crossbeam_channel::bounded::<DecodedUnit>(self.detect_workers * 2);
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<(usize, UnitOutcome)>();

        let cursor = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();

        for _ in 0..self.decode_workers.min(total.max(1)) {
            workers.push(spawn_decoder(
                images.clone(),
                cursor.clone(),
                cancel.clone(),
                decoded_tx.clone(),
                outcome_tx.clone(),
                self.max_detect_edge,
            ));
        }
        drop(decoded_tx);

        for _ in 0..self.detect_workers {
            workers.push(spawn_detector(
                self.backend.clone(),
                decoded_rx.clone(),
                cancel.clone(),
                outcome_tx.clone(),
                self.per_item_timeout,
            ));
        }
        drop(outcome_tx);
        drop(decoded_rx);

        // Collector owns the slot array; it drains until every worker has
        // dropped its sender.
        let collector = {
            let counters = counters.clone();
            let images = images.clone();
            std::thread::spawn(move || {
                let mut slots: Vec<Option<UnitOutcome>> = (0..total).map(|_| None).collect();
                for (index, outcome) in outcome_rx.iter() {
                    match &outcome {
                        UnitOutcome::Scanned(_) => counters.record_success(),
                        UnitOutcome::Failed(record) => {
                            tracing::debug!(path = %record.path.display(), stage = %record.stage, reason = %record.reason, "task unit failed");
                            counters.record_failure();
                        }
                    }
                    if let Some(callback) = &progress {
                        callback(&images[index].path, counters.snapshot());
                    }
                    slots[index] = Some(outcome);
                }
                slots
            })
        };

        ScanHandle {
            cancel,
            counters,
            workers,
            collector,
        }
    }
}

fn spawn_decoder(
    images: Arc<Vec<SourceImage>>,
    cursor: Arc<AtomicUsize>,
    cancel: Arc<AtomicBool>,
    decoded_tx: crossbeam_channel::Sender<DecodedUnit>,
    outcome_tx: crossbeam_channel::Sender<(usize, UnitOutcome)>,
    max_detect_edge: u32,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            // Cooperative cancellation: nothing new is dequeued, the
            // unit in flight finishes.
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            if index >= images.len() {
                break;
            }

            let image = &images[index];
            let started = Instant::now();
            match loader::load(&image.path) {
                Ok(buffer) => {
                    let (buffer, scale) = loader::downscale_for_detection(buffer, max_detect_edge);
                    let unit = DecodedUnit {
                        index,
                        path: image.path.clone(),
                        started,
                        buffer,
                        scale,
                    };
                    if decoded_tx.send(unit).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let record = FailureRecord::new(&image.path, Stage::Decode, e.to_string());
                    if outcome_tx.send((index, UnitOutcome::Failed(record))).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_detector(
    backend: Arc<dyn FaceBackend>,
    decoded_rx: crossbeam_channel::Receiver<DecodedUnit>,
    cancel: Arc<AtomicBool>,
    outcome_tx: crossbeam_channel::Sender<(usize, UnitOutcome)>,
    per_item_timeout: Option<Duration>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for unit in decoded_rx.iter() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }

            let outcome = detect_unit(&*backend, unit, per_item_timeout);
            let index = outcome.0;
            if outcome_tx.send((index, outcome.1)).is_err() {
                break;
            }
        }
    })
}

fn detect_unit(
    backend: &dyn FaceBackend,
    unit: DecodedUnit,
    per_item_timeout: Option<Duration>,
) -> (usize, UnitOutcome) {
    let index = unit.index;

    if let Some(budget) = per_item_timeout {
        if unit.started.elapsed() > budget {
            return (index, timed_out(&unit, budget));
        }
    }

    let result = backend.detect(&unit.buffer);
    // The pixel buffer is released here, once embeddings exist; decoded
    // images never outlive their task unit.
    let outcome = match result {
        Ok(faces) => {
            if let Some(budget) = per_item_timeout {
                if unit.started.elapsed() > budget {
                    return (index, timed_out(&unit, budget));
                }
            }
            let faces =
                dedupe_detections(faces, DEDUPE_IOU_THRESHOLD, DEDUPE_COSINE_THRESHOLD);
            UnitOutcome::Scanned(rescale_faces(faces, unit.scale))
        }
        Err(e) => UnitOutcome::Failed(FailureRecord::new(
            &unit.path,
            Stage::Detection,
            e.to_string(),
        )),
    };
    (index, outcome)
}

fn timed_out(unit: &DecodedUnit, budget: Duration) -> UnitOutcome {
    UnitOutcome::Failed(FailureRecord::new(
        &unit.path,
        Stage::Detection,
        format!(
            "exceeded per-item budget of {} ms ({} ms elapsed)",
            budget.as_millis(),
            unit.started.elapsed().as_millis()
        ),
    ))
}

/// Map detections from the downscaled buffer back to source coordinates.
fn rescale_faces(faces: Vec<DetectedFace>, scale: f32) -> Vec<DetectedFace> {
    if (scale - 1.0).abs() < f32::EPSILON {
        return faces;
    }
    faces
        .into_iter()
        .map(|mut face| {
            face.bbox.x = (face.bbox.x as f32 / scale).round() as i32;
            face.bbox.y = (face.bbox.y as f32 / scale).round() as i32;
            face.bbox.width = ((face.bbox.width as f32 / scale).round() as i32).max(1);
            face.bbox.height = ((face.bbox.height as f32 / scale).round() as i32).max(1);
            face
        })
        .collect()
}

/// Handle to a running scan.
pub struct ScanHandle {
    cancel: Arc<AtomicBool>,
    counters: Arc<ScanCounters>,
    workers: Vec<JoinHandle<()>>,
    collector: JoinHandle<Vec<Option<UnitOutcome>>>,
}

/// Everything the scan phase produced, flattened in discovery order.
pub struct ScanOutcome {
    pub index: EmbeddingIndex,
    /// Discovery indices of images that completed decode and detection.
    pub scanned: Vec<usize>,
    pub failures: Vec<FailureRecord>,
}

impl ScanHandle {
    pub fn progress(&self) -> ScanProgress {
        self.counters.snapshot()
    }

    /// Request cooperative cancellation: in-flight units finish, nothing
    /// new is dequeued. Accumulated observations stay valid.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Block until all workers drain, then flatten results in discovery
    /// order. This is the barrier between the scan phase and clustering.
    pub fn join(self) -> ScanOutcome {
        for worker in self.workers {
            let _ = worker.join();
        }
        let slots = match self.collector.join() {
            Ok(slots) => slots,
            Err(_) => {
                tracing::error!("scan collector thread panicked");
                Vec::new()
            }
        };

        let mut index = EmbeddingIndex::new();
        let mut scanned = Vec::new();
        let mut failures = Vec::new();

        for (image, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(UnitOutcome::Scanned(faces)) => {
                    scanned.push(image);
                    for face in faces {
                        index.push(FaceObservation {
                            image,
                            bbox: face.bbox,
                            embedding: face.embedding,
                            confidence: face.confidence,
                        });
                    }
                }
                Some(UnitOutcome::Failed(record)) => failures.push(record),
                // Cancelled before this unit was dequeued.
                None => {}
            }
        }

        ScanOutcome {
            index,
            scanned,
            failures,
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
