//! Face detection/embedding backends.
//!
//! Every backend exposes the same capability: given a decoded pixel
//! buffer, produce zero or more faces, each with a bounding box, a
//! fixed-length identity embedding, and a confidence score. Backends are
//! interchangeable; the rest of the pipeline depends only on this trait.

pub mod cascade;
pub mod deep;
pub mod landmark;
mod models;

use anyhow::Result;
use image::DynamicImage;

use crate::config::BackendKind;
use crate::error::PipelineError;
use crate::index::BoundingBox;

pub use cascade::CascadeBackend;
pub use deep::DeepEmbeddingBackend;
pub use landmark::LandmarkBackend;

/// A detected face with bounding box and embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Capability interface shared by all detection backends.
///
/// Implementations must return embeddings of exactly `embedding_dim()`
/// floats. Errors are per-image; the scheduler isolates them to the
/// offending image.
pub trait FaceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn embedding_dim(&self) -> usize;

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

/// Build the configured backend, falling back to simpler ones when a
/// runtime dependency is missing. Resolved once at pipeline construction.
pub fn resolve_backend(kind: BackendKind) -> Result<Box<dyn FaceBackend>, PipelineError> {
    let mut last_err = None;

    for &candidate in fallback_chain(kind) {
        match create_backend(candidate) {
            Ok(backend) => {
                if candidate != kind {
                    tracing::warn!(
                        requested = kind.as_str(),
                        using = candidate.as_str(),
                        "requested backend unavailable, fell back"
                    );
                }
                return Ok(backend);
            }
            Err(e) => {
                tracing::warn!(backend = candidate.as_str(), error = %e, "backend unavailable");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or(PipelineError::BackendUnavailable {
        backend: "cascade",
        reason: "no backend could be initialized".to_string(),
    }))
}

fn fallback_chain(kind: BackendKind) -> &'static [BackendKind] {
    match kind {
        BackendKind::DeepEmbedding => &[
            BackendKind::DeepEmbedding,
            BackendKind::Landmark,
            BackendKind::Cascade,
        ],
        BackendKind::Landmark => &[BackendKind::Landmark, BackendKind::Cascade],
        BackendKind::Cascade => &[BackendKind::Cascade],
    }
}

fn create_backend(kind: BackendKind) -> Result<Box<dyn FaceBackend>, PipelineError> {
    match kind {
        BackendKind::DeepEmbedding => {
            DeepEmbeddingBackend::new().map(|b| Box::new(b) as Box<dyn FaceBackend>)
        }
        BackendKind::Landmark => {
            LandmarkBackend::new().map(|b| Box::new(b) as Box<dyn FaceBackend>)
        }
        BackendKind::Cascade => CascadeBackend::new().map(|b| Box::new(b) as Box<dyn FaceBackend>),
    }
}

/// Overlap threshold above which two detections are the same face.
pub const DEDUPE_IOU_THRESHOLD: f32 = 0.55;
/// Cosine-distance threshold below which two detections are the same face.
pub const DEDUPE_COSINE_THRESHOLD: f32 = 0.12;

/// Collapse duplicate detections of the same face within one image.
///
/// Two detections are duplicates when their boxes overlap heavily or
/// their embeddings are nearly identical; the highest-confidence one wins.
pub fn dedupe_detections(
    mut faces: Vec<DetectedFace>,
    iou_threshold: f32,
    cosine_threshold: f32,
) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<DetectedFace> = Vec::with_capacity(faces.len());
    for face in faces {
        let duplicate = keep.iter().any(|kept| {
            kept.bbox.iou(&face.bbox) >= iou_threshold
                || 1.0 - cosine_similarity(&kept.embedding, &face.embedding) <= cosine_threshold
        });
        if !duplicate {
            keep.push(face);
        }
    }
    keep
}

/// Calculate cosine similarity between two embeddings.
/// Returns value between -1 and 1 (higher = more similar).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// Scale an embedding to unit length in place.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Crop a face region with padding around the box, clamped to the image.
pub(crate) fn crop_face(
    img: &DynamicImage,
    bbox: &BoundingBox,
    img_width: u32,
    img_height: u32,
    padding: f32,
) -> DynamicImage {
    let padding_x = (bbox.width as f32 * padding) as i32;
    let padding_y = (bbox.height as f32 * padding) as i32;

    let x = (bbox.x - padding_x).max(0) as u32;
    let y = (bbox.y - padding_y).max(0) as u32;
    let w = ((bbox.width + padding_x * 2) as u32).min(img_width.saturating_sub(x));
    let h = ((bbox.height + padding_y * 2) as u32).min(img_height.saturating_sub(y));

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Non-maximum suppression over scored boxes.
pub(crate) fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i].clone());
        for j in (i + 1)..boxes.len() {
            if suppressed[j] {
                continue;
            }
            if boxes[i].0.iou(&boxes[j].0) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}
