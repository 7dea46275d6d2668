//! Landmark backend: BlazeFace detection with a geometric embedding.
//!
//! BlazeFace (short-range) emits a box plus six facial keypoints per
//! detection. The identity embedding is built from the keypoint
//! constellation (normalized coordinates and pairwise distance ratios),
//! so this backend is cheap but noticeably less precise than the
//! deep-embedding one. It still needs an ONNX runtime; the cascade
//! backend is the pure-CPU fallback below it.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::sync::Mutex;

use super::models::ensure_model;
use super::{l2_normalize, DetectedFace, FaceBackend};
use crate::error::PipelineError;
use crate::index::BoundingBox;

/// 6 keypoint coordinate pairs + 15 pairwise distance ratios.
pub const EMBEDDING_DIM: usize = 27;

/// BlazeFace model input resolution (short-range variant).
const INPUT_SIZE: u32 = 128;
/// Anchor count for the short-range model: 16x16x2 + 8x8x6.
const NUM_ANCHORS: usize = 896;
const NUM_KEYPOINTS: usize = 6;
const CONFIDENCE_THRESHOLD: f32 = 0.6;
const NMS_THRESHOLD: f32 = 0.3;

const BLAZEFACE_URL: &str =
    "https://huggingface.co/onnx-community/mediapipe-blazeface/resolve/main/blazeface-short-range.onnx";

pub struct LandmarkBackend {
    session: Mutex<Session>,
    anchors: Vec<[f32; 2]>,
}

impl LandmarkBackend {
    pub fn new() -> Result<Self, PipelineError> {
        Self::build().map_err(|e| PipelineError::BackendUnavailable {
            backend: "landmark",
            reason: e.to_string(),
        })
    }

    fn build() -> Result<Self> {
        let model_path = ensure_model("blazeface-short-range.onnx", BLAZEFACE_URL)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;

        Ok(Self {
            session: Mutex::new(session),
            anchors: generate_anchors(),
        })
    }
}

struct RawDetection {
    bbox: BoundingBox,
    keypoints: [(f32, f32); NUM_KEYPOINTS],
    score: f32,
}

impl FaceBackend for LandmarkBackend {
    fn name(&self) -> &'static str {
        "landmark"
    }

    fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let detections = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow!("session lock poisoned: {e}"))?;
            run_blazeface(&mut session, &self.anchors, img)?
        };

        Ok(detections
            .into_iter()
            .map(|det| {
                let embedding = constellation_embedding(&det.keypoints, &det.bbox);
                DetectedFace {
                    bbox: det.bbox,
                    embedding,
                    confidence: det.score,
                }
            })
            .collect())
    }
}

fn run_blazeface(
    session: &mut Session,
    anchors: &[[f32; 2]],
    img: &DynamicImage,
) -> Result<Vec<RawDetection>> {
    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, normalized to [0, 1]
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE as usize + x as usize;
        input_data[idx] = pixel[0] as f32 / 255.0;
        input_data[plane + idx] = pixel[1] as f32 / 255.0;
        input_data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs![input_tensor])?;

    // regressors: [1, 896, 16] (box deltas + 6 keypoints)
    // classificators: [1, 896, 1] (logit scores)
    if outputs.len() < 2 {
        return Err(anyhow!(
            "BlazeFace model expected 2 outputs, got {}",
            outputs.len()
        ));
    }
    let (_reg_shape, reg_data) = outputs[0].try_extract_tensor::<f32>()?;
    let (_score_shape, score_data) = outputs[1].try_extract_tensor::<f32>()?;

    let mut detections = Vec::new();
    let num_anchors = anchors.len().min(NUM_ANCHORS).min(score_data.len());

    for (i, &raw_score) in score_data.iter().enumerate().take(num_anchors) {
        let score = sigmoid(raw_score);
        if score < CONFIDENCE_THRESHOLD {
            continue;
        }

        let anchor = &anchors[i];
        let offset = i * 16;
        if offset + 16 > reg_data.len() {
            break;
        }

        // Box center + size relative to the anchor, in input-grid units
        let cx = anchor[0] + reg_data[offset] / INPUT_SIZE as f32;
        let cy = anchor[1] + reg_data[offset + 1] / INPUT_SIZE as f32;
        let w = reg_data[offset + 2] / INPUT_SIZE as f32;
        let h = reg_data[offset + 3] / INPUT_SIZE as f32;

        let x1 = ((cx - w / 2.0) * orig_width as f32).max(0.0);
        let y1 = ((cy - h / 2.0) * orig_height as f32).max(0.0);
        let x2 = ((cx + w / 2.0) * orig_width as f32).min(orig_width as f32);
        let y2 = ((cy + h / 2.0) * orig_height as f32).min(orig_height as f32);

        let mut keypoints = [(0.0f32, 0.0f32); NUM_KEYPOINTS];
        for (k, point) in keypoints.iter_mut().enumerate() {
            let kx = anchor[0] + reg_data[offset + 4 + 2 * k] / INPUT_SIZE as f32;
            let ky = anchor[1] + reg_data[offset + 5 + 2 * k] / INPUT_SIZE as f32;
            *point = (kx * orig_width as f32, ky * orig_height as f32);
        }

        detections.push(RawDetection {
            bbox: BoundingBox {
                x: x1 as i32,
                y: y1 as i32,
                width: ((x2 - x1) as i32).max(1),
                height: ((y2 - y1) as i32).max(1),
            },
            keypoints,
            score,
        });
    }

    Ok(nms_detections(detections, NMS_THRESHOLD))
}

fn nms_detections(mut detections: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Generate BlazeFace anchors for the short-range model.
///
/// Two feature maps: 16x16 with 2 anchors per cell and 8x8 with 6.
fn generate_anchors() -> Vec<[f32; 2]> {
    let strides = [(8u32, 2usize), (16, 6)];
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, per_cell) in &strides {
        let grid = (INPUT_SIZE / stride) as usize;
        for y in 0..grid {
            for x in 0..grid {
                let cx = (x as f32 + 0.5) / grid as f32;
                let cy = (y as f32 + 0.5) / grid as f32;
                for _ in 0..per_cell {
                    anchors.push([cx, cy]);
                }
            }
        }
    }

    anchors
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Identity embedding from the keypoint constellation.
///
/// Coordinates are expressed in the face-box frame and distances are
/// scaled by the box diagonal, so the embedding is invariant to where in
/// the photo the face sits and how large it is.
fn constellation_embedding(
    keypoints: &[(f32, f32); NUM_KEYPOINTS],
    bbox: &BoundingBox,
) -> Vec<f32> {
    let w = bbox.width.max(1) as f32;
    let h = bbox.height.max(1) as f32;
    let diagonal = (w * w + h * h).sqrt();

    let mut features = Vec::with_capacity(EMBEDDING_DIM);

    for &(x, y) in keypoints.iter() {
        features.push((x - bbox.x as f32) / w);
        features.push((y - bbox.y as f32) / h);
    }

    for i in 0..NUM_KEYPOINTS {
        for j in (i + 1)..NUM_KEYPOINTS {
            let dx = keypoints[i].0 - keypoints[j].0;
            let dy = keypoints[i].1 - keypoints[j].1;
            features.push((dx * dx + dy * dy).sqrt() / diagonal);
        }
    }

    l2_normalize(&mut features);
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_count_matches_short_range_model() {
        // 16x16 grid x 2 anchors + 8x8 grid x 6 anchors = 512 + 384
        assert_eq!(generate_anchors().len(), NUM_ANCHORS);
    }

    #[test]
    fn test_anchors_in_unit_range() {
        for anchor in generate_anchors() {
            assert!(anchor[0] > 0.0 && anchor[0] < 1.0);
            assert!(anchor[1] > 0.0 && anchor[1] < 1.0);
        }
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn test_constellation_embedding_has_fixed_width() {
        let bbox = BoundingBox {
            x: 10,
            y: 10,
            width: 100,
            height: 100,
        };
        let keypoints = [
            (40.0, 45.0),
            (80.0, 45.0),
            (60.0, 65.0),
            (45.0, 85.0),
            (75.0, 85.0),
            (60.0, 95.0),
        ];
        let embedding = constellation_embedding(&keypoints, &bbox);
        assert_eq!(embedding.len(), EMBEDDING_DIM);

        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_constellation_embedding_is_translation_invariant() {
        let keypoints = [
            (40.0, 45.0),
            (80.0, 45.0),
            (60.0, 65.0),
            (45.0, 85.0),
            (75.0, 85.0),
            (60.0, 95.0),
        ];
        let bbox = BoundingBox {
            x: 20,
            y: 30,
            width: 80,
            height: 80,
        };

        let shifted: [(f32, f32); NUM_KEYPOINTS] =
            keypoints.map(|(x, y)| (x + 500.0, y + 300.0));
        let shifted_bbox = BoundingBox {
            x: bbox.x + 500,
            y: bbox.y + 300,
            ..bbox.clone()
        };

        let a = constellation_embedding(&keypoints, &bbox);
        let b = constellation_embedding(&shifted, &shifted_bbox);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_nms_detections_suppresses_overlap() {
        let make = |x: i32, score: f32| RawDetection {
            bbox: BoundingBox {
                x,
                y: 0,
                width: 100,
                height: 100,
            },
            keypoints: [(0.0, 0.0); NUM_KEYPOINTS],
            score,
        };
        let kept = nms_detections(vec![make(0, 0.9), make(5, 0.7)], NMS_THRESHOLD);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
    }
}
