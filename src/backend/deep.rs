//! Deep-embedding backend: UltraFace for detection, ArcFace for identity.
//!
//! The heaviest backend, and the most accurate one. Requires an ONNX
//! runtime; when that is unavailable the pipeline falls back to the
//! landmark or cascade backend instead of aborting.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::sync::Mutex;

use super::models::ensure_model;
use super::{crop_face, l2_normalize, nms, DetectedFace, FaceBackend};
use crate::error::PipelineError;
use crate::index::BoundingBox;

/// ArcFace embedding width.
pub const EMBEDDING_DIM: usize = 512;

const DETECT_WIDTH: u32 = 320;
const DETECT_HEIGHT: u32 = 240;
const CONFIDENCE_THRESHOLD: f32 = 0.7;
const NMS_THRESHOLD: f32 = 0.3;
const EMBED_SIZE: u32 = 112;
const CROP_PADDING: f32 = 0.2;

const ULTRAFACE_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";
const ARCFACE_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx";

pub struct DeepEmbeddingBackend {
    detection: Mutex<Session>,
    embedding: Mutex<Session>,
}

impl DeepEmbeddingBackend {
    pub fn new() -> Result<Self, PipelineError> {
        Self::build().map_err(|e| PipelineError::BackendUnavailable {
            backend: "deep-embedding",
            reason: e.to_string(),
        })
    }

    fn build() -> Result<Self> {
        let detection_path = ensure_model("ultraface-320.onnx", ULTRAFACE_URL)?;
        let embedding_path = ensure_model("arcface-resnet100.onnx", ARCFACE_URL)?;

        let detection = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&detection_path)?;

        let embedding = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&embedding_path)?;

        Ok(Self {
            detection: Mutex::new(detection),
            embedding: Mutex::new(embedding),
        })
    }
}

impl FaceBackend for DeepEmbeddingBackend {
    fn name(&self) -> &'static str {
        "deep-embedding"
    }

    fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let (img_width, img_height) = img.dimensions();

        let face_boxes = {
            let mut session = self
                .detection
                .lock()
                .map_err(|e| anyhow!("detection session lock poisoned: {e}"))?;
            run_ultraface(&mut session, img)?
        };

        if face_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self
            .embedding
            .lock()
            .map_err(|e| anyhow!("embedding session lock poisoned: {e}"))?;

        let mut detected = Vec::new();
        for (bbox, confidence) in face_boxes {
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }

            let crop = crop_face(img, &bbox, img_width, img_height, CROP_PADDING);
            let embedding = match run_arcface(&mut session, &crop) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed for one face, skipping it");
                    continue;
                }
            };

            detected.push(DetectedFace {
                bbox,
                embedding,
                confidence,
            });
        }

        Ok(detected)
    }
}

/// Run UltraFace detection: scores + normalized corner boxes over anchors.
fn run_ultraface(session: &mut Session, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        DETECT_WIDTH,
        DETECT_HEIGHT,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    // NCHW, UltraFace normalization (x - 127) / 128
    let plane = (DETECT_WIDTH * DETECT_HEIGHT) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * DETECT_WIDTH as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, DETECT_HEIGHT as usize, DETECT_WIDTH as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs
        .get("scores")
        .ok_or_else(|| anyhow!("no scores output"))?;
    let boxes_value = outputs
        .get("boxes")
        .ok_or_else(|| anyhow!("no boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, num_anchors, 2] (background, face)
    // boxes:  [1, num_anchors, 4] (x1, y1, x2, y2 normalized)
    let num_anchors = scores_shape[1] as usize;
    let mut face_boxes = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= CONFIDENCE_THRESHOLD {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        face_boxes.push((
            BoundingBox {
                x: x1.max(0),
                y: y1.max(0),
                width: (x2 - x1).max(1),
                height: (y2 - y1).max(1),
            },
            confidence,
        ));
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Run ArcFace on a face crop, returning an L2-normalized 512-d embedding.
fn run_arcface(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    let resized = face_img.resize_exact(EMBED_SIZE, EMBED_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, ArcFace normalization (x - 127.5) / 127.5
    let plane = (EMBED_SIZE * EMBED_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * EMBED_SIZE as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
        input_data[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, EMBED_SIZE as usize, EMBED_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    // The ArcFace ONNX model uses "data" as its input name
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("no embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    if embedding_data.len() != EMBEDDING_DIM {
        return Err(anyhow!(
            "unexpected embedding width {} (wanted {})",
            embedding_data.len(),
            EMBEDDING_DIM
        ));
    }

    let mut embedding = embedding_data.to_vec();
    l2_normalize(&mut embedding);
    Ok(embedding)
}
