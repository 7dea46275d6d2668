//! Cascade backend: SeetaFace funnel cascade with a histogram embedding.
//!
//! Pure CPU and dependency-light, the backend of last resort when no
//! ONNX runtime is present. Identity is approximated by a 2D
//! hue/saturation histogram of the face crop, which separates clearly
//! distinct people but has much lower precision than a learned embedding.

use anyhow::{anyhow, Result};
use image::{DynamicImage, RgbImage};
use std::fs::File;
use std::io::BufReader;

use super::models::ensure_model;
use super::{l2_normalize, DetectedFace, FaceBackend};
use crate::error::PipelineError;
use crate::index::BoundingBox;

const HUE_BINS: usize = 32;
const SAT_BINS: usize = 32;
/// Hue/saturation histogram width.
pub const EMBEDDING_DIM: usize = HUE_BINS * SAT_BINS;

const MIN_FACE_SIZE: u32 = 20;
const SCORE_THRESHOLD: f64 = 2.0;

const SEETAFACE_URL: &str =
    "https://github.com/atomashpolskiy/rustface/raw/master/model/seeta_fd_frontal_v1.0.bin";

pub struct CascadeBackend {
    model: rustface::Model,
}

impl CascadeBackend {
    pub fn new() -> Result<Self, PipelineError> {
        Self::build().map_err(|e| PipelineError::BackendUnavailable {
            backend: "cascade",
            reason: e.to_string(),
        })
    }

    fn build() -> Result<Self> {
        let model_path = ensure_model("seeta_fd_frontal_v1.0.bin", SEETAFACE_URL)?;
        let file = File::open(&model_path)?;
        let model = rustface::read_model(BufReader::new(file))
            .map_err(|e| anyhow!("failed to read SeetaFace model: {:?}", e))?;
        Ok(Self { model })
    }
}

impl FaceBackend for CascadeBackend {
    fn name(&self) -> &'static str {
        "cascade"
    }

    fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let gray = img.to_luma8();
        let (width, height) = gray.dimensions();

        // Detectors are cheap to build and not shareable across threads;
        // the parsed model is, so each call gets its own detector.
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(MIN_FACE_SIZE);
        detector.set_score_thresh(SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);

        let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), width, height));
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let rgb = img.to_rgb8();
        let detected = faces
            .iter()
            .map(|face| {
                let rect = face.bbox();
                let bbox = BoundingBox {
                    x: rect.x(),
                    y: rect.y(),
                    width: rect.width() as i32,
                    height: rect.height() as i32,
                };
                let embedding = histogram_embedding(&rgb, &bbox);
                DetectedFace {
                    bbox,
                    embedding,
                    confidence: face.score() as f32,
                }
            })
            .collect();

        Ok(detected)
    }
}

/// 2D hue/saturation histogram over the face crop, L2-normalized.
fn histogram_embedding(rgb: &RgbImage, bbox: &BoundingBox) -> Vec<f32> {
    let (img_width, img_height) = rgb.dimensions();
    let x0 = bbox.x.max(0) as u32;
    let y0 = bbox.y.max(0) as u32;
    let x1 = ((bbox.x + bbox.width).max(0) as u32).min(img_width);
    let y1 = ((bbox.y + bbox.height).max(0) as u32).min(img_height);

    let mut hist = vec![0.0f32; EMBEDDING_DIM];
    for y in y0..y1 {
        for x in x0..x1 {
            let pixel = rgb.get_pixel(x, y);
            let (h, s) = hue_saturation(
                pixel[0] as f32 / 255.0,
                pixel[1] as f32 / 255.0,
                pixel[2] as f32 / 255.0,
            );
            let h_bin = ((h / 360.0) * HUE_BINS as f32).min(HUE_BINS as f32 - 1.0) as usize;
            let s_bin = (s * SAT_BINS as f32).min(SAT_BINS as f32 - 1.0) as usize;
            hist[h_bin * SAT_BINS + s_bin] += 1.0;
        }
    }

    l2_normalize(&mut hist);
    hist
}

fn hue_saturation(r: f32, g: f32, b: f32) -> (f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max > 0.0 { delta / max } else { 0.0 };

    let h = if delta == 0.0 {
        0.0
    } else if (max - r).abs() < f32::EPSILON {
        60.0 * (((g - b) / delta) % 6.0)
    } else if (max - g).abs() < f32::EPSILON {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    (if h < 0.0 { h + 360.0 } else { h }, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(r: u8, g: u8, b: u8) -> RgbImage {
        RgbImage::from_pixel(20, 20, Rgb([r, g, b]))
    }

    fn full_box() -> BoundingBox {
        BoundingBox {
            x: 0,
            y: 0,
            width: 20,
            height: 20,
        }
    }

    #[test]
    fn test_hue_saturation_primaries() {
        let (h, s) = hue_saturation(1.0, 0.0, 0.0);
        assert!(h.abs() < 1.0 && (s - 1.0).abs() < 0.01);

        let (h, _) = hue_saturation(0.0, 1.0, 0.0);
        assert!((h - 120.0).abs() < 1.0);

        let (h, _) = hue_saturation(0.0, 0.0, 1.0);
        assert!((h - 240.0).abs() < 1.0);
    }

    #[test]
    fn test_hue_saturation_gray_has_zero_saturation() {
        let (_, s) = hue_saturation(0.5, 0.5, 0.5);
        assert_eq!(s, 0.0);
    }

    #[test]
    fn test_histogram_embedding_width_and_norm() {
        let embedding = histogram_embedding(&solid(200, 40, 40), &full_box());
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_same_colors_match_different_colors_do_not() {
        let red_a = histogram_embedding(&solid(200, 40, 40), &full_box());
        let red_b = histogram_embedding(&solid(200, 40, 40), &full_box());
        let blue = histogram_embedding(&solid(40, 40, 200), &full_box());

        let same = super::super::cosine_similarity(&red_a, &red_b);
        let different = super::super::cosine_similarity(&red_a, &blue);
        assert!(same > 0.99);
        assert!(different < 0.1);
    }

    #[test]
    fn test_histogram_clamps_box_to_image() {
        let img = solid(10, 200, 10);
        let oversized = BoundingBox {
            x: -5,
            y: -5,
            width: 100,
            height: 100,
        };
        let embedding = histogram_embedding(&img, &oversized);
        assert!(embedding.iter().any(|v| *v > 0.0));
    }
}
