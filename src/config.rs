use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Which face detection/embedding backend to use.
///
/// Backends fall back in order of decreasing capability when a runtime
/// dependency is missing: deep-embedding, then landmark, then cascade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    DeepEmbedding,
    Landmark,
    Cascade,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::DeepEmbedding => "deep-embedding",
            BackendKind::Landmark => "landmark",
            BackendKind::Cascade => "cascade",
        }
    }
}

/// Distance metric used over embeddings during clustering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

/// Whether materialization copies files or moves them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    #[default]
    Copy,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Neighbor distance threshold. Faces closer than this are neighbors.
    #[serde(default = "default_eps")]
    pub eps: f32,

    /// Minimum neighborhood size (the face itself included) for a face to
    /// seed a cluster. 1 allows singleton identities.
    #[serde(default = "default_min_pts")]
    pub min_pts: usize,

    #[serde(default)]
    pub metric: DistanceMetric,
}

fn default_eps() -> f32 {
    // Cosine distance over L2-normalized embeddings; operating point taken
    // from the sorter this replaces. Tune per library via config.
    0.48
}

fn default_min_pts() -> usize {
    1
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            min_pts: default_min_pts(),
            metric: DistanceMetric::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default = "default_recursive")]
    pub recursive: bool,

    /// Detection worker count. Defaults to available CPU parallelism.
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Decode worker count. Decoding is I/O bound so it gets a larger
    /// bound; defaults to twice the detection worker count.
    #[serde(default)]
    pub decode_workers: Option<usize>,

    /// Per-item decode+detect budget in milliseconds. 0 disables it.
    /// An over-budget item becomes a reported per-item failure.
    #[serde(default)]
    pub per_item_timeout_ms: u64,

    /// Files smaller than this are skipped at discovery.
    #[serde(default = "default_min_file_bytes")]
    pub min_file_bytes: u64,

    /// Files larger than this are skipped at discovery.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Images with a longer edge than this are downscaled before
    /// detection; bounding boxes are mapped back to source coordinates.
    #[serde(default = "default_max_detect_edge")]
    pub max_detect_edge: u32,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "bmp".to_string(),
        "webp".to_string(),
    ]
}

fn default_recursive() -> bool {
    true
}

fn default_min_file_bytes() -> u64 {
    1024
}

fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_detect_edge() -> u32 {
    1920
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            recursive: default_recursive(),
            max_workers: None,
            decode_workers: None,
            per_item_timeout_ms: 0,
            min_file_bytes: default_min_file_bytes(),
            max_file_bytes: default_max_file_bytes(),
            max_detect_edge: default_max_detect_edge(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub copy_mode: CopyMode,

    /// Verify a SHA-256 checksum (in addition to size) before removing a
    /// moved source file.
    #[serde(default)]
    pub verify_checksum: bool,

    /// Write a mapping.csv manifest at the destination root.
    #[serde(default = "default_write_mapping")]
    pub write_mapping: bool,
}

fn default_write_mapping() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            copy_mode: CopyMode::default(),
            verify_checksum: false,
            write_mapping: default_write_mapping(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    /// Reject invalid parameters before any work starts.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.clustering.eps.is_finite() || self.clustering.eps <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "eps must be a positive number, got {}",
                self.clustering.eps
            )));
        }
        if self.clustering.min_pts < 1 {
            return Err(PipelineError::Configuration(
                "min_pts must be at least 1".to_string(),
            ));
        }
        if self.scanner.max_workers == Some(0) {
            return Err(PipelineError::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.scanner.decode_workers == Some(0) {
            return Err(PipelineError::Configuration(
                "decode_workers must be at least 1".to_string(),
            ));
        }
        if self.scanner.image_extensions.is_empty() {
            return Err(PipelineError::Configuration(
                "image_extensions must not be empty".to_string(),
            ));
        }
        if self.scanner.min_file_bytes >= self.scanner.max_file_bytes {
            return Err(PipelineError::Configuration(format!(
                "min_file_bytes ({}) must be below max_file_bytes ({})",
                self.scanner.min_file_bytes, self.scanner.max_file_bytes
            )));
        }
        if self.scanner.max_detect_edge == 0 {
            return Err(PipelineError::Configuration(
                "max_detect_edge must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
