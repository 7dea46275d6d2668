//! Executes a sort plan against the destination tree.
//!
//! One folder per identity cluster plus an `unsorted` bucket. Copies are
//! verified (size, optionally SHA-256) before a moved source is removed,
//! so a source file never vanishes without a complete destination copy.
//! Failures are per placement and never abort the remaining entries.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::backend::cosine_similarity;
use crate::cluster::{ClusterAssignment, ClusterLabel};
use crate::config::{CopyMode, OutputConfig};
use crate::error::{FailureRecord, Stage};
use crate::index::EmbeddingIndex;
use crate::plan::SortPlanEntry;
use crate::scanner::SourceImage;

/// Folder receiving images with no recognized face.
pub const UNSORTED_DIR: &str = "unsorted";

/// Folder name for a cluster label. Labels are opaque ids; a human can
/// rename the folders afterwards.
pub fn identity_folder(label: ClusterLabel) -> String {
    format!("identity-{}", label + 1)
}

/// One completed placement of a source file in the destination tree.
#[derive(Debug, Clone)]
pub struct Placement {
    pub image: usize,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub folder: String,
}

#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    pub placements: Vec<Placement>,
    pub failures: Vec<FailureRecord>,
}

/// Execute the plan under `dest_root`.
///
/// Copy mode places an independent copy per destination folder. Move mode
/// first writes and verifies every destination copy, then removes the
/// source; any verification failure keeps the source in place.
pub fn materialize(
    plan: &[SortPlanEntry],
    images: &[SourceImage],
    index: &EmbeddingIndex,
    assignment: &ClusterAssignment,
    dest_root: &Path,
    config: &OutputConfig,
) -> Result<MaterializeOutcome> {
    fs::create_dir_all(dest_root)
        .with_context(|| format!("failed to create destination root {}", dest_root.display()))?;

    let mut outcome = MaterializeOutcome::default();

    for entry in plan {
        let Some(image) = images.get(entry.image) else {
            continue;
        };
        materialize_entry(entry, image, dest_root, config, &mut outcome);
    }

    if config.write_mapping {
        if let Err(e) = write_mapping(dest_root, &outcome.placements, index, assignment, images) {
            tracing::warn!(error = %e, "failed to write mapping.csv");
        }
    }

    Ok(outcome)
}

fn materialize_entry(
    entry: &SortPlanEntry,
    image: &SourceImage,
    dest_root: &Path,
    config: &OutputConfig,
    outcome: &mut MaterializeOutcome,
) {
    let folders: Vec<String> = if entry.unsorted {
        vec![UNSORTED_DIR.to_string()]
    } else {
        entry.labels.iter().map(|&l| identity_folder(l)).collect()
    };

    let filename = match image.path.file_name() {
        Some(name) => name.to_os_string(),
        None => {
            outcome.failures.push(FailureRecord::new(
                &image.path,
                Stage::Materialization,
                "source path has no file name",
            ));
            return;
        }
    };

    let mut written: Vec<Placement> = Vec::with_capacity(folders.len());
    let mut entry_ok = true;

    for folder in &folders {
        let dir = dest_root.join(folder);
        let result = fs::create_dir_all(&dir)
            .map_err(|e| format!("failed to create {}: {}", dir.display(), e))
            .and_then(|_| {
                let destination = unique_destination(&dir, &filename);
                copy_verified(&image.path, &destination, config.verify_checksum)
                    .map(|_| destination)
                    .map_err(|e| e.to_string())
            });

        match result {
            Ok(destination) => written.push(Placement {
                image: image.id,
                source: image.path.clone(),
                destination,
                folder: folder.clone(),
            }),
            Err(reason) => {
                outcome.failures.push(FailureRecord::new(
                    &image.path,
                    Stage::Materialization,
                    reason,
                ));
                entry_ok = false;
            }
        }
    }

    // In move mode the source goes away only after every destination copy
    // verified; a partial entry keeps the source and drops its copies.
    if config.copy_mode == CopyMode::Move {
        if entry_ok && !written.is_empty() {
            if let Err(e) = fs::remove_file(&image.path) {
                outcome.failures.push(FailureRecord::new(
                    &image.path,
                    Stage::Materialization,
                    format!("destination copies verified but source removal failed: {e}"),
                ));
            }
        } else {
            for placement in &written {
                let _ = fs::remove_file(&placement.destination);
            }
            written.clear();
        }
    }

    outcome.placements.append(&mut written);
}

/// First collision-free name in `dir`: the original filename, then
/// `stem-1.ext`, `stem-2.ext`, ...
fn unique_destination(dir: &Path, filename: &std::ffi::OsStr) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(filename);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string_lossy().to_string());
    let extension = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}-{counter}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Copy and verify the destination is complete before reporting success.
fn copy_verified(source: &Path, destination: &Path, checksum: bool) -> Result<()> {
    let copy_result = (|| -> Result<()> {
        fs::copy(source, destination).context("copy failed")?;

        let source_len = fs::metadata(source)?.len();
        let dest_len = fs::metadata(destination)?.len();
        if source_len != dest_len {
            bail!("size mismatch after copy ({source_len} vs {dest_len} bytes)");
        }

        if checksum && sha256_file(source)? != sha256_file(destination)? {
            bail!("checksum mismatch after copy");
        }
        Ok(())
    })();

    if copy_result.is_err() {
        // Never leave a half-written file at the destination.
        let _ = fs::remove_file(destination);
    }
    copy_result
}

fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Write the per-face manifest at the destination root: which person each
/// placed photo was filed under, and how close the face sat to its
/// cluster centroid.
fn write_mapping(
    dest_root: &Path,
    placements: &[Placement],
    index: &EmbeddingIndex,
    assignment: &ClusterAssignment,
    images: &[SourceImage],
) -> Result<()> {
    let mut destination_of: HashMap<(usize, &str), &Path> = HashMap::new();
    for placement in placements {
        destination_of.insert(
            (placement.image, placement.folder.as_str()),
            placement.destination.as_path(),
        );
    }

    let mut writer = csv::Writer::from_path(dest_root.join("mapping.csv"))?;
    writer.write_record([
        "person_id",
        "image_src",
        "dest_path",
        "face_idx",
        "bbox",
        "confidence",
        "cosine_to_centroid",
    ])?;

    let mut face_idx_in_image: HashMap<usize, usize> = HashMap::new();
    for (observation, label) in index.iter().zip(assignment.labels.iter()) {
        let face_idx = {
            let counter = face_idx_in_image.entry(observation.image).or_insert(0);
            let current = *counter;
            *counter += 1;
            current
        };

        let Some(label) = label else {
            continue;
        };
        let folder = identity_folder(*label);
        let Some(destination) = destination_of.get(&(observation.image, folder.as_str())) else {
            continue;
        };
        let Some(image) = images.get(observation.image) else {
            continue;
        };

        let centroid_similarity = assignment
            .clusters
            .get(*label)
            .map(|c| cosine_similarity(&observation.embedding, &c.centroid))
            .unwrap_or(0.0);

        writer.write_record(&[
            folder.clone(),
            image.path.to_string_lossy().to_string(),
            destination.to_string_lossy().to_string(),
            face_idx.to_string(),
            format!(
                "{},{},{},{}",
                observation.bbox.x,
                observation.bbox.y,
                observation.bbox.width,
                observation.bbox.height
            ),
            format!("{:.4}", observation.confidence),
            format!("{:.4}", centroid_similarity),
        ])?;
    }

    writer.flush()?;
    Ok(())
}
