use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ScannerConfig;

/// Find candidate image files under `directory`.
///
/// Honors the extension allow-list, the recursive flag, and the file-size
/// guards. Hidden files and directories are skipped. The result is sorted
/// by path so discovery indices are reproducible across runs.
pub fn discover_images(directory: &Path, config: &ScannerConfig) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();

    let max_depth = if config.recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(directory)
        .follow_links(false)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| !is_hidden(e.file_name()) || e.depth() == 0);

    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(ext) = path.extension() else {
            continue;
        };
        let ext_lower = ext.to_string_lossy().to_lowercase();
        if !config
            .image_extensions
            .iter()
            .any(|e| e.to_lowercase() == ext_lower)
        {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => {
                let size = meta.len();
                if size < config.min_file_bytes || size > config.max_file_bytes {
                    tracing::debug!(path = %path.display(), size, "skipping file outside size guards");
                    continue;
                }
            }
            Err(_) => continue,
        }

        images.push(path.to_path_buf());
    }

    // Sort by path for consistent ordering
    images.sort();

    Ok(images)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}
