pub mod discovery;

use std::path::PathBuf;

pub use discovery::discover_images;

/// One image found during the folder scan.
///
/// `id` is the stable discovery index; workers write their results into a
/// slot array keyed by it, which keeps downstream ordering independent of
/// worker completion order.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub id: usize,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Assign stable discovery indices to a sorted path list.
pub fn source_images(paths: Vec<PathBuf>) -> Vec<SourceImage> {
    paths
        .into_iter()
        .enumerate()
        .map(|(id, path)| {
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            SourceImage {
                id,
                path,
                size_bytes,
            }
        })
        .collect()
}
