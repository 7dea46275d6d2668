//! Unicode-safe image decoding with EXIF orientation correction.
//!
//! Paths containing non-ASCII characters are the primary correctness
//! requirement here: some decode paths mangle or reject such paths, so
//! three strategies are tried in order before a file is declared
//! undecodable: decode from the path as-is, decode from bytes read into
//! memory, and decode from a copy under an ASCII-only temporary name.

use image::{DynamicImage, GenericImageView};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::PipelineError;

/// Decode an image and return an orientation-corrected pixel buffer.
///
/// Returns a [`PipelineError::Decode`] when every strategy fails; the
/// caller reports that failure and excludes the file, it is never retried.
pub fn load(path: &Path) -> Result<DynamicImage, PipelineError> {
    let img = decode_any(path).map_err(|reason| PipelineError::Decode {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(correct_orientation(img, read_orientation(path)))
}

/// Downscale a buffer so its longer edge is at most `max_edge`.
///
/// Returns the (possibly original) buffer plus the scale factor that was
/// applied, for mapping detected regions back to source coordinates.
pub fn downscale_for_detection(img: DynamicImage, max_edge: u32) -> (DynamicImage, f32) {
    let (width, height) = (img.width(), img.height());
    let longest = width.max(height);
    if longest <= max_edge {
        return (img, 1.0);
    }
    let scale = max_edge as f32 / longest as f32;
    let new_width = ((width as f32 * scale).round() as u32).max(1);
    let new_height = ((height as f32 * scale).round() as u32).max(1);
    let resized = img.resize_exact(new_width, new_height, image::imageops::FilterType::Triangle);
    (resized, new_width as f32 / width as f32)
}

fn decode_any(path: &Path) -> Result<DynamicImage, String> {
    // Strategy 1: hand the path straight to the codec.
    let direct_err = match image::open(path) {
        Ok(img) => return Ok(img),
        Err(e) => e.to_string(),
    };

    // Strategy 2: read the bytes ourselves, decode from memory. Sidesteps
    // any path handling inside the decoder.
    let memory_err = match std::fs::read(path) {
        Ok(bytes) => match image::load_from_memory(&bytes) {
            Ok(img) => return Ok(img),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    // Strategy 3: copy to a temp file whose name is plain ASCII.
    let temp_err = match decode_via_tempfile(path) {
        Ok(img) => return Ok(img),
        Err(e) => e,
    };

    Err(format!(
        "direct: {direct_err}; from-memory: {memory_err}; tempfile: {temp_err}"
    ))
}

fn decode_via_tempfile(path: &Path) -> Result<DynamicImage, String> {
    let suffix: String = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("img")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    let temp = tempfile::Builder::new()
        .prefix("facesort-")
        .suffix(&format!(".{suffix}"))
        .tempfile()
        .map_err(|e| e.to_string())?;
    std::fs::copy(path, temp.path()).map_err(|e| e.to_string())?;
    image::open(temp.path()).map_err(|e| e.to_string())
}

/// EXIF orientation tag value, 1 when absent or unreadable.
fn read_orientation(path: &Path) -> u32 {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 1,
    };
    let mut reader = BufReader::new(file);
    match exif::Reader::new().read_from_container(&mut reader) {
        Ok(meta) => meta
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    }
}

fn correct_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}
