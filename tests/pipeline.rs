//! End-to-end pipeline tests over a deterministic stub backend.
//!
//! The stub derives a "face" from each saturated image quadrant, with the
//! quadrant color as its embedding. Solid-color photos therefore act as
//! portraits of one person, split-color photos as group shots, and gray
//! photos as scenery, without any model files or ONNX runtime.

use anyhow::Result;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use facesort::backend::{DetectedFace, FaceBackend};
use facesort::config::{Config, CopyMode};
use facesort::error::Stage;
use facesort::index::BoundingBox;
use facesort::pipeline::{run_with_backend, RunSummary};

const RED: [u8; 3] = [220, 30, 30];
const BLUE: [u8; 3] = [30, 30, 220];
const GRAY: [u8; 3] = [120, 120, 120];

struct ColorStubBackend;

impl FaceBackend for ColorStubBackend {
    fn name(&self) -> &'static str {
        "color-stub"
    }

    fn embedding_dim(&self) -> usize {
        3
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let (width, height) = img.dimensions();
        let rgb = img.to_rgb8();

        let samples = [
            (width / 4, height / 4),
            (3 * width / 4, height / 4),
            (width / 4, 3 * height / 4),
            (3 * width / 4, 3 * height / 4),
        ];

        let mut faces: Vec<DetectedFace> = Vec::new();
        for (x, y) in samples {
            let pixel = rgb.get_pixel(x.min(width - 1), y.min(height - 1));
            let max = pixel[0].max(pixel[1]).max(pixel[2]);
            let min = pixel[0].min(pixel[1]).min(pixel[2]);
            if max - min < 60 {
                continue; // unsaturated: no face here
            }

            let mut embedding = vec![pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
            let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
            for v in &mut embedding {
                *v /= norm;
            }
            if faces.iter().any(|f| f.embedding == embedding) {
                continue;
            }

            faces.push(DetectedFace {
                bbox: BoundingBox {
                    x: x as i32,
                    y: y as i32,
                    width: (width / 4) as i32,
                    height: (height / 4) as i32,
                },
                embedding,
                confidence: 0.9,
            });
        }

        Ok(faces)
    }
}

struct SlowBackend;

impl FaceBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow-stub"
    }

    fn embedding_dim(&self) -> usize {
        3
    }

    fn detect(&self, _img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        std::thread::sleep(Duration::from_millis(25));
        Ok(Vec::new())
    }
}

fn solid_png(path: &Path, color: [u8; 3]) {
    RgbImage::from_pixel(64, 64, Rgb(color)).save(path).unwrap();
}

fn split_png(path: &Path, left: [u8; 3], right: [u8; 3]) {
    let img = RgbImage::from_fn(64, 64, |x, _| {
        if x < 32 {
            Rgb(left)
        } else {
            Rgb(right)
        }
    });
    img.save(path).unwrap();
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.clustering.eps = 0.3;
    config.clustering.min_pts = 1;
    config.scanner.min_file_bytes = 0;
    config.scanner.max_workers = Some(2);
    config
}

fn run_stub(config: &Config, input: &Path, output: &Path) -> RunSummary {
    run_with_backend(config, Arc::new(ColorStubBackend), input, output, None, None).unwrap()
}

fn files_in(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn scenario_two_people_and_scenery() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    solid_png(&input.path().join("a1.png"), RED);
    solid_png(&input.path().join("a2.png"), RED);
    split_png(&input.path().join("ab.png"), RED, BLUE);
    solid_png(&input.path().join("z1.png"), GRAY);
    solid_png(&input.path().join("z2.png"), GRAY);

    let summary = run_stub(&test_config(), input.path(), output.path());

    assert_eq!(summary.discovered, 5);
    assert_eq!(summary.scanned, 5);
    assert_eq!(summary.clusters, 2);
    assert!(summary.failures.is_empty());

    // Person A (red) appears first in discovery order, so gets identity-1.
    assert_eq!(
        files_in(&output.path().join("identity-1")),
        vec!["a1.png", "a2.png", "ab.png"]
    );
    // The joint photo also lands under person B.
    assert_eq!(files_in(&output.path().join("identity-2")), vec!["ab.png"]);
    assert_eq!(
        files_in(&output.path().join("unsorted")),
        vec!["z1.png", "z2.png"]
    );
}

#[test]
fn unicode_path_scans_like_ascii() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    solid_png(&input.path().join("portrait.png"), RED);
    let unicode = input.path().join("портрет-写真.png");
    std::fs::copy(input.path().join("portrait.png"), &unicode).unwrap();

    let summary = run_stub(&test_config(), input.path(), output.path());

    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.faces, 2);
    assert!(summary.failures.is_empty());
    // Identical pixels embed identically, so both land in one identity.
    assert_eq!(summary.clusters, 1);
    assert_eq!(files_in(&output.path().join("identity-1")).len(), 2);
}

#[test]
fn corrupt_file_produces_one_decode_failure() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    solid_png(&input.path().join("good.png"), RED);
    std::fs::write(input.path().join("broken.png"), b"definitely not a png").unwrap();

    let summary = run_stub(&test_config(), input.path(), output.path());

    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].stage, Stage::Decode);
    assert!(summary.failures[0].path.ends_with("broken.png"));
    // The remaining file is unaffected.
    assert_eq!(files_in(&output.path().join("identity-1")), vec!["good.png"]);
}

#[test]
fn min_pts_three_leaves_unreached_faces_unsorted() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    solid_png(&input.path().join("p1.png"), RED);
    solid_png(&input.path().join("p2.png"), RED);

    let mut config = test_config();
    config.clustering.min_pts = 3;
    let summary = run_stub(&config, input.path(), output.path());

    // Two mutually close faces with no third reaching them: noise.
    assert_eq!(summary.clusters, 0);
    assert_eq!(summary.noise_faces, 2);
    assert_eq!(
        files_in(&output.path().join("unsorted")),
        vec!["p1.png", "p2.png"]
    );
    assert!(!output.path().join("identity-1").exists());
}

#[test]
fn move_mode_round_trip() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let single = input.path().join("solo.png");
    let joint = input.path().join("together.png");
    solid_png(&single, RED);
    split_png(&joint, RED, BLUE);

    let mut config = test_config();
    config.output.copy_mode = CopyMode::Move;
    config.output.verify_checksum = true;
    let summary = run_stub(&config, input.path(), output.path());

    assert!(summary.failures.is_empty());
    assert!(!single.exists());
    assert!(!joint.exists());

    // The single-destination file exists exactly once under the tree.
    let solo_copies: Vec<_> = walkdir::WalkDir::new(output.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() == "solo.png")
        .collect();
    assert_eq!(solo_copies.len(), 1);

    // The group photo was placed under both identities.
    assert!(output.path().join("identity-1/together.png").exists());
    assert!(output.path().join("identity-2/together.png").exists());
}

#[test]
fn colliding_filenames_both_survive() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    std::fs::create_dir_all(input.path().join("march")).unwrap();
    std::fs::create_dir_all(input.path().join("april")).unwrap();
    solid_png(&input.path().join("march/photo.png"), RED);
    solid_png(&input.path().join("april/photo.png"), RED);

    let summary = run_stub(&test_config(), input.path(), output.path());

    assert!(summary.failures.is_empty());
    assert_eq!(
        files_in(&output.path().join("identity-1")),
        vec!["photo-1.png", "photo.png"]
    );
}

#[test]
fn copy_mode_keeps_sources_byte_identical() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let src = input.path().join("keepme.png");
    solid_png(&src, RED);
    let original = std::fs::read(&src).unwrap();

    let summary = run_stub(&test_config(), input.path(), output.path());

    assert_eq!(summary.placed, 1);
    assert!(src.exists());
    let placed = output.path().join("identity-1/keepme.png");
    assert_eq!(std::fs::read(&placed).unwrap(), original);
    assert_eq!(std::fs::read(&src).unwrap(), original);
}

#[test]
fn cancelled_run_completes_over_partial_set() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    for i in 0..4 {
        solid_png(&input.path().join(format!("p{i}.png")), RED);
    }

    let cancel = Arc::new(AtomicBool::new(true));
    let summary = run_with_backend(
        &test_config(),
        Arc::new(ColorStubBackend),
        input.path(),
        output.path(),
        None,
        Some(cancel),
    )
    .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.scanned, 0);
    assert_eq!(summary.placed, 0);
    assert!(summary.failures.is_empty());
}

#[test]
fn per_item_timeout_is_a_reported_failure() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    solid_png(&input.path().join("a.png"), RED);
    solid_png(&input.path().join("b.png"), RED);

    let mut config = test_config();
    config.scanner.per_item_timeout_ms = 1;
    let summary = run_with_backend(
        &config,
        Arc::new(SlowBackend),
        input.path(),
        output.path(),
        None,
        None,
    )
    .unwrap();

    assert_eq!(summary.scanned, 0);
    assert_eq!(summary.failures.len(), 2);
    for failure in &summary.failures {
        assert_eq!(failure.stage, Stage::Detection);
        assert!(failure.reason.contains("budget"));
    }
}

#[test]
fn progress_callback_fires_per_unit_and_counts_failures() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    solid_png(&input.path().join("ok.png"), RED);
    std::fs::write(input.path().join("bad.png"), b"nope").unwrap();

    let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
    let calls_clone = calls.clone();
    let progress: Arc<facesort::tasks::ProgressFn> =
        Arc::new(move |path: &Path, p: facesort::tasks::ScanProgress| {
            calls_clone
                .lock()
                .unwrap()
                .push((path.to_path_buf(), p.completed, p.total, p.failures));
        });

    let summary = run_with_backend(
        &test_config(),
        Arc::new(ColorStubBackend),
        input.path(),
        output.path(),
        Some(progress),
        None,
    )
    .unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2, "one callback per completed unit");
    assert!(calls.iter().all(|(_, _, total, _)| *total == 2));
    let last = calls.last().unwrap();
    assert_eq!(last.1, 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(calls.iter().map(|c| c.3).max(), Some(1));
}

#[test]
fn mapping_manifest_lists_placed_faces() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    solid_png(&input.path().join("one.png"), RED);
    split_png(&input.path().join("two.png"), RED, BLUE);

    let summary = run_stub(&test_config(), input.path(), output.path());
    assert!(summary.failures.is_empty());

    let mapping = std::fs::read_to_string(output.path().join("mapping.csv")).unwrap();
    let rows: Vec<&str> = mapping.lines().skip(1).collect();
    // one face in one.png + two faces in two.png
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().any(|r| r.starts_with("identity-2,")));
}

#[test]
fn invalid_configuration_fails_before_any_work() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    solid_png(&input.path().join("a.png"), RED);

    let mut config = test_config();
    config.clustering.eps = -0.5;
    let result = run_with_backend(
        &config,
        Arc::new(ColorStubBackend),
        input.path(),
        output.path(),
        None,
        None,
    );

    assert!(result.is_err());
    // Nothing was created under the destination.
    assert!(files_in(output.path()).is_empty());
}
