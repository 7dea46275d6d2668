use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use facesort::config::{BackendKind, Config, CopyMode, DistanceMetric};
use facesort::tasks::{ProgressFn, ScanProgress};
use facesort::{logging, pipeline};

struct Args {
    config_path: Option<PathBuf>,
    input: PathBuf,
    output: PathBuf,
    backend: Option<BackendKind>,
    eps: Option<f32>,
    min_pts: Option<usize>,
    metric: Option<DistanceMetric>,
    move_files: bool,
    flat: bool,
    workers: Option<usize>,
    timeout_ms: Option<u64>,
    checksum: bool,
    report: Option<PathBuf>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = None;
    let mut backend = None;
    let mut eps = None;
    let mut min_pts = None;
    let mut metric = None;
    let mut move_files = false;
    let mut flat = false;
    let mut workers = None;
    let mut timeout_ms = None;
    let mut checksum = false;
    let mut report = None;
    let mut positional: Vec<PathBuf> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facesort {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(required_value(&args, &mut i, "--config")));
            }
            "--backend" | "-b" => {
                backend = Some(match required_value(&args, &mut i, "--backend").as_str() {
                    "deep-embedding" => BackendKind::DeepEmbedding,
                    "landmark" => BackendKind::Landmark,
                    "cascade" => BackendKind::Cascade,
                    other => {
                        eprintln!("Unknown backend: {other} (expected deep-embedding, landmark or cascade)");
                        std::process::exit(1);
                    }
                });
            }
            "--eps" => {
                eps = Some(parse_or_exit(&required_value(&args, &mut i, "--eps"), "--eps"));
            }
            "--min-pts" => {
                min_pts = Some(parse_or_exit(
                    &required_value(&args, &mut i, "--min-pts"),
                    "--min-pts",
                ));
            }
            "--metric" => {
                metric = Some(match required_value(&args, &mut i, "--metric").as_str() {
                    "cosine" => DistanceMetric::Cosine,
                    "euclidean" => DistanceMetric::Euclidean,
                    other => {
                        eprintln!("Unknown metric: {other} (expected cosine or euclidean)");
                        std::process::exit(1);
                    }
                });
            }
            "--move" => move_files = true,
            "--flat" => flat = true,
            "--workers" | "-w" => {
                workers = Some(parse_or_exit(
                    &required_value(&args, &mut i, "--workers"),
                    "--workers",
                ));
            }
            "--timeout-ms" => {
                timeout_ms = Some(parse_or_exit(
                    &required_value(&args, &mut i, "--timeout-ms"),
                    "--timeout-ms",
                ));
            }
            "--checksum" => checksum = true,
            "--report" => {
                report = Some(PathBuf::from(required_value(&args, &mut i, "--report")));
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
            _ => positional.push(PathBuf::from(&args[i])),
        }
        i += 1;
    }

    if positional.len() != 2 {
        eprintln!("Expected exactly two paths: an input folder and an output folder");
        print_help();
        std::process::exit(1);
    }
    let output = positional.pop().unwrap();
    let input = positional.pop().unwrap();

    Args {
        config_path,
        input,
        output,
        backend,
        eps,
        min_pts,
        metric,
        move_files,
        flat,
        workers,
        timeout_ms,
        checksum,
        report,
    }
}

fn required_value(args: &[String], i: &mut usize, flag: &str) -> String {
    if *i + 1 < args.len() {
        *i += 1;
        args[*i].clone()
    } else {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    }
}

fn parse_or_exit<T: std::str::FromStr>(value: &str, flag: &str) -> T {
    match value.parse() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("Error: invalid value for {flag}: {value}");
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"facesort - sort a photo folder into per-person directories

USAGE:
    facesort [OPTIONS] <INPUT_DIR> <OUTPUT_DIR>

OPTIONS:
    --config, -c PATH    Path to config file (TOML)
    --backend, -b NAME   deep-embedding | landmark | cascade
    --eps FLOAT          Clustering neighbor-distance threshold
    --min-pts N          Minimum neighborhood size for a cluster seed
    --metric NAME        cosine | euclidean
    --move               Move files instead of copying
    --flat               Do not recurse into subdirectories
    --workers, -w N      Detection worker count
    --timeout-ms N       Per-item decode+detect budget (0 disables)
    --checksum           Verify SHA-256 before removing moved sources
    --report PATH        Write the run summary as JSON
    --version, -V        Show version
    --help, -h           Show this help message

ENVIRONMENT:
    FACESORT_LOG         Log level (trace, debug, info, warn, error)
"#
    );
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(eps) = args.eps {
        config.clustering.eps = eps;
    }
    if let Some(min_pts) = args.min_pts {
        config.clustering.min_pts = min_pts;
    }
    if let Some(metric) = args.metric {
        config.clustering.metric = metric;
    }
    if args.move_files {
        config.output.copy_mode = CopyMode::Move;
    }
    if args.flat {
        config.scanner.recursive = false;
    }
    if let Some(workers) = args.workers {
        config.scanner.max_workers = Some(workers);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.scanner.per_item_timeout_ms = timeout_ms;
    }
    if args.checksum {
        config.output.verify_checksum = true;
    }
}

fn main() -> Result<()> {
    logging::init();
    let args = parse_args();

    let mut config = Config::load(args.config_path.as_deref())?;
    apply_overrides(&mut config, &args);

    let progress: Arc<ProgressFn> = Arc::new(|path: &std::path::Path, p: ScanProgress| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        eprint!(
            "\r[{}/{}] {} failure(s)  {:<40.40}",
            p.completed, p.total, p.failures, name
        );
        if p.completed == p.total {
            eprintln!();
        }
    });

    let summary = pipeline::run(&config, &args.input, &args.output, Some(progress), None)?;

    println!(
        "{} images scanned ({} discovered), {} faces, {} identities, {} noise faces, {} files placed",
        summary.scanned,
        summary.discovered,
        summary.faces,
        summary.clusters,
        summary.noise_faces,
        summary.placed
    );
    if summary.cancelled {
        println!("run was cancelled; results cover the partial set");
    }

    if !summary.failures.is_empty() {
        println!("{} failure(s):", summary.failures.len());
        for failure in &summary.failures {
            println!("  {failure}");
        }
    }

    if let Some(report_path) = &args.report {
        std::fs::write(report_path, serde_json::to_string_pretty(&summary)?)?;
        println!("report written to {}", report_path.display());
    }

    Ok(())
}
