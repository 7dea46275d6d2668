//! Logging setup.
//!
//! Log level is controlled via the `FACESORT_LOG` environment variable:
//! - `FACESORT_LOG=debug` for verbose output
//! - `FACESORT_LOG=info` for standard output (default)
//! - `FACESORT_LOG=warn` for warnings and errors only

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system. Logs go to stderr so progress output and
/// piped results stay clean. Safe to call more than once.
pub fn init() {
    let env_filter =
        EnvFilter::try_from_env("FACESORT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .try_init();
}
