//! Logging for uzoned.
//!
//! Operational logs go to stderr; the per-query request log is emitted on
//! its own tracing target and can be routed to a dedicated file.

use camino::Utf8Path;
use tracing_subscriber::filter::{filter_fn, EnvFilter, LevelFilter};
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// The target the request logger emits on.
pub const REQUEST_TARGET: &str = "uzoned::request";

/// Install the global logger.
///
/// `level` comes from the configuration ("trace" .. "error"); the
/// `RUST_LOG` environment variable refines it further. When
/// `request_log_path` is set, request-target events go to that file (append
/// mode) instead of stderr.
///
/// # Panics
///
/// Panics if a global logger was installed already.
pub fn init(level: Option<&str>, request_log_path: Option<&Utf8Path>) -> Result<(), String> {
    let default_level = match level.unwrap_or("info") {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warning" | "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        other => return Err(format!("invalid log level: '{other}'")),
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let split_request_log = request_log_path.is_some();
    let stderr_layer = FmtLayer::new()
        .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
        .with_writer(std::io::stderr)
        .with_filter(filter_fn(move |meta| {
            !split_request_log || meta.target() != REQUEST_TARGET
        }));

    let request_layer = match request_log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| format!("cannot open request log '{path}': {err}"))?;
            let layer = FmtLayer::new()
                .with_ansi(false)
                .with_target(false)
                .with_writer(file)
                .with_filter(filter_fn(|meta| meta.target() == REQUEST_TARGET));
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(request_layer)
        .init();
    Ok(())
}
