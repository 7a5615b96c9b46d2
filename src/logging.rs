// src/logging.rs
//
// tracing subscriber setup: stderr output with local HH:MM:SS.mmm timestamps,
// optionally mirrored into a timestamped log file.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PATTERN: &str = "%Y%m%d-%H%M%S-serialtap.log";
const LOG_SYMLINK: &str = "serialtap.log";

/// Local wall-clock timestamps, e.g. `14:03:27.512`
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalClock;

impl FormatTime for LocalClock {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. When `reports_dir` is
/// given, output is also written to a new timestamped file there, whose path
/// is returned.
pub fn init_logging(
    default_filter: &str,
    reports_dir: Option<&Path>,
) -> Result<Option<PathBuf>, String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_timer(LocalClock)
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, log_path) = match reports_dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(LocalClock)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("Failed to install log subscriber: {}", e))?;

    if let Some(path) = &log_path {
        tracing::info!("[logging] File logging started: {}", path.display());
    }
    Ok(log_path)
}

/// Create a timestamped log file in `dir` and point the `serialtap.log`
/// symlink at it (Unix only).
pub fn open_log_file(dir: &Path) -> Result<(File, PathBuf), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create reports dir: {}", e))?;

    let filename = chrono::Local::now().format(LOG_FILE_PATTERN).to_string();
    let log_path = dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    // Windows symlinks require elevated privileges
    #[cfg(unix)]
    {
        let symlink_path = dir.join(LOG_SYMLINK);
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!("[logging] Failed to create {} symlink: {}", LOG_SYMLINK, e);
        }
    }

    Ok((file, log_path))
}
