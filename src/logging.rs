//! Tracing setup.
//!
//! Humans read stdout, machines read the log file: the stdout layer is compact and
//! `RUST_LOG`-filtered (default `info`), and when the configuration names a log file a second
//! layer appends newline-delimited JSON records to it through a non-blocking writer. The
//! returned [`LogGuard`] owns that writer's flush worker, so the caller holds it until
//! process exit.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keeps the background log writer flushing; dropping it ends file logging.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Install the global tracing subscriber.
///
/// `log_file` comes from the loaded configuration; `None` means stdout only. A file that
/// cannot be opened disables file logging with a note on stderr rather than failing startup.
pub fn init_tracing(log_file: Option<&Path>) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = fmt::layer().with_target(false).compact();

    let (file_layer, worker) = match log_file.map(open_log_file) {
        Some(Ok(file)) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        Some(Err(err)) => {
            eprintln!("File logging disabled: {err}");
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file_layer)
        .init();

    LogGuard { _worker: worker }
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}
