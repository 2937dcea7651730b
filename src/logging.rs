//! Logging sink setup: a single append-only log file with timestamped
//! lines, matching the original daemon's single-sink design.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, TftpError};

struct TimestampFormat;

impl FormatTime for TimestampFormat {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Opens `path` for append (creating it with mode 0600 if absent) and
/// installs it as the global `tracing` subscriber sink. `default_level`
/// is the filter used absent an `RUST_LOG` override (callers pass
/// `"debug"` for `-v`, otherwise the config file's `logging.level`).
///
/// Writes go through a non-blocking appender so a slow or stalled disk
/// never stalls the reactor; the returned guard must be held for the
/// life of the process; dropping it early flushes and severs the
/// background writer thread, silently losing any buffered lines.
pub fn init(path: &Path, default_level: &str) -> Result<WorkerGuard> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| TftpError::Tftp(format!("failed to open log file {}: {e}", path.display())))?;

    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(TimestampFormat)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| TftpError::Tftp(format!("failed to install log subscriber: {e}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_log_file_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tundra-tftpd.log");
        let _guard = init(&path, "info").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(mode.mode() & 0o777, 0o600);
    }
}
