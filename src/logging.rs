//! Console + rolling file logging.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{platform_data_dir, APP_DIR_NAME};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix used by the rolling appender.
pub const LOG_FILE_PREFIX: &str = "pos-db-health";

const DEFAULT_FILTER: &str = "info,pos_db_health=debug";

/// Log directory next to the database directory.
pub fn get_log_dir() -> PathBuf {
    platform_data_dir().join(APP_DIR_NAME).join("logs")
}

/// Prune old log files in `log_dir`, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((entry.path(), modified))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Install the global subscriber. The returned guard flushes the file writer
/// when dropped and must be held until exit.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    prune_old_logs(log_dir);
    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("cannot create log directory {}: {e}", log_dir.display());
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    // Console goes to stderr; stdout carries the JSON report.
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::temp_dir;
    use serial_test::serial;
    use std::fs::File;
    use std::time::Duration;

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = temp_dir("logs_prune");
        let now = SystemTime::now();
        for i in 0..14u64 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-01-{:02}", i + 1));
            let file = File::create(&path).unwrap();
            file.set_modified(now - Duration::from_secs(3600 * (14 - i)))
                .unwrap();
        }
        fs::write(dir.join("unrelated.txt"), b"keep").unwrap();

        assert_eq!(prune_old_logs(&dir), 4);
        assert!(!dir.join(format!("{LOG_FILE_PREFIX}.2026-01-01")).exists());
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-14")).exists());
        assert!(dir.join("unrelated.txt").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = temp_dir("logs_missing").join("nope");
        assert_eq!(prune_old_logs(&dir), 0);
    }

    #[test]
    #[serial]
    fn test_log_dir_follows_data_dir() {
        let base = temp_dir("logs_base");
        std::env::set_var("POS_DATA_DIR", &base);
        assert_eq!(get_log_dir(), base.join(APP_DIR_NAME).join("logs"));
        std::env::remove_var("POS_DATA_DIR");
        let _ = fs::remove_dir_all(&base);
    }
}
