//! Runtime configuration for the startup health pipeline.
//!
//! Defaults match what the desktop app ships with; a handful of knobs can be
//! overridden through environment variables for support sessions.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::path_migrator::PathProvider;

/// Directory name (under the platform data dir) that holds the POS data.
pub const APP_DIR_NAME: &str = "com.thesmall.pos";

/// Database file name inside the app data directory.
pub const DB_FILE_NAME: &str = "pos.db";

const ENV_DATA_DIR: &str = "POS_DATA_DIR";
const ENV_LOCK_STALE_SECS: &str = "POS_DB_LOCK_STALE_SECS";
const ENV_MAX_BACKUPS: &str = "POS_DB_MAX_BACKUPS";
const ENV_REMOVE_LEGACY: &str = "POS_DB_REMOVE_LEGACY";

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Prefix used in backup file names (`<app>-<operation>-backup-...`).
    pub app_name: String,
    /// Name of the backups directory created next to the database file.
    pub backup_dir_name: String,
    /// Sidecar files younger than this are treated as a live lock.
    pub lock_staleness: Duration,
    /// A legacy file modified within this window is considered live data.
    pub legacy_recency_window: Duration,
    /// Backups kept per directory after a successful startup (0 = keep all).
    pub max_backups: usize,
    pub max_repair_attempts: u32,
    pub remove_legacy_after_migration: bool,
    /// Upper bound on state transitions in one pipeline run.
    pub max_transitions: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            app_name: "pos".to_string(),
            backup_dir_name: "backups".to_string(),
            lock_staleness: Duration::from_secs(5 * 60),
            legacy_recency_window: Duration::from_secs(60 * 60),
            max_backups: 10,
            max_repair_attempts: 1,
            remove_legacy_after_migration: false,
            max_transitions: 32,
        }
    }
}

impl HealthConfig {
    /// Defaults overlaid with `POS_DB_*` environment overrides. Malformed
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>(ENV_LOCK_STALE_SECS) {
            config.lock_staleness = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<usize>(ENV_MAX_BACKUPS) {
            config.max_backups = max;
        }
        if let Ok(raw) = std::env::var(ENV_REMOVE_LEGACY) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.remove_legacy_after_migration = true,
                "0" | "false" | "no" => config.remove_legacy_after_migration = false,
                other => warn!(var = ENV_REMOVE_LEGACY, value = %other, "Ignoring malformed env override"),
            }
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var, value = %raw, "Ignoring malformed env override");
            None
        }
    }
}

/// Base directory for per-user application data.
pub fn platform_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        })
}

/// Path provider rooted at the platform data directory.
///
/// Earlier releases nested the app directory twice
/// (`<base>/com.thesmall.pos/com.thesmall.pos/pos.db`); current releases use
/// a single level.
#[derive(Debug, Clone)]
pub struct PlatformPathProvider {
    base: PathBuf,
}

impl PlatformPathProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn from_env() -> Self {
        Self::new(platform_data_dir())
    }

    pub fn app_data_dir(&self) -> PathBuf {
        self.base.join(APP_DIR_NAME)
    }
}

impl PathProvider for PlatformPathProvider {
    fn legacy_path(&self) -> Option<PathBuf> {
        Some(self.app_data_dir().join(APP_DIR_NAME).join(DB_FILE_NAME))
    }

    fn canonical_path(&self) -> PathBuf {
        self.app_data_dir().join(DB_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [ENV_LOCK_STALE_SECS, ENV_MAX_BACKUPS, ENV_REMOVE_LEGACY] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = HealthConfig::default();
        assert_eq!(config.lock_staleness, Duration::from_secs(300));
        assert_eq!(config.legacy_recency_window, Duration::from_secs(3600));
        assert_eq!(config.backup_dir_name, "backups");
        assert!(!config.remove_legacy_after_migration);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var(ENV_LOCK_STALE_SECS, "30");
        std::env::set_var(ENV_MAX_BACKUPS, "3");
        std::env::set_var(ENV_REMOVE_LEGACY, "yes");

        let config = HealthConfig::from_env();
        assert_eq!(config.lock_staleness, Duration::from_secs(30));
        assert_eq!(config.max_backups, 3);
        assert!(config.remove_legacy_after_migration);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_malformed_values() {
        clear_env();
        std::env::set_var(ENV_MAX_BACKUPS, "lots");
        std::env::set_var(ENV_REMOVE_LEGACY, "maybe");

        let config = HealthConfig::from_env();
        assert_eq!(config.max_backups, 10);
        assert!(!config.remove_legacy_after_migration);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_platform_paths_use_data_dir_override() {
        std::env::set_var(ENV_DATA_DIR, "/tmp/pos-data-test");
        let provider = PlatformPathProvider::from_env();
        std::env::remove_var(ENV_DATA_DIR);

        assert_eq!(
            provider.canonical_path(),
            PathBuf::from("/tmp/pos-data-test/com.thesmall.pos/pos.db")
        );
        assert_eq!(
            provider.legacy_path(),
            Some(PathBuf::from(
                "/tmp/pos-data-test/com.thesmall.pos/com.thesmall.pos/pos.db"
            ))
        );
    }
}
