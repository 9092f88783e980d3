//! Read-only classification of an open database against the schema this
//! build expects.

use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::db::{self, MIGRATIONS_TABLE};
use crate::error::CompatibilityError;
use crate::migrations::MigrationRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityResult {
    pub compatible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_migrate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_schema_version: Option<String>,
    pub app_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_path_exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_fresh_database: Option<bool>,
    /// No tables and no migration history: the baseline schema is still missing.
    pub fresh_database: bool,
}

impl CompatibilityResult {
    /// Recorded schema version as a number (0 when none recorded).
    pub fn schema_version(&self) -> u32 {
        self.database_schema_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn to_error(&self) -> Option<CompatibilityError> {
        if self.compatible {
            return None;
        }
        Some(CompatibilityError {
            reason: self
                .reason
                .clone()
                .unwrap_or_else(|| "database schema is incompatible".to_string()),
            requires_fresh_database: self.requires_fresh_database.unwrap_or(false),
        })
    }
}

pub struct CompatibilityChecker {
    latest_version: u32,
    app_version: String,
}

impl CompatibilityChecker {
    pub fn new(registry: &MigrationRegistry) -> Self {
        Self {
            latest_version: registry.latest_version(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Classify the database behind `conn`. Never writes.
    pub fn check(&self, conn: &Connection, path: &Path) -> CompatibilityResult {
        let age = file_age(path);
        let mut result = CompatibilityResult {
            app_version: self.app_version.clone(),
            database_age_ms: age.map(|a| a.as_millis().min(u64::MAX as u128) as u64),
            ..Default::default()
        };

        let has_history = match db::table_exists(conn, MIGRATIONS_TABLE) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read schema catalog");
                result.reason = Some(format!("Database schema could not be read: {e}"));
                result.can_migrate = Some(false);
                return result;
            }
        };

        if !has_history {
            return match db::user_table_count(conn) {
                Ok(0) => {
                    debug!("No tables and no migration history: fresh database");
                    result.compatible = true;
                    result.fresh_database = true;
                    result.can_migrate = Some(true);
                    result.migration_path_exists = Some(true);
                    result.database_schema_version = Some("0".to_string());
                    result
                }
                Ok(tables) => {
                    let age_text = age
                        .map(format_age)
                        .unwrap_or_else(|| "an unknown time".to_string());
                    result.reason = Some(format!(
                        "Database predates migration tracking ({tables} tables, created {age_text} ago) and must be recreated"
                    ));
                    result.can_migrate = Some(false);
                    result.migration_path_exists = Some(false);
                    result.requires_fresh_database = Some(true);
                    result
                }
                Err(e) => {
                    result.reason = Some(format!("Database schema could not be read: {e}"));
                    result.can_migrate = Some(false);
                    result
                }
            };
        }

        let recorded: rusqlite::Result<i64> = conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        );
        match recorded {
            Ok(0) => {
                result.compatible = true;
                result.can_migrate = Some(true);
                result.migration_path_exists = Some(true);
                result.database_schema_version = Some("0".to_string());
                return result;
            }
            Ok(_) => {}
            Err(e) => return self.self_test_failed(result, e),
        }

        // Self-test: the history table must expose the columns the runner writes.
        let latest: rusqlite::Result<(i64, String, i64)> = conn.query_row(
            "SELECT version, name, applied_at FROM schema_migrations ORDER BY version DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        );
        let version = match latest {
            Ok((version, _, _)) => version,
            Err(e) => return self.self_test_failed(result, e),
        };

        result.database_schema_version = Some(version.to_string());
        if version > i64::from(self.latest_version) {
            result.reason = Some(format!(
                "Database schema v{version} is newer than this release supports (v{})",
                self.latest_version
            ));
            result.can_migrate = Some(false);
            result.migration_path_exists = Some(false);
            return result;
        }

        result.compatible = true;
        result.can_migrate = Some(true);
        result.migration_path_exists = Some(true);
        result
    }

    fn self_test_failed(
        &self,
        mut result: CompatibilityResult,
        e: rusqlite::Error,
    ) -> CompatibilityResult {
        warn!(error = %e, "Migration history self-test failed");
        result.reason = Some(format!("Migration history is unreadable: {e}"));
        result.can_migrate = Some(false);
        result.requires_fresh_database = Some(true);
        result
    }
}

/// Age of the file, measured from the older of its creation and
/// modification times.
fn file_age(path: &Path) -> Option<Duration> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok();
    let created = metadata.created().ok();
    let origin = match (created, modified) {
        (Some(c), Some(m)) => c.min(m),
        (Some(t), None) | (None, Some(t)) => t,
        (None, None) => return None,
    };
    SystemTime::now().duration_since(origin).ok()
}

/// Largest whole unit: years > months > days > hours > minutes > seconds.
pub fn format_age(age: Duration) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const MONTH: u64 = 30 * DAY;
    const YEAR: u64 = 365 * DAY;

    let secs = age.as_secs();
    let (count, unit) = if secs >= YEAR {
        (secs / YEAR, "year")
    } else if secs >= MONTH {
        (secs / MONTH, "month")
    } else if secs >= DAY {
        (secs / DAY, "day")
    } else if secs >= HOUR {
        (secs / HOUR, "hour")
    } else if secs >= MINUTE {
        (secs / MINUTE, "minute")
    } else {
        (secs, "second")
    };
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}
