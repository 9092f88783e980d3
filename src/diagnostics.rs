//! Diagnostics for support sessions.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Database health**: schema version, migration history, file and page
//!   statistics, backup count

use rusqlite::Connection;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use crate::backup;
use crate::config::HealthConfig;
use crate::migrations;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "buildProfile": env!("BUILD_PROFILE"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Database health
// ---------------------------------------------------------------------------

/// Snapshot of the open database for the health screen and the CLI report.
///
/// Individual pragmas that fail are reported as `null` rather than failing the
/// whole report.
pub fn health_report(conn: &Connection, db_path: &Path, config: &HealthConfig) -> Value {
    let schema_version = migrations::current_version(conn).ok();
    let applied = migrations::applied_versions(conn)
        .map(|records| {
            records
                .into_iter()
                .map(|r| json!({ "version": r.version, "name": r.name, "appliedAt": r.applied_at_epoch_ms }))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let db_size = fs::metadata(db_path).map(|m| m.len()).ok();
    let wal_size = fs::metadata(crate::db::wal_path(db_path))
        .map(|m| m.len())
        .unwrap_or(0);

    let backups = backup::list_backups(&backup::backup_dir(db_path, config));
    let latest_backup = backups
        .first()
        .map(|(path, _)| path.display().to_string());

    json!({
        "dbPath": db_path.display().to_string(),
        "schemaVersion": schema_version,
        "migrationCount": applied.len(),
        "migrations": applied,
        "dbSizeBytes": db_size,
        "walSizeBytes": wal_size,
        "journalMode": pragma_text(conn, "journal_mode"),
        "pageCount": pragma_int(conn, "page_count"),
        "pageSize": pragma_int(conn, "page_size"),
        "freelistCount": pragma_int(conn, "freelist_count"),
        "backupCount": backups.len(),
        "latestBackup": latest_backup,
    })
}

fn pragma_int(conn: &Connection, name: &str) -> Option<i64> {
    conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))
        .ok()
}

fn pragma_text(conn: &Connection, name: &str) -> Option<String> {
    conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_file_db, temp_dir};
    use crate::migrations::MigrationRegistry;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = about_info();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    fn test_health_report_on_migrated_database() {
        let dir = temp_dir("diag_health");
        let path = dir.join("pos.db");
        create_file_db(&path);
        let config = HealthConfig::default();
        backup::create_verified_backup(&path, "migration", &config).unwrap();

        let mut conn = crate::db::open_and_configure(&path).unwrap();
        let registry = MigrationRegistry::builtin();
        registry.apply_pending(&mut conn, 0).unwrap();

        let report = health_report(&conn, &path, &config);
        assert_eq!(report["schemaVersion"], registry.latest_version());
        assert_eq!(report["migrationCount"], registry.migrations().len());
        assert_eq!(report["journalMode"], "wal");
        assert_eq!(report["backupCount"], 1);
        assert!(report["pageCount"].as_i64().unwrap() > 0);
        assert!(report["dbSizeBytes"].as_u64().unwrap() > 0);
        drop(conn);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_health_report_without_history() {
        let conn = Connection::open_in_memory().unwrap();
        let report = health_report(&conn, Path::new("/nonexistent/pos.db"), &HealthConfig::default());
        assert_eq!(report["schemaVersion"], 0);
        assert_eq!(report["migrationCount"], 0);
        assert!(report["dbSizeBytes"].is_null());
        assert_eq!(report["backupCount"], 0);
    }
}
