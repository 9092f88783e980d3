//! Backup creation, verification, restore and retention.
//!
//! Backups live in a `backups/` directory next to the database file and are
//! named `<app>-<operation>-backup-<YYYYMMDD-HHMMSS>.db`. A backup is only
//! reported once the copy is confirmed on disk with the source's size.

use chrono::Local;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::db::{remove_sidecars, wal_path};
use crate::error::BackupError;
use crate::file_validator;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const INVALID_MARKER: &str = ".invalid.";

/// Operation name of the snapshot taken right before a restore.
pub const PRE_RESTORE_OPERATION: &str = "pre-restore";

/// Sibling backups directory of `db_path`.
pub fn backup_dir(db_path: &Path, config: &HealthConfig) -> PathBuf {
    db_path
        .parent()
        .map(|p| p.join(&config.backup_dir_name))
        .unwrap_or_else(|| PathBuf::from(&config.backup_dir_name))
}

pub fn backup_file_name(app: &str, operation: &str, timestamp: &str) -> String {
    format!("{app}-{operation}-backup-{timestamp}.db")
}

fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// First free path for `name` in `dir`, appending `-N` before the extension
/// on same-second collisions.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
        None => (name.to_string(), String::new()),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}-{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Copy `source` (and its `-wal` sidecar when present) into the backups
/// directory and verify the copy before returning its path.
///
/// The caller is expected to checkpoint the WAL first when it holds a
/// connection; the sidecar copy covers the case where that was impossible.
pub fn create_verified_backup(
    source: &Path,
    operation: &str,
    config: &HealthConfig,
) -> Result<PathBuf, BackupError> {
    create_verified_backup_in(source, &backup_dir(source, config), operation, config)
}

/// Same as [`create_verified_backup`] but into an explicit directory.
pub fn create_verified_backup_in(
    source: &Path,
    dir: &Path,
    operation: &str,
    config: &HealthConfig,
) -> Result<PathBuf, BackupError> {
    let name = backup_file_name(&config.app_name, operation, &timestamp_now());
    copy_verified(source, dir, &name)
}

/// Back up a file that failed validation as `<stem>.invalid.<timestamp>.db`.
pub fn backup_invalid_file(source: &Path, config: &HealthConfig) -> Result<PathBuf, BackupError> {
    let dir = backup_dir(source, config);
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("database");
    let name = format!("{stem}{INVALID_MARKER}{}.db", timestamp_now());
    copy_verified(source, &dir, &name)
}

fn copy_verified(source: &Path, dir: &Path, name: &str) -> Result<PathBuf, BackupError> {
    let source_len = match fs::metadata(source) {
        Ok(m) => m.len(),
        Err(_) => return Err(BackupError::SourceMissing(source.to_path_buf())),
    };

    fs::create_dir_all(dir).map_err(|e| BackupError::io(dir, e))?;
    let dest = unique_path(dir, name);

    fs::copy(source, &dest).map_err(|e| BackupError::io(&dest, e))?;
    File::open(&dest)
        .and_then(|f| f.sync_all())
        .map_err(|e| BackupError::io(&dest, e))?;

    let source_wal = wal_path(source);
    if source_wal.exists() {
        let dest_wal = wal_path(&dest);
        if let Err(e) = fs::copy(&source_wal, &dest_wal) {
            warn!(path = %dest_wal.display(), error = %e, "Failed to copy WAL sidecar into backup");
        }
    }

    verify_backup(&dest, source_len)?;
    info!(source = %source.display(), backup = %dest.display(), bytes = source_len, "Backup created");
    Ok(dest)
}

/// Confirm the backup exists, is non-empty and matches the source size.
pub fn verify_backup(path: &Path, expected_len: u64) -> Result<(), BackupError> {
    let metadata = fs::metadata(path).map_err(|e| BackupError::Unverified {
        path: path.to_path_buf(),
        reason: format!("not found after copy: {e}"),
    })?;
    if metadata.len() == 0 {
        return Err(BackupError::Unverified {
            path: path.to_path_buf(),
            reason: "backup is empty".to_string(),
        });
    }
    if metadata.len() != expected_len {
        return Err(BackupError::Unverified {
            path: path.to_path_buf(),
            reason: format!(
                "size mismatch (expected {expected_len} bytes, found {})",
                metadata.len()
            ),
        });
    }
    Ok(())
}

/// Database backups in `dir`, newest first. Sidecars and invalid-file copies
/// are excluded.
pub fn list_backups(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
    let mut backups: Vec<(PathBuf, SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".db") || name.contains(INVALID_MARKER) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            backups.push((path, modified));
        }
    }
    // Newest first; name breaks ties within the same mtime granularity.
    backups.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    backups
}

/// Newest backup of `db_path` that passes file validation.
///
/// Pre-restore snapshots are skipped: they hold the state a restore just
/// abandoned.
pub fn latest_restorable_backup(db_path: &Path, config: &HealthConfig) -> Option<PathBuf> {
    let pre_restore_marker = format!("-{PRE_RESTORE_OPERATION}-backup-");
    list_backups(&backup_dir(db_path, config))
        .into_iter()
        .map(|(path, _)| path)
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| !name.contains(&pre_restore_marker))
                .unwrap_or(false)
        })
        .find(|path| {
            let result = file_validator::validate(path);
            result.valid && result.is_empty == Some(false)
        })
}

/// Replace `db_path` with `backup`.
///
/// The current file, when present and non-empty, is first saved as a
/// `pre-restore` backup. Returns that backup's path.
pub fn restore_from_backup(
    backup: &Path,
    db_path: &Path,
    config: &HealthConfig,
) -> Result<Option<PathBuf>, BackupError> {
    let backup_len = fs::metadata(backup)
        .map_err(|_| BackupError::SourceMissing(backup.to_path_buf()))?
        .len();

    let pre_restore = if fs::metadata(db_path).map(|m| m.len() > 0).unwrap_or(false) {
        Some(create_verified_backup(db_path, PRE_RESTORE_OPERATION, config)?)
    } else {
        None
    };

    let parent = db_path.parent().unwrap_or_else(|| Path::new("."));
    let staging = parent.join(format!(".restore-{}.tmp", uuid::Uuid::new_v4()));
    fs::copy(backup, &staging).map_err(|e| BackupError::io(&staging, e))?;
    if let Err(e) = verify_backup(&staging, backup_len) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    remove_sidecars(db_path);
    fs::rename(&staging, db_path).map_err(|e| {
        let _ = fs::remove_file(&staging);
        BackupError::io(db_path, e)
    })?;

    let backup_wal = wal_path(backup);
    if backup_wal.exists() {
        fs::copy(&backup_wal, wal_path(db_path)).map_err(|e| BackupError::io(&backup_wal, e))?;
    }

    info!(backup = %backup.display(), db = %db_path.display(), "Database restored from backup");
    Ok(pre_restore)
}

/// Keep only the newest `keep` backups in `dir`. `keep == 0` disables pruning.
pub fn prune_backups(dir: &Path, keep: usize) -> usize {
    if keep == 0 {
        return 0;
    }
    let mut removed = 0;
    for (path, _) in list_backups(dir).iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => {
                let _ = fs::remove_file(wal_path(path));
                removed += 1;
                debug!(path = %path.display(), "Pruned old backup");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune backup"),
        }
    }
    removed
}
