//! Relocation of the database from the deprecated double-nested data
//! directory to the canonical one.
//!
//! The legacy file is backed up before anything else happens and is only
//! deleted on explicit request after the relocated copy has passed
//! validation on its own.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::backup;
use crate::config::HealthConfig;
use crate::db::{remove_sidecars, wal_path};
use crate::error::PathMigrationError;
use crate::file_validator;

/// Where the database lives now and where earlier releases kept it.
pub trait PathProvider {
    fn legacy_path(&self) -> Option<PathBuf>;
    fn canonical_path(&self) -> PathBuf;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMigrationResult {
    pub migrated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct PathMigrator<'a> {
    paths: &'a dyn PathProvider,
    config: &'a HealthConfig,
}

impl<'a> PathMigrator<'a> {
    pub fn new(paths: &'a dyn PathProvider, config: &'a HealthConfig) -> Self {
        Self { paths, config }
    }

    /// True when a legacy database exists and the canonical location is
    /// missing, unusable, or older than a recently used legacy file.
    pub fn should_migrate(&self) -> bool {
        let Some(legacy) = self.existing_legacy_path() else {
            return false;
        };
        let canonical = self.paths.canonical_path();

        if !canonical.exists() {
            return true;
        }
        let canonical_check = file_validator::validate(&canonical);
        if !canonical_check.valid || canonical_check.is_empty != Some(false) {
            return true;
        }

        let (Some(legacy_mtime), Some(canonical_mtime)) = (mtime(&legacy), mtime(&canonical))
        else {
            return false;
        };
        let recently_used = SystemTime::now()
            .duration_since(legacy_mtime)
            .map(|age| age <= self.config.legacy_recency_window)
            .unwrap_or(true);
        legacy_mtime > canonical_mtime && recently_used
    }

    /// Copy the legacy database to the canonical path.
    ///
    /// Failures are reported in the result; the legacy file is left intact
    /// on every failure path.
    pub fn migrate(&self, remove_old: bool) -> PathMigrationResult {
        let Some(legacy) = self.existing_legacy_path() else {
            return PathMigrationResult {
                reason: Some("No legacy database found".to_string()),
                ..Default::default()
            };
        };
        let canonical = self.paths.canonical_path();
        let mut result = PathMigrationResult {
            old_path: Some(legacy.display().to_string()),
            new_path: Some(canonical.display().to_string()),
            ..Default::default()
        };

        match self.relocate(&legacy, &canonical, &mut result) {
            Ok(true) => {
                result.migrated = true;
                info!(from = %legacy.display(), to = %canonical.display(), "Database relocated to canonical path");
                if remove_old {
                    remove_legacy(&legacy);
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(from = %legacy.display(), error = %e, "Database relocation failed, legacy file left in place");
                result.reason = Some(e.to_string());
            }
        }
        result
    }

    fn existing_legacy_path(&self) -> Option<PathBuf> {
        self.paths
            .legacy_path()
            .filter(|p| p.is_file() && *p != self.paths.canonical_path())
    }

    /// Ok(false) means the migration was refused without error.
    fn relocate(
        &self,
        legacy: &Path,
        canonical: &Path,
        result: &mut PathMigrationResult,
    ) -> Result<bool, PathMigrationError> {
        let backup_path = backup::create_verified_backup_in(
            legacy,
            &backup::backup_dir(canonical, self.config),
            "path-migration",
            self.config,
        )?;
        result.backup_path = Some(backup_path.display().to_string());

        if canonical.exists() {
            let existing = file_validator::validate(canonical);
            if existing.valid && existing.is_empty == Some(false) {
                info!(path = %canonical.display(), "Canonical database already valid, not overwriting");
                result.reason =
                    Some("A valid database already exists at the canonical path".to_string());
                return Ok(false);
            }
            // A 0-byte file holds nothing worth keeping.
            if existing.file_size_bytes.unwrap_or(0) > 0 {
                let invalid_backup = backup::backup_invalid_file(canonical, self.config)?;
                info!(backup = %invalid_backup.display(), "Saved invalid canonical database before replacing it");
            } else {
                debug!(path = %canonical.display(), "Replacing empty canonical file");
            }
            fs::remove_file(canonical).map_err(|e| PathMigrationError::Copy {
                from: legacy.to_path_buf(),
                to: canonical.to_path_buf(),
                source: e,
            })?;
            remove_sidecars(canonical);
        }

        if let Some(parent) = canonical.parent() {
            fs::create_dir_all(parent).map_err(|e| PathMigrationError::Copy {
                from: legacy.to_path_buf(),
                to: canonical.to_path_buf(),
                source: e,
            })?;
        }

        if let Err(e) = copy_with_wal(legacy, canonical) {
            rollback(canonical);
            return Err(e);
        }

        let check = file_validator::validate(canonical);
        if !check.valid || check.is_empty != Some(false) {
            rollback(canonical);
            let err = check.to_error().unwrap_or_else(|| crate::error::ValidationError {
                reason: "relocated database is empty".to_string(),
                can_recover: false,
                is_corrupted: false,
            });
            return Err(PathMigrationError::Validation(err));
        }
        Ok(true)
    }
}

fn copy_with_wal(from: &Path, to: &Path) -> Result<(), PathMigrationError> {
    let copy_err = |source| PathMigrationError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    fs::copy(from, to).map_err(copy_err)?;
    let legacy_wal = wal_path(from);
    if legacy_wal.exists() {
        fs::copy(&legacy_wal, wal_path(to)).map_err(copy_err)?;
    }
    Ok(())
}

fn rollback(canonical: &Path) {
    if let Err(e) = fs::remove_file(canonical) {
        warn!(path = %canonical.display(), error = %e, "Rollback of relocated database failed");
    }
    remove_sidecars(canonical);
}

/// Delete the legacy file and, best-effort, its now-empty directory.
fn remove_legacy(legacy: &Path) {
    if let Err(e) = fs::remove_file(legacy) {
        warn!(path = %legacy.display(), error = %e, "Failed to remove legacy database");
        return;
    }
    remove_sidecars(legacy);
    if let Some(dir) = legacy.parent() {
        // Fails when the directory still holds other files, which is fine.
        if fs::remove_dir(dir).is_ok() {
            info!(dir = %dir.display(), "Removed empty legacy directory");
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
