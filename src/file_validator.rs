//! Raw-file checks run before any SQLite connection is opened.

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::db::{shm_path, wal_path};
use crate::error::ValidationError;

/// Header every SQLite 3 database file starts with.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Smallest legal SQLite page size; anything shorter cannot hold a header page.
pub const MIN_DB_FILE_SIZE: u64 = 512;

/// Leading bytes that mark a header as "ours but altered" rather than foreign.
const MAGIC_PARTIAL_PREFIX: usize = 6;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_recover: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_corrupted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_empty: Option<bool>,
}

impl ValidationResult {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            can_recover: Some(false),
            ..Default::default()
        }
    }

    /// True when no database exists yet and a fresh one will be created.
    pub fn is_fresh(&self) -> bool {
        self.valid && self.is_empty == Some(true)
    }

    pub fn is_recoverable(&self) -> bool {
        self.can_recover.unwrap_or(false)
    }

    /// Typed error view of an invalid result.
    pub fn to_error(&self) -> Option<ValidationError> {
        if self.valid {
            return None;
        }
        Some(ValidationError {
            reason: self
                .reason
                .clone()
                .unwrap_or_else(|| "database file is invalid".to_string()),
            can_recover: self.is_recoverable(),
            is_corrupted: self.is_corrupted.unwrap_or(false),
        })
    }
}

/// Validate the database file at `path` without opening a connection.
///
/// Only a read-only handle is opened, scoped to this call.
pub fn validate(path: &Path) -> ValidationResult {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No database file yet, a fresh one will be created");
            return ValidationResult {
                valid: true,
                can_recover: Some(true),
                file_size_bytes: Some(0),
                is_empty: Some(true),
                ..Default::default()
            };
        }
        Err(e) => {
            return ValidationResult::invalid(format!("Cannot stat database file: {e}"));
        }
    };

    if !metadata.is_file() {
        return ValidationResult::invalid("Database path is not a regular file");
    }

    let size = metadata.len();
    if size < MIN_DB_FILE_SIZE {
        let reason = if size == 0 {
            "Database file is empty (0 bytes)".to_string()
        } else {
            format!("Database file is too small ({size} bytes, minimum {MIN_DB_FILE_SIZE})")
        };
        return ValidationResult {
            file_size_bytes: Some(size),
            is_corrupted: Some(true),
            ..ValidationResult::invalid(reason)
        };
    }

    let header = match read_header(path) {
        Ok(h) => h,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return ValidationResult {
                file_size_bytes: Some(size),
                ..ValidationResult::invalid("Database file is not readable (permission denied)")
            };
        }
        Err(e) => {
            return ValidationResult {
                file_size_bytes: Some(size),
                ..ValidationResult::invalid(format!("Cannot read database header: {e}"))
            };
        }
    };

    if &header != SQLITE_MAGIC {
        if header[..MAGIC_PARTIAL_PREFIX] == SQLITE_MAGIC[..MAGIC_PARTIAL_PREFIX] {
            warn!(path = %path.display(), "Database header present but altered");
            return ValidationResult {
                valid: false,
                reason: Some("Database header is damaged".to_string()),
                can_recover: Some(true),
                file_size_bytes: Some(size),
                is_corrupted: Some(true),
                is_empty: None,
            };
        }
        return ValidationResult {
            file_size_bytes: Some(size),
            ..ValidationResult::invalid("File is not a SQLite database (header mismatch)")
        };
    }

    if let Err(e) = OpenOptions::new().write(true).open(path) {
        return ValidationResult {
            file_size_bytes: Some(size),
            ..ValidationResult::invalid(format!("Database file is not writable: {e}"))
        };
    }

    ValidationResult {
        valid: true,
        file_size_bytes: Some(size),
        is_empty: Some(false),
        ..Default::default()
    }
}

fn read_header(path: &Path) -> std::io::Result<[u8; 16]> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 16];
    file.read_exact(&mut header)?;
    Ok(header)
}

/// Whether another process appears to hold the database open.
///
/// A `-wal`/`-shm` sidecar younger than `staleness` is a lock signal, which
/// is confirmed only if the primary file cannot be opened read-write. Older
/// sidecars are crash leftovers.
pub fn is_locked(path: &Path, staleness: Duration) -> bool {
    let now = SystemTime::now();
    let fresh_sidecar = [wal_path(path), shm_path(path)].into_iter().find(|sidecar| {
        fs::metadata(sidecar)
            .and_then(|m| m.modified())
            .map(|modified| {
                now.duration_since(modified)
                    .map(|age| age < staleness)
                    .unwrap_or(true)
            })
            .unwrap_or(false)
    });

    let Some(sidecar) = fresh_sidecar else {
        return false;
    };

    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(_) => {
            debug!(sidecar = %sidecar.display(), "Recent sidecar found but database opens read-write; treating as stale");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), sidecar = %sidecar.display(), error = %e, "Database appears locked");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_file_db, temp_dir};

    #[test]
    fn test_missing_file_is_valid_and_empty() {
        let dir = temp_dir("validator_missing");
        let result = validate(&dir.join("nope.db"));
        assert!(result.valid);
        assert_eq!(result.is_empty, Some(true));
        assert_eq!(result.can_recover, Some(true));
        assert!(result.is_fresh());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_small_files_are_corrupted_and_unrecoverable() {
        let dir = temp_dir("validator_small");
        for size in [0usize, 1, 100, 511] {
            let path = dir.join(format!("small_{size}.db"));
            fs::write(&path, vec![b'S'; size]).unwrap();
            let result = validate(&path);
            assert!(!result.valid, "size {size}");
            assert_eq!(result.is_corrupted, Some(true), "size {size}");
            assert_eq!(result.can_recover, Some(false), "size {size}");
            assert_eq!(result.file_size_bytes, Some(size as u64));
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_foreign_file_is_unrecoverable_without_corruption_claim() {
        let dir = temp_dir("validator_foreign");
        let path = dir.join("photo.db");
        fs::write(&path, vec![0xFFu8; 4096]).unwrap();
        let result = validate(&path);
        assert!(!result.valid);
        assert_eq!(result.can_recover, Some(false));
        assert_eq!(result.is_corrupted, None);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_damaged_header_is_recoverable() {
        let dir = temp_dir("validator_damaged");
        let path = dir.join("pos.db");
        let mut bytes = b"SQLite formXt 3\0".to_vec();
        bytes.resize(4096, 0);
        fs::write(&path, bytes).unwrap();
        let result = validate(&path);
        assert!(!result.valid);
        assert_eq!(result.is_corrupted, Some(true));
        assert_eq!(result.can_recover, Some(true));
        let err = result.to_error().unwrap();
        assert!(err.can_recover);
        assert!(err.is_corrupted);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_real_database_is_valid() {
        let dir = temp_dir("validator_real");
        let path = dir.join("pos.db");
        create_file_db(&path);
        let result = validate(&path);
        assert!(result.valid, "{result:?}");
        assert_eq!(result.is_empty, Some(false));
        assert!(result.file_size_bytes.unwrap() >= MIN_DB_FILE_SIZE);
        assert!(result.to_error().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_directory_is_not_a_database() {
        let dir = temp_dir("validator_dir");
        let result = validate(&dir);
        assert!(!result.valid);
        assert_eq!(result.can_recover, Some(false));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_not_locked_without_sidecars() {
        let dir = temp_dir("lock_none");
        let path = dir.join("pos.db");
        create_file_db(&path);
        crate::db::remove_sidecars(&path);
        assert!(!is_locked(&path, Duration::from_secs(300)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fresh_sidecar_with_openable_file_is_stale() {
        let dir = temp_dir("lock_openable");
        let path = dir.join("pos.db");
        create_file_db(&path);
        fs::write(wal_path(&path), b"").unwrap();
        assert!(!is_locked(&path, Duration::from_secs(300)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fresh_sidecar_with_unopenable_primary_is_locked() {
        let dir = temp_dir("lock_live");
        // A directory cannot be opened read-write, standing in for a held file.
        let path = dir.join("pos.db");
        fs::create_dir_all(&path).unwrap();
        fs::write(wal_path(&path), b"").unwrap();
        assert!(is_locked(&path, Duration::from_secs(300)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_old_sidecar_is_ignored() {
        let dir = temp_dir("lock_old");
        let path = dir.join("pos.db");
        fs::create_dir_all(&path).unwrap();
        let wal = wal_path(&path);
        fs::write(&wal, b"").unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        File::options()
            .write(true)
            .open(&wal)
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(!is_locked(&path, Duration::from_secs(300)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    /// Root ignores file modes, so permission tests only mean something
    /// when the restricted open actually fails.
    #[cfg(unix)]
    fn permissions_enforced(path: &Path, write: bool) -> bool {
        OpenOptions::new().read(!write).write(write).open(path).is_err()
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_unrecoverable_without_corruption_claim() {
        let dir = temp_dir("validator_unreadable");
        let path = dir.join("pos.db");
        create_file_db(&path);
        crate::db::remove_sidecars(&path);
        set_mode(&path, 0o000);

        if permissions_enforced(&path, false) {
            let result = validate(&path);
            assert!(!result.valid);
            assert_eq!(result.can_recover, Some(false));
            assert_eq!(result.is_corrupted, None);
            assert!(result.reason.unwrap().contains("permission denied"));
        }
        set_mode(&path, 0o644);
        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_file_is_invalid_but_not_corrupted() {
        let dir = temp_dir("validator_readonly");
        let path = dir.join("pos.db");
        create_file_db(&path);
        crate::db::remove_sidecars(&path);
        set_mode(&path, 0o444);

        if permissions_enforced(&path, true) {
            let result = validate(&path);
            assert!(!result.valid);
            assert_eq!(result.is_corrupted, None);
            assert_eq!(result.is_empty, None);
            assert!(result.reason.unwrap().contains("not writable"));
        }
        set_mode(&path, 0o644);
        let _ = fs::remove_dir_all(&dir);
    }
}
