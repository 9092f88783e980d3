//! Error taxonomy for the startup database health pipeline.
//!
//! Each stage owns its own error type so callers can tell a file-level
//! problem apart from a schema-level or repair-level one. The orchestrator
//! folds them into [`DbHealthError`], which is the only failure type the rest
//! of the application ever observes.

use std::path::PathBuf;
use thiserror::Error;

use crate::recovery::RecoveryReason;
use crate::repair::RepairStep;

/// File-level validation failure (see `file_validator`).
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
    pub can_recover: bool,
    pub is_corrupted: bool,
}

/// Schema-level incompatibility detected on an open connection.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct CompatibilityError {
    pub reason: String,
    pub requires_fresh_database: bool,
}

/// Failure of a single rung of the repair ladder.
///
/// Only a failed [`RepairStep::Backup`] aborts the ladder; every other step
/// failure is logged and the next step is attempted.
#[derive(Debug, Clone, Error)]
#[error("repair step {step:?} failed: {message}")]
pub struct RepairStepError {
    pub step: RepairStep,
    pub message: String,
}

impl RepairStepError {
    pub fn new(step: RepairStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.step == RepairStep::Backup
    }
}

/// Migration failures are always fatal to the pending batch.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration registry is invalid: {}", .0.join("; "))]
    InvalidRegistry(Vec<String>),

    #[error("migration v{version} ({name}) failed: {source}")]
    Apply {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration v{version} ({name}) applied-check failed: {source}")]
    Check {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration history: {0}")]
    History(#[source] rusqlite::Error),
}

impl MigrationError {
    /// Version of the migration that failed, when the failure is tied to one.
    pub fn version(&self) -> Option<u32> {
        match self {
            MigrationError::Apply { version, .. } | MigrationError::Check { version, .. } => {
                Some(*version)
            }
            _ => None,
        }
    }
}

/// Backup creation, verification or restore failure.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("source database {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("backup {path} could not be verified: {reason}")]
    Unverified { path: PathBuf, reason: String },

    #[error("backup io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Path relocation failure. The legacy file is never touched when this is
/// returned.
#[derive(Debug, Error)]
pub enum PathMigrationError {
    #[error("legacy database backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("copy {from} -> {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("relocated database failed validation: {0}")]
    Validation(ValidationError),
}

/// Terminal failure of the startup pipeline, handed back to the host.
#[derive(Debug, Error)]
pub enum DbHealthError {
    #[error("database file invalid: {0}")]
    Validation(#[from] ValidationError),

    #[error("database incompatible: {0}")]
    Compatibility(#[from] CompatibilityError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("database {0} is in use by another process")]
    Locked(PathBuf),

    /// The user declined every offered recovery. `reason` and `detail` are
    /// the cause that prompted the decision.
    #[error("startup cancelled by user: {message}{}", .detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Cancelled {
        reason: RecoveryReason,
        message: String,
        detail: Option<String>,
    },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("recovery did not settle after {0} transitions")]
    TooManyTransitions(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_backup_step_is_fatal() {
        assert!(RepairStepError::new(RepairStep::Backup, "disk full").is_fatal());
        assert!(!RepairStepError::new(RepairStep::Reindex, "busy").is_fatal());
        assert!(!RepairStepError::new(RepairStep::Vacuum, "busy").is_fatal());
    }

    #[test]
    fn test_invalid_registry_message_lists_problems() {
        let err = MigrationError::InvalidRegistry(vec!["gap at v3".into(), "dup v2".into()]);
        assert_eq!(
            err.to_string(),
            "migration registry is invalid: gap at v3; dup v2"
        );
        assert_eq!(err.version(), None);
    }

    #[test]
    fn test_cancelled_display_includes_cause() {
        let err = DbHealthError::Cancelled {
            reason: RecoveryReason::Incompatible,
            message: "Database is not compatible".into(),
            detail: Some("schema too old".into()),
        };
        assert_eq!(
            err.to_string(),
            "startup cancelled by user: Database is not compatible (schema too old)"
        );
        let err = DbHealthError::Cancelled {
            reason: RecoveryReason::UnrecoverableFile,
            message: "File is empty".into(),
            detail: None,
        };
        assert_eq!(err.to_string(), "startup cancelled by user: File is empty");
    }
}
