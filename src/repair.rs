//! Escalating repair ladder for a damaged database.
//!
//! Order is fixed: backup, WAL checkpoint, integrity check, REINDEX,
//! VACUUM, final integrity check. Nothing past the backup runs unless the
//! backup is verified on disk. Every later step is non-fatal; its failure is
//! logged and the next step is attempted.

use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use crate::backup;
use crate::config::HealthConfig;
use crate::error::RepairStepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    Backup,
    Checkpoint,
    IntegrityCheck,
    Reindex,
    Vacuum,
    FinalIntegrityCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStepStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairStepReport {
    pub step: RepairStep,
    pub status: RepairStepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub success: bool,
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    pub steps: Vec<RepairStepReport>,
}

/// Outcome of `PRAGMA integrity_check` / `quick_check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub ok: bool,
    pub messages: Vec<String>,
}

impl IntegrityReport {
    fn summary(&self) -> String {
        let shown: Vec<&str> = self.messages.iter().take(3).map(String::as_str).collect();
        if self.messages.len() > shown.len() {
            format!("{} (+{} more)", shown.join("; "), self.messages.len() - shown.len())
        } else {
            shown.join("; ")
        }
    }
}

/// Maintenance primitives the ladder is built from.
pub trait MaintenanceOps {
    fn checkpoint(&self) -> rusqlite::Result<()>;
    fn integrity_check(&self) -> rusqlite::Result<IntegrityReport>;
    fn quick_check(&self) -> rusqlite::Result<IntegrityReport>;
    fn reindex(&self) -> rusqlite::Result<()>;
    fn vacuum(&self) -> rusqlite::Result<()>;
}

impl MaintenanceOps for Connection {
    fn checkpoint(&self) -> rusqlite::Result<()> {
        // Returns (busy, log, checkpointed); busy != 0 means it could not complete.
        let busy: i64 = self.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
        if busy != 0 {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("wal checkpoint blocked by a reader".to_string()),
            ));
        }
        Ok(())
    }

    fn integrity_check(&self) -> rusqlite::Result<IntegrityReport> {
        pragma_check(self, "PRAGMA integrity_check")
    }

    fn quick_check(&self) -> rusqlite::Result<IntegrityReport> {
        pragma_check(self, "PRAGMA quick_check")
    }

    fn reindex(&self) -> rusqlite::Result<()> {
        self.execute_batch("REINDEX;")
    }

    fn vacuum(&self) -> rusqlite::Result<()> {
        self.execute_batch("VACUUM;")
    }
}

fn pragma_check(conn: &Connection, sql: &str) -> rusqlite::Result<IntegrityReport> {
    let mut stmt = conn.prepare(sql)?;
    let messages = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let ok = messages.len() == 1 && messages[0].eq_ignore_ascii_case("ok");
    Ok(IntegrityReport { ok, messages })
}

pub struct RepairEngine<'a> {
    config: &'a HealthConfig,
}

impl<'a> RepairEngine<'a> {
    pub fn new(config: &'a HealthConfig) -> Self {
        Self { config }
    }

    /// Run the full ladder against the database at `path`.
    pub fn repair<M: MaintenanceOps + ?Sized>(&self, db: &M, path: &Path) -> RepairResult {
        let mut result = RepairResult::default();

        // 1. Mandatory verified backup.
        if let Err(e) = db.checkpoint() {
            warn!(error = %e, "Pre-backup checkpoint failed, WAL sidecar will be copied with the backup");
        }
        match backup::create_verified_backup(path, "repair", self.config) {
            Ok(p) => {
                result.backup_path = Some(p.display().to_string());
                record(&mut result, RepairStep::Backup, Ok(()));
            }
            Err(e) => {
                let err = RepairStepError::new(RepairStep::Backup, e.to_string());
                result.reason = Some(err.to_string());
                if record(&mut result, RepairStep::Backup, Err(err)) {
                    warn!("Repair aborted: no verified backup");
                    return result;
                }
            }
        }

        // 2. Non-destructive checkpoint.
        let checkpoint = db
            .checkpoint()
            .map_err(|e| RepairStepError::new(RepairStep::Checkpoint, e.to_string()));
        record(&mut result, RepairStep::Checkpoint, checkpoint);

        // 3. Healthy already? Stop before anything invasive.
        match db.integrity_check() {
            Ok(report) if report.ok => {
                record(&mut result, RepairStep::IntegrityCheck, Ok(()));
                info!("Integrity check passed, no repair needed");
                for step in [RepairStep::Reindex, RepairStep::Vacuum, RepairStep::FinalIntegrityCheck] {
                    result.steps.push(RepairStepReport {
                        step,
                        status: RepairStepStatus::Skipped,
                        message: None,
                    });
                }
                result.success = true;
                return result;
            }
            Ok(report) => record(
                &mut result,
                RepairStep::IntegrityCheck,
                Err(RepairStepError::new(RepairStep::IntegrityCheck, report.summary())),
            ),
            Err(e) => record(
                &mut result,
                RepairStep::IntegrityCheck,
                Err(RepairStepError::new(RepairStep::IntegrityCheck, e.to_string())),
            ),
        };

        // 4. Rebuild indexes.
        let reindex = db
            .reindex()
            .map_err(|e| RepairStepError::new(RepairStep::Reindex, e.to_string()));
        record(&mut result, RepairStep::Reindex, reindex);

        // 5. Rebuild the whole file.
        let vacuum = db
            .vacuum()
            .map_err(|e| RepairStepError::new(RepairStep::Vacuum, e.to_string()));
        record(&mut result, RepairStep::Vacuum, vacuum);

        // 6. Verdict.
        let final_check = match db.integrity_check() {
            Ok(report) if report.ok => Ok(()),
            Ok(report) => Err(RepairStepError::new(
                RepairStep::FinalIntegrityCheck,
                report.summary(),
            )),
            Err(e) => Err(RepairStepError::new(
                RepairStep::FinalIntegrityCheck,
                e.to_string(),
            )),
        };
        match final_check {
            Ok(()) => {
                record(&mut result, RepairStep::FinalIntegrityCheck, Ok(()));
                info!(backup = ?result.backup_path, "Database repaired");
                result.success = true;
                result.repaired = true;
            }
            Err(err) => {
                result.reason = Some(err.to_string());
                record(&mut result, RepairStep::FinalIntegrityCheck, Err(err));
                warn!(backup = ?result.backup_path, "Database could not be repaired");
            }
        }
        result
    }

    /// Fast non-destructive check: `quick_check`, and on failure one WAL
    /// checkpoint followed by a second `quick_check`.
    pub fn quick_repair<M: MaintenanceOps + ?Sized>(&self, db: &M) -> bool {
        match db.quick_check() {
            Ok(report) if report.ok => return true,
            Ok(report) => warn!(problems = %report.summary(), "Quick check failed"),
            Err(e) => warn!(error = %e, "Quick check could not run"),
        }
        if let Err(e) = db.checkpoint() {
            warn!(error = %e, "Checkpoint during quick repair failed");
        }
        matches!(db.quick_check(), Ok(report) if report.ok)
    }
}

/// Append the step report. Returns true when the failure ends the ladder.
fn record(result: &mut RepairResult, step: RepairStep, outcome: Result<(), RepairStepError>) -> bool {
    let mut fatal = false;
    let report = match outcome {
        Ok(()) => {
            info!(step = ?step, "Repair step succeeded");
            RepairStepReport {
                step,
                status: RepairStepStatus::Success,
                message: None,
            }
        }
        Err(err) => {
            fatal = err.is_fatal();
            warn!(step = ?step, error = %err.message, fatal, "Repair step failed");
            RepairStepReport {
                step,
                status: RepairStepStatus::Failed,
                message: Some(err.message),
            }
        }
    };
    result.steps.push(report);
    fatal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_file_db, temp_dir};
    use std::cell::{Cell, RefCell};
    use std::fs;

    /// Scripted maintenance target: integrity checks pop answers from a queue.
    struct FakeDb {
        calls: RefCell<Vec<&'static str>>,
        integrity: RefCell<Vec<bool>>,
        quick: RefCell<Vec<bool>>,
        fail_reindex: Cell<bool>,
    }

    impl FakeDb {
        fn new(integrity: &[bool]) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                integrity: RefCell::new(integrity.iter().rev().copied().collect()),
                quick: RefCell::new(Vec::new()),
                fail_reindex: Cell::new(false),
            }
        }

        fn report(ok: bool) -> IntegrityReport {
            IntegrityReport {
                ok,
                messages: vec![if ok { "ok".into() } else { "row 3 missing from index".into() }],
            }
        }
    }

    impl MaintenanceOps for FakeDb {
        fn checkpoint(&self) -> rusqlite::Result<()> {
            self.calls.borrow_mut().push("checkpoint");
            Ok(())
        }
        fn integrity_check(&self) -> rusqlite::Result<IntegrityReport> {
            self.calls.borrow_mut().push("integrity_check");
            Ok(Self::report(self.integrity.borrow_mut().pop().unwrap_or(false)))
        }
        fn quick_check(&self) -> rusqlite::Result<IntegrityReport> {
            self.calls.borrow_mut().push("quick_check");
            Ok(Self::report(self.quick.borrow_mut().pop().unwrap_or(false)))
        }
        fn reindex(&self) -> rusqlite::Result<()> {
            self.calls.borrow_mut().push("reindex");
            if self.fail_reindex.get() {
                return Err(rusqlite::Error::InvalidQuery);
            }
            Ok(())
        }
        fn vacuum(&self) -> rusqlite::Result<()> {
            self.calls.borrow_mut().push("vacuum");
            Ok(())
        }
    }

    fn db_file(label: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = temp_dir(label);
        let path = dir.join("pos.db");
        fs::write(&path, vec![7u8; 4096]).unwrap();
        (dir, path)
    }

    fn steps(result: &RepairResult) -> Vec<RepairStep> {
        result.steps.iter().map(|s| s.step).collect()
    }

    #[test]
    fn test_full_ladder_repairs() {
        let (dir, path) = db_file("repair_full");
        let config = HealthConfig::default();
        let fake = FakeDb::new(&[false, true]);

        let result = RepairEngine::new(&config).repair(&fake, &path);
        assert!(result.success);
        assert!(result.repaired);
        let backup = result.backup_path.clone().unwrap();
        assert!(Path::new(&backup).exists());
        assert_eq!(
            steps(&result),
            vec![
                RepairStep::Backup,
                RepairStep::Checkpoint,
                RepairStep::IntegrityCheck,
                RepairStep::Reindex,
                RepairStep::Vacuum,
                RepairStep::FinalIntegrityCheck,
            ]
        );
        assert_eq!(
            *fake.calls.borrow(),
            vec![
                "checkpoint",
                "checkpoint",
                "integrity_check",
                "reindex",
                "vacuum",
                "integrity_check"
            ]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_healthy_database_stops_after_integrity_check() {
        let (dir, path) = db_file("repair_healthy");
        let config = HealthConfig::default();
        let fake = FakeDb::new(&[true]);

        let result = RepairEngine::new(&config).repair(&fake, &path);
        assert!(result.success);
        assert!(!result.repaired);
        assert!(result.backup_path.is_some());
        assert!(!fake.calls.borrow().contains(&"reindex"));
        assert!(!fake.calls.borrow().contains(&"vacuum"));
        let skipped: Vec<RepairStep> = result
            .steps
            .iter()
            .filter(|s| s.status == RepairStepStatus::Skipped)
            .map(|s| s.step)
            .collect();
        assert_eq!(
            skipped,
            vec![RepairStep::Reindex, RepairStep::Vacuum, RepairStep::FinalIntegrityCheck]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_no_step_runs_without_backup() {
        let dir = temp_dir("repair_nobackup");
        let config = HealthConfig::default();
        let fake = FakeDb::new(&[false, true]);

        let result = RepairEngine::new(&config).repair(&fake, &dir.join("missing.db"));
        assert!(!result.success);
        assert!(result.backup_path.is_none());
        assert_eq!(steps(&result), vec![RepairStep::Backup]);
        assert_eq!(result.steps[0].status, RepairStepStatus::Failed);
        assert_eq!(*fake.calls.borrow(), vec!["checkpoint"]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_step_failure_is_not_fatal_to_ladder() {
        let (dir, path) = db_file("repair_nonfatal");
        let config = HealthConfig::default();
        let fake = FakeDb::new(&[false, true]);
        fake.fail_reindex.set(true);

        let result = RepairEngine::new(&config).repair(&fake, &path);
        assert!(result.success);
        let reindex = result
            .steps
            .iter()
            .find(|s| s.step == RepairStep::Reindex)
            .unwrap();
        assert_eq!(reindex.status, RepairStepStatus::Failed);
        assert!(fake.calls.borrow().contains(&"vacuum"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unrepairable_keeps_backup_path() {
        let (dir, path) = db_file("repair_fail");
        let config = HealthConfig::default();
        let fake = FakeDb::new(&[false, false]);

        let result = RepairEngine::new(&config).repair(&fake, &path);
        assert!(!result.success);
        assert!(!result.repaired);
        assert!(result.reason.as_deref().unwrap().contains("row 3 missing"));
        assert!(result.backup_path.is_some());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_quick_repair_retries_after_checkpoint() {
        let config = HealthConfig::default();
        let engine = RepairEngine::new(&config);

        let fake = FakeDb::new(&[]);
        *fake.quick.borrow_mut() = vec![true];
        assert!(engine.quick_repair(&fake));
        assert_eq!(*fake.calls.borrow(), vec!["quick_check"]);

        let fake = FakeDb::new(&[]);
        // popped from the back: first false, then true
        *fake.quick.borrow_mut() = vec![true, false];
        assert!(engine.quick_repair(&fake));
        assert_eq!(
            *fake.calls.borrow(),
            vec!["quick_check", "checkpoint", "quick_check"]
        );

        let fake = FakeDb::new(&[]);
        assert!(!engine.quick_repair(&fake));
    }

    #[test]
    fn test_real_connection_healthy_database() {
        let dir = temp_dir("repair_real");
        let path = dir.join("pos.db");
        create_file_db(&path);
        let conn = crate::db::open_and_configure(&path).unwrap();
        let config = HealthConfig::default();
        let engine = RepairEngine::new(&config);

        assert!(engine.quick_repair(&conn));
        let result = engine.repair(&conn, &path);
        assert!(result.success, "{result:?}");
        assert!(!result.repaired);
        drop(conn);
        let _ = fs::remove_dir_all(&dir);
    }
}
