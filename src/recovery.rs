//! Startup state machine sequencing validation, relocation, compatibility,
//! migration and repair.
//!
//! The orchestrator owns the connection for the whole run and only hands it
//! out once the database is verified. Any choice that can affect user data
//! is delegated to a [`DecisionProvider`]; without one, the only default is
//! [`RecoveryDecision::BackupAndFresh`].

use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backup;
use crate::compatibility::CompatibilityChecker;
use crate::config::HealthConfig;
use crate::db::{self, DbState};
use crate::error::{DbHealthError, ValidationError};
use crate::file_validator;
use crate::migrations::{self, MigrationReport, MigrationRegistry};
use crate::path_migrator::{PathMigrationResult, PathMigrator, PathProvider};
use crate::repair::{MaintenanceOps, RepairEngine, RepairResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryDecision {
    BackupAndFresh,
    Repair,
    RestoreFromBackup,
    Cancel,
}

/// Why the user is being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    UnrecoverableFile,
    RepairFailed,
    Unhealthy,
    Incompatible,
    BackupFailed,
    MigrationFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    pub reason: RecoveryReason,
    pub db_path: PathBuf,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Choices on offer; always ends with `Cancel`.
    pub options: Vec<RecoveryDecision>,
    /// Newest backup that `RestoreFromBackup` would use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_candidate: Option<PathBuf>,
    pub requires_fresh_database: bool,
}

/// UI-side collaborator that asks the user what to do.
pub trait DecisionProvider {
    fn present_recovery_choice(&self, context: &RecoveryContext) -> RecoveryDecision;
    fn present_fatal_error(&self, title: &str, message: &str, detail: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Start,
    Validating,
    Initializing,
    Repairing,
    OpeningConnection,
    CheckingCompatibility,
    Migrating,
    AwaitingDecision,
    Ready,
    Failed,
}

enum Step {
    Start,
    Validating,
    Initializing,
    Repairing,
    OpeningConnection,
    CheckingCompatibility(Connection),
    Migrating(Connection, u32),
    AwaitingDecision(RecoveryContext),
    Ready(Connection),
    Failed(DbHealthError),
}

impl Step {
    fn state(&self) -> PipelineState {
        match self {
            Step::Start => PipelineState::Start,
            Step::Validating => PipelineState::Validating,
            Step::Initializing => PipelineState::Initializing,
            Step::Repairing => PipelineState::Repairing,
            Step::OpeningConnection => PipelineState::OpeningConnection,
            Step::CheckingCompatibility(_) => PipelineState::CheckingCompatibility,
            Step::Migrating(..) => PipelineState::Migrating,
            Step::AwaitingDecision(_) => PipelineState::AwaitingDecision,
            Step::Ready(_) => PipelineState::Ready,
            Step::Failed(_) => PipelineState::Failed,
        }
    }
}

/// Verified, migrated connection handed to the rest of the application.
pub struct ReadyDatabase {
    pub conn: Connection,
    pub db_path: PathBuf,
    pub schema_version: u32,
}

impl ReadyDatabase {
    pub fn into_state(self) -> DbState {
        DbState {
            conn: Mutex::new(self.conn),
            db_path: self.db_path,
        }
    }
}

/// What happened during one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub db_path: PathBuf,
    pub trail: Vec<PipelineState>,
    pub decisions: Vec<RecoveryDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_migration: Option<PathMigrationResult>,
    pub repairs: Vec<RepairResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrations: Option<MigrationReport>,
    pub backups: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

pub struct RecoveryOutcome {
    pub database: Result<ReadyDatabase, DbHealthError>,
    pub report: PipelineReport,
}

impl RecoveryOutcome {
    pub fn into_result(self) -> Result<ReadyDatabase, DbHealthError> {
        self.database
    }
}

pub struct RecoveryOrchestrator<'a> {
    config: &'a HealthConfig,
    paths: &'a dyn PathProvider,
    decisions: Option<&'a dyn DecisionProvider>,
    registry: &'a MigrationRegistry,
    db_path: PathBuf,
    repair_attempts: u32,
    report: PipelineReport,
}

impl<'a> RecoveryOrchestrator<'a> {
    pub fn new(
        config: &'a HealthConfig,
        paths: &'a dyn PathProvider,
        decisions: Option<&'a dyn DecisionProvider>,
        registry: &'a MigrationRegistry,
    ) -> Self {
        let db_path = paths.canonical_path();
        Self {
            config,
            paths,
            decisions,
            registry,
            report: PipelineReport {
                db_path: db_path.clone(),
                ..Default::default()
            },
            db_path,
            repair_attempts: 0,
        }
    }

    /// Drive the state machine to `Ready` or `Failed`.
    pub fn run(mut self) -> RecoveryOutcome {
        let mut step = Step::Start;
        let mut transitions = 0usize;

        loop {
            self.report.trail.push(step.state());
            step = match step {
                Step::Ready(conn) => {
                    let database = self.finish(conn);
                    return RecoveryOutcome {
                        database,
                        report: self.report,
                    };
                }
                Step::Failed(err) => {
                    self.report_failure(&err);
                    return RecoveryOutcome {
                        database: Err(err),
                        report: self.report,
                    };
                }
                other => {
                    transitions += 1;
                    if transitions > self.config.max_transitions {
                        Step::Failed(DbHealthError::TooManyTransitions(transitions - 1))
                    } else {
                        self.advance(other)
                    }
                }
            };
        }
    }

    fn advance(&mut self, step: Step) -> Step {
        match step {
            Step::Start => self.start(),
            Step::Validating => self.validating(),
            Step::Initializing => self.initializing(),
            Step::Repairing => self.repairing(),
            Step::OpeningConnection => self.opening_connection(),
            Step::CheckingCompatibility(conn) => self.checking_compatibility(conn),
            Step::Migrating(conn, version) => self.migrating(conn, version),
            Step::AwaitingDecision(context) => self.awaiting_decision(context),
            terminal @ (Step::Ready(_) | Step::Failed(_)) => terminal,
        }
    }

    fn start(&mut self) -> Step {
        info!(path = %self.db_path.display(), "Starting database health pipeline");

        // Both locations are checked before relocation may touch either one.
        let legacy = self.paths.legacy_path();
        for path in std::iter::once(&self.db_path).chain(legacy.as_ref()) {
            if file_validator::is_locked(path, self.config.lock_staleness) {
                return Step::Failed(DbHealthError::Locked(path.clone()));
            }
        }

        let migrator = PathMigrator::new(self.paths, self.config);
        if migrator.should_migrate() {
            let result = migrator.migrate(self.config.remove_legacy_after_migration);
            if result.migrated {
                info!(from = ?result.old_path, "Legacy database relocated");
            } else {
                warn!(reason = ?result.reason, "Legacy database not relocated, continuing with canonical path");
            }
            if let Some(backup) = &result.backup_path {
                self.report.backups.push(PathBuf::from(backup));
            }
            self.report.path_migration = Some(result);
        }

        if let Some(parent) = self.db_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return Step::Failed(e.into());
            }
        }
        Step::Validating
    }

    fn validating(&mut self) -> Step {
        let result = file_validator::validate(&self.db_path);
        debug!(?result, "File validation finished");
        if result.is_fresh() {
            return Step::Initializing;
        }
        if result.valid {
            return Step::OpeningConnection;
        }

        let err = result.to_error().unwrap_or_else(|| ValidationError {
            reason: "database file is invalid".to_string(),
            can_recover: false,
            is_corrupted: false,
        });
        if err.can_recover && self.repair_budget_left() {
            info!(reason = %err.reason, "Database file damaged, attempting repair");
            return Step::Repairing;
        }
        warn!(reason = %err.reason, "Database file unusable");
        Step::AwaitingDecision(self.context(
            RecoveryReason::UnrecoverableFile,
            format!("The database file cannot be used: {}", err.reason),
            None,
            &[RecoveryDecision::BackupAndFresh],
            false,
        ))
    }

    fn initializing(&mut self) -> Step {
        let init = || -> Result<(Connection, MigrationReport), DbHealthError> {
            let mut conn = db::open_and_configure(&self.db_path)?;
            let compat = CompatibilityChecker::new(self.registry).check(&conn, &self.db_path);
            if let Some(err) = compat.to_error() {
                return Err(err.into());
            }
            let from = if compat.fresh_database {
                db::create_baseline_schema(&conn)?;
                0
            } else {
                debug!(version = compat.schema_version(), "Schema already present, migrating in place");
                compat.schema_version()
            };
            let report = self.registry.apply_pending(&mut conn, from)?;
            Ok((conn, report))
        };

        match init() {
            Ok((conn, report)) => {
                info!(version = report.to_version, "Fresh database initialized");
                self.report.migrations = Some(report);
                Step::Ready(conn)
            }
            Err(e) => {
                error!(error = %e, "Fresh database initialization failed");
                Step::Failed(e)
            }
        }
    }

    fn repairing(&mut self) -> Step {
        self.repair_attempts += 1;
        let engine = RepairEngine::new(self.config);

        let result = match Connection::open(&self.db_path) {
            Ok(conn) => engine.repair(&conn, &self.db_path),
            Err(e) => RepairResult {
                reason: Some(format!("could not open database for repair: {e}")),
                ..Default::default()
            },
        };
        if let Some(backup) = &result.backup_path {
            self.report.backups.push(PathBuf::from(backup));
        }
        let success = result.success;
        let reason = result.reason.clone();
        self.report.repairs.push(result);

        if success {
            return Step::OpeningConnection;
        }
        Step::AwaitingDecision(self.context(
            RecoveryReason::RepairFailed,
            "The database could not be repaired.".to_string(),
            reason,
            &[RecoveryDecision::BackupAndFresh],
            false,
        ))
    }

    fn opening_connection(&mut self) -> Step {
        let check = file_validator::validate(&self.db_path);
        if check.is_fresh() {
            return Step::Initializing;
        }
        if !check.valid {
            if check.is_recoverable() && self.repair_budget_left() {
                return Step::Repairing;
            }
            return Step::AwaitingDecision(self.context(
                RecoveryReason::UnrecoverableFile,
                "The database file cannot be used.".to_string(),
                check.reason,
                &[RecoveryDecision::BackupAndFresh],
                false,
            ));
        }

        let conn = match db::open_and_configure(&self.db_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Database open failed");
                return self.unhealthy(format!("open failed: {e}"));
            }
        };

        if !RepairEngine::new(self.config).quick_repair(&conn) {
            drop(conn);
            return self.unhealthy("quick integrity check failed".to_string());
        }
        Step::CheckingCompatibility(conn)
    }

    fn unhealthy(&mut self, detail: String) -> Step {
        if self.repair_budget_left() {
            return Step::Repairing;
        }
        Step::AwaitingDecision(self.context(
            RecoveryReason::Unhealthy,
            "The database failed its health check.".to_string(),
            Some(detail),
            &[
                RecoveryDecision::BackupAndFresh,
                RecoveryDecision::RestoreFromBackup,
            ],
            false,
        ))
    }

    fn checking_compatibility(&mut self, conn: Connection) -> Step {
        let result = CompatibilityChecker::new(self.registry).check(&conn, &self.db_path);
        if result.fresh_database {
            debug!("Database file has no schema yet, initializing in place");
            return Step::Initializing;
        }
        if result.compatible {
            let version = result.schema_version();
            debug!(version, "Database schema compatible");
            return Step::Migrating(conn, version);
        }
        drop(conn);

        let err = result.to_error();
        let requires_fresh = result.requires_fresh_database.unwrap_or(false);
        warn!(reason = ?result.reason, requires_fresh, "Database schema incompatible");
        Step::AwaitingDecision(self.context(
            RecoveryReason::Incompatible,
            "The database is not compatible with this version of the app.".to_string(),
            err.map(|e| e.reason),
            &[
                RecoveryDecision::Repair,
                RecoveryDecision::BackupAndFresh,
                RecoveryDecision::RestoreFromBackup,
            ],
            requires_fresh,
        ))
    }

    fn migrating(&mut self, mut conn: Connection, version: u32) -> Step {
        if self.registry.pending(version).is_empty() {
            return Step::Ready(conn);
        }

        if let Err(e) = conn.checkpoint() {
            warn!(error = %e, "Pre-migration checkpoint failed");
        }
        match backup::create_verified_backup(&self.db_path, "migration", self.config) {
            Ok(path) => self.report.backups.push(path),
            Err(e) => {
                drop(conn);
                return Step::AwaitingDecision(self.context(
                    RecoveryReason::BackupFailed,
                    "A backup could not be created before updating the database.".to_string(),
                    Some(e.to_string()),
                    &[
                        RecoveryDecision::RestoreFromBackup,
                        RecoveryDecision::BackupAndFresh,
                    ],
                    false,
                ));
            }
        }

        match self.registry.apply_pending(&mut conn, version) {
            Ok(report) => {
                info!(from = report.from_version, to = report.to_version, count = report.applied.len(), "Migrations applied");
                self.report.migrations = Some(report);
                Step::Ready(conn)
            }
            Err(e) => {
                error!(error = %e, "Migration batch failed");
                drop(conn);
                Step::AwaitingDecision(self.context(
                    RecoveryReason::MigrationFailed,
                    "The database could not be updated to the current version.".to_string(),
                    Some(e.to_string()),
                    &[
                        RecoveryDecision::RestoreFromBackup,
                        RecoveryDecision::BackupAndFresh,
                    ],
                    false,
                ))
            }
        }
    }

    fn awaiting_decision(&mut self, context: RecoveryContext) -> Step {
        let decision = match self.decisions {
            Some(provider) => provider.present_recovery_choice(&context),
            None => {
                info!("No decision provider available, defaulting to backup and fresh start");
                RecoveryDecision::BackupAndFresh
            }
        };
        let decision = if context.options.contains(&decision) {
            decision
        } else {
            warn!(?decision, offered = ?context.options, "Decision not on offer, treating as cancel");
            RecoveryDecision::Cancel
        };
        info!(?decision, reason = ?context.reason, "Recovery decision");
        self.report.decisions.push(decision);

        match decision {
            RecoveryDecision::BackupAndFresh => match self.clear_for_fresh_start() {
                Ok(()) => Step::Initializing,
                Err(e) => Step::Failed(e),
            },
            RecoveryDecision::Repair => Step::Repairing,
            RecoveryDecision::RestoreFromBackup => {
                let Some(candidate) = context
                    .restore_candidate
                    .or_else(|| backup::latest_restorable_backup(&self.db_path, self.config))
                else {
                    return Step::Failed(DbHealthError::Validation(ValidationError {
                        reason: "no restorable backup found".to_string(),
                        can_recover: false,
                        is_corrupted: false,
                    }));
                };
                match backup::restore_from_backup(&candidate, &self.db_path, self.config) {
                    Ok(pre_restore) => {
                        self.report.backups.extend(pre_restore);
                        Step::OpeningConnection
                    }
                    Err(e) => Step::Failed(e.into()),
                }
            }
            RecoveryDecision::Cancel => {
                Step::Failed(DbHealthError::Cancelled {
                    reason: context.reason,
                    message: context.message,
                    detail: context.detail,
                })
            }
        }
    }

    /// Back up (when there is anything to keep) and remove the current file.
    fn clear_for_fresh_start(&mut self) -> Result<(), DbHealthError> {
        let has_data = fs::metadata(&self.db_path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if has_data {
            let path = backup::create_verified_backup(&self.db_path, "fresh-start", self.config)?;
            self.report.backups.push(path);
        }
        if self.db_path.exists() {
            fs::remove_file(&self.db_path)?;
        }
        db::remove_sidecars(&self.db_path);
        info!(path = %self.db_path.display(), "Database cleared for fresh start");
        Ok(())
    }

    fn finish(&mut self, conn: Connection) -> Result<ReadyDatabase, DbHealthError> {
        let schema_version = migrations::current_version(&conn)?;
        self.report.schema_version = Some(schema_version);

        let backups_dir = backup::backup_dir(&self.db_path, self.config);
        let pruned = backup::prune_backups(&backups_dir, self.config.max_backups);
        if pruned > 0 {
            debug!(pruned, "Old backups pruned");
        }
        info!(schema_version, path = %self.db_path.display(), "Database ready");
        Ok(ReadyDatabase {
            conn,
            db_path: self.db_path.clone(),
            schema_version,
        })
    }

    fn report_failure(&mut self, err: &DbHealthError) {
        error!(error = %err, "Database health pipeline failed");
        self.report.failure = Some(err.to_string());
        if matches!(err, DbHealthError::Cancelled { .. }) {
            return;
        }
        if let Some(provider) = self.decisions {
            provider.present_fatal_error(
                "Database error",
                "The point-of-sale database could not be opened.",
                &err.to_string(),
            );
        }
    }

    fn repair_budget_left(&self) -> bool {
        self.repair_attempts < self.config.max_repair_attempts
    }

    fn context(
        &self,
        reason: RecoveryReason,
        message: String,
        detail: Option<String>,
        offered: &[RecoveryDecision],
        requires_fresh_database: bool,
    ) -> RecoveryContext {
        let restore_candidate = backup::latest_restorable_backup(&self.db_path, self.config);
        let mut options: Vec<RecoveryDecision> = offered
            .iter()
            .copied()
            .filter(|d| match d {
                RecoveryDecision::Repair => self.repair_budget_left(),
                RecoveryDecision::RestoreFromBackup => restore_candidate.is_some(),
                _ => true,
            })
            .collect();
        options.push(RecoveryDecision::Cancel);

        RecoveryContext {
            reason,
            db_path: self.db_path.clone(),
            message,
            detail,
            options,
            restore_candidate,
            requires_fresh_database,
        }
    }
}

/// Run the whole pipeline and hand back either a ready connection or the
/// reason the application must not start.
pub fn open_database(
    config: &HealthConfig,
    paths: &dyn PathProvider,
    decisions: Option<&dyn DecisionProvider>,
    registry: &MigrationRegistry,
) -> Result<ReadyDatabase, DbHealthError> {
    RecoveryOrchestrator::new(config, paths, decisions, registry)
        .run()
        .into_result()
}
