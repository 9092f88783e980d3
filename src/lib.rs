//! The Small POS - startup database health pipeline
//!
//! Before the POS touches its local SQLite database, [`open_database`] runs
//! the database through file validation, legacy path relocation, schema
//! compatibility checks, versioned migrations and, when needed, a
//! backup-first repair ladder. Every decision that could lose data goes
//! through a [`DecisionProvider`]; the caller gets back either a verified
//! connection or the reason startup must stop.

use serde_json::{json, Value};
use tracing::{error, info};

pub mod backup;
pub mod compatibility;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod file_validator;
pub mod logging;
pub mod migrations;
pub mod path_migrator;
pub mod recovery;
pub mod repair;

pub use config::{HealthConfig, PlatformPathProvider};
pub use db::DbState;
pub use error::DbHealthError;
pub use migrations::{Migration, MigrationRegistry};
pub use path_migrator::PathProvider;
pub use recovery::{
    open_database, DecisionProvider, PipelineReport, ReadyDatabase, RecoveryContext,
    RecoveryDecision, RecoveryOrchestrator, RecoveryOutcome,
};

/// Decision provider for unattended runs that must never discard data:
/// every prompt is answered with `Cancel`.
pub struct CancelAllDecisions;

impl DecisionProvider for CancelAllDecisions {
    fn present_recovery_choice(&self, context: &RecoveryContext) -> RecoveryDecision {
        info!(reason = ?context.reason, message = %context.message, "Declining recovery prompt");
        RecoveryDecision::Cancel
    }

    fn present_fatal_error(&self, title: &str, message: &str, detail: &str) {
        error!(%title, %detail, "{message}");
    }
}

/// Run the pipeline against the platform database without a UI and build
/// the JSON report printed by the CLI. Returns the report and whether the
/// database ended up ready.
pub fn run_headless(
    config: &HealthConfig,
    paths: &dyn PathProvider,
    decisions: Option<&dyn DecisionProvider>,
) -> (Value, bool) {
    info!("Starting The Small POS database check v{}", env!("CARGO_PKG_VERSION"));

    let registry = MigrationRegistry::builtin();
    let outcome = RecoveryOrchestrator::new(config, paths, decisions, &registry).run();

    let health = outcome
        .database
        .as_ref()
        .ok()
        .map(|ready| diagnostics::health_report(&ready.conn, &ready.db_path, config));
    let ready = outcome.database.is_ok();

    let report = json!({
        "about": diagnostics::about_info(),
        "ready": ready,
        "pipeline": outcome.report,
        "health": health,
    });
    (report, ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::temp_dir;
    use std::fs;

    #[test]
    fn test_headless_run_on_empty_data_dir() {
        let base = temp_dir("lib_headless");
        let config = HealthConfig::default();
        let paths = PlatformPathProvider::new(&base);

        let (report, ready) = run_headless(&config, &paths, None);
        assert!(ready);
        assert_eq!(report["ready"], true);
        assert_eq!(
            report["health"]["schemaVersion"],
            MigrationRegistry::builtin().latest_version()
        );
        assert_eq!(report["pipeline"]["trail"][0], "Start");
        assert!(paths.canonical_path().exists());
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_cancel_all_never_resets() {
        let base = temp_dir("lib_cancel");
        let config = HealthConfig::default();
        let paths = PlatformPathProvider::new(&base);
        let db_path = paths.canonical_path();
        fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        fs::write(&db_path, b"").unwrap();

        let (report, ready) = run_headless(&config, &paths, Some(&CancelAllDecisions));
        assert!(!ready);
        assert!(report["health"].is_null());
        assert!(report["pipeline"]["failure"]
            .as_str()
            .unwrap()
            .contains("cancelled"));
        assert_eq!(fs::metadata(&db_path).unwrap().len(), 0);
        let _ = fs::remove_dir_all(&base);
    }
}
