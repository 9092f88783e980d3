//! Versioned schema migrations: the registry and the runner that applies it.
//!
//! Version 0 is the baseline schema created by `db::create_baseline_schema`.
//! Every change after that is a [`Migration`] appended to [`BUILTIN`] with the
//! next version number. Released migrations are never edited.

mod builtin;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{error, info};

use crate::db::{self, MIGRATIONS_TABLE};
use crate::error::MigrationError;

pub use builtin::BUILTIN;

/// A single schema change.
///
/// `is_applied` is a read-only check for the change's effect, so a migration
/// interrupted after its DDL but before its history row can be re-run
/// safely. `apply` is the pure schema/data transformation; logging is the
/// runner's job.
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub description: &'static str,
    pub is_applied: fn(&Connection) -> rusqlite::Result<bool>,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// One persisted row of the migration history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationApplicationRecord {
    pub version: u32,
    pub name: String,
    pub applied_at_epoch_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    /// The effect was already present; only the history row was written.
    pub already_present: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<AppliedMigration>,
}

/// Ordered, append-only list of migrations.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    /// Registry with migrations sorted by version. Use
    /// [`validate`](Self::validate) to check sequencing.
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    /// The migrations shipped with this build.
    pub fn builtin() -> Self {
        Self::new(BUILTIN.to_vec())
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    /// Migrations newer than `current_version`, ascending.
    pub fn pending(&self, current_version: u32) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| m.version > current_version)
            .collect()
    }

    /// Versions must start at 1 and be contiguous and unique; names and
    /// descriptions must be non-empty. The `apply` step is a fn pointer and
    /// therefore always present.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();

        for m in &self.migrations {
            if m.version == 0 {
                problems.push(format!("{}: version 0 is reserved for the baseline", m.name));
            }
            if !seen.insert(m.version) {
                problems.push(format!("duplicate version v{}", m.version));
            }
            if m.name.trim().is_empty() {
                problems.push(format!("v{} has an empty name", m.version));
            }
            if m.description.trim().is_empty() {
                problems.push(format!("v{} has an empty description", m.version));
            }
        }

        let mut versions: Vec<u32> = seen.into_iter().filter(|v| *v > 0).collect();
        versions.sort_unstable();
        if let Some(first) = versions.first() {
            if *first != 1 {
                problems.push(format!("versions must start at 1, found v{first}"));
            }
        }
        for pair in versions.windows(2) {
            if pair[1] != pair[0] + 1 {
                problems.push(format!("gap between v{} and v{}", pair[0], pair[1]));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Apply every migration newer than `current_version`, in order.
    ///
    /// Each migration runs in its own savepoint together with its history
    /// row. The first failure rolls back that migration and aborts the batch;
    /// migrations applied before it stay committed.
    pub fn apply_pending(
        &self,
        conn: &mut Connection,
        current_version: u32,
    ) -> Result<MigrationReport, MigrationError> {
        self.validate().map_err(MigrationError::InvalidRegistry)?;
        db::ensure_migrations_table(conn).map_err(MigrationError::History)?;

        let recorded: HashSet<u32> = applied_versions(conn)?
            .into_iter()
            .map(|r| r.version)
            .collect();

        let mut report = MigrationReport {
            from_version: current_version,
            to_version: current_version,
            applied: Vec::new(),
        };

        for migration in self.pending(current_version) {
            if recorded.contains(&migration.version) {
                report.to_version = migration.version;
                continue;
            }
            let started = Instant::now();
            let already_present = match run_one(conn, migration) {
                Ok(hit) => hit,
                Err(e) => {
                    error!(version = migration.version, name = migration.name, error = %e, "Migration failed, aborting batch");
                    return Err(e);
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;
            info!(
                version = migration.version,
                name = migration.name,
                already_present,
                duration_ms,
                "Applied migration"
            );
            report.to_version = migration.version;
            report.applied.push(AppliedMigration {
                version: migration.version,
                name: migration.name.to_string(),
                already_present,
                duration_ms,
            });
        }

        Ok(report)
    }
}

fn run_one(conn: &mut Connection, migration: &Migration) -> Result<bool, MigrationError> {
    let sp = conn
        .savepoint_with_name(format!("migration_v{}", migration.version))
        .map_err(MigrationError::History)?;

    let already = (migration.is_applied)(&sp).map_err(|source| MigrationError::Check {
        version: migration.version,
        name: migration.name,
        source,
    })?;
    if !already {
        (migration.apply)(&sp).map_err(|source| MigrationError::Apply {
            version: migration.version,
            name: migration.name,
            source,
        })?;
    }

    sp.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![migration.version, migration.name, Utc::now().timestamp_millis()],
    )
    .map_err(MigrationError::History)?;
    sp.commit().map_err(MigrationError::History)?;
    Ok(already)
}

/// Highest recorded migration version; 0 when the history table is absent
/// or empty.
pub fn current_version(conn: &Connection) -> Result<u32, MigrationError> {
    if !db::table_exists(conn, MIGRATIONS_TABLE).map_err(MigrationError::History)? {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, u32>(0),
    )
    .map_err(MigrationError::History)
}

/// Full migration history, oldest first.
pub fn applied_versions(conn: &Connection) -> Result<Vec<MigrationApplicationRecord>, MigrationError> {
    if !db::table_exists(conn, MIGRATIONS_TABLE).map_err(MigrationError::History)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn
        .prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")
        .map_err(MigrationError::History)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(MigrationApplicationRecord {
                version: row.get(0)?,
                name: row.get(1)?,
                applied_at_epoch_ms: row.get(2)?,
            })
        })
        .map_err(MigrationError::History)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(MigrationError::History)
}
