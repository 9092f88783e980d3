//! SQLite connection layer shared by every pipeline stage.
//!
//! Uses rusqlite with WAL mode. Holds the version-0 baseline schema, the
//! migration history table definition and the introspection helpers that
//! make migrations structurally idempotent.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Table holding one row per applied migration.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Managed state holding the verified database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Open the database file and apply pragmas.
pub fn open_and_configure(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// `<db>-wal` sidecar path.
pub fn wal_path(db_path: &Path) -> PathBuf {
    sidecar_path(db_path, "-wal")
}

/// `<db>-shm` sidecar path.
pub fn shm_path(db_path: &Path) -> PathBuf {
    sidecar_path(db_path, "-shm")
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Remove WAL/SHM sidecars. Missing files are fine.
pub fn remove_sidecars(db_path: &Path) {
    for sidecar in [wal_path(db_path), shm_path(db_path)] {
        if sidecar.exists() {
            if let Err(e) = fs::remove_file(&sidecar) {
                warn!(path = %sidecar.display(), error = %e, "Failed to remove sidecar");
            }
        }
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

pub fn index_exists(conn: &Connection, index: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1 LIMIT 1",
        params![index],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let mut rows = stmt.query(params![table])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Number of non-system tables (anything not prefixed `sqlite_`).
pub fn user_table_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
        [],
        |row| row.get(0),
    )
}

/// Create the migration history table if missing.
pub fn ensure_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )
}

/// Baseline (version 0) POS schema for a freshly created database.
///
/// Every later change is a registered migration; this batch is never edited
/// to carry new columns.
pub fn create_baseline_schema(conn: &Connection) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- orders
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT,
            customer_name TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            total_amount REAL NOT NULL DEFAULT 0,
            tax_amount REAL DEFAULT 0,
            subtotal REAL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            order_type TEXT DEFAULT 'dine-in',
            payment_status TEXT DEFAULT 'pending',
            payment_method TEXT,
            staff_shift_id TEXT,
            staff_id TEXT,
            discount_amount REAL DEFAULT 0,
            tip_amount REAL DEFAULT 0,
            terminal_id TEXT,
            branch_id TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- sync_queue (append-only)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER DEFAULT 0,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        -- staff_sessions
        CREATE TABLE IF NOT EXISTS staff_sessions (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            pin_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'staff',
            login_time TEXT DEFAULT (datetime('now')),
            logout_time TEXT,
            is_active INTEGER DEFAULT 1
        );

        -- menu_cache
        CREATE TABLE IF NOT EXISTS menu_cache (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            cache_key TEXT UNIQUE NOT NULL,
            data TEXT NOT NULL,
            version TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- staff_shifts
        CREATE TABLE IF NOT EXISTS staff_shifts (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            branch_id TEXT,
            terminal_id TEXT,
            role_type TEXT NOT NULL CHECK (role_type IN ('cashier', 'manager', 'driver', 'kitchen', 'server')),
            check_in_time TEXT NOT NULL,
            check_out_time TEXT,
            opening_cash_amount REAL DEFAULT 0,
            closing_cash_amount REAL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'closed', 'abandoned')),
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- cash_drawer_sessions
        CREATE TABLE IF NOT EXISTS cash_drawer_sessions (
            id TEXT PRIMARY KEY,
            staff_shift_id TEXT NOT NULL UNIQUE,
            cashier_id TEXT NOT NULL,
            opening_amount REAL NOT NULL DEFAULT 0,
            closing_amount REAL,
            expected_amount REAL,
            variance_amount REAL,
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            FOREIGN KEY(staff_shift_id) REFERENCES staff_shifts(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_staff_shifts_status ON staff_shifts(status);

        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );
        ",
    )?;
    tx.commit()?;
    debug!("Baseline schema created");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    pub(crate) fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        conn
    }

    /// Fresh scratch directory under the system temp dir.
    pub(crate) fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{label}_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    /// Create a real on-disk database with the baseline schema.
    pub(crate) fn create_file_db(path: &Path) {
        let conn = open_and_configure(path).expect("open file db");
        create_baseline_schema(&conn).expect("baseline");
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .expect("checkpoint");
    }

    #[test]
    fn test_baseline_schema_tables() {
        let conn = test_db();
        create_baseline_schema(&conn).unwrap();

        for table in [
            "local_settings",
            "orders",
            "sync_queue",
            "staff_sessions",
            "menu_cache",
            "staff_shifts",
            "cash_drawer_sessions",
            MIGRATIONS_TABLE,
        ] {
            assert!(table_exists(&conn, table).unwrap(), "missing {table}");
        }
        assert_eq!(user_table_count(&conn).unwrap(), 8);
        assert!(index_exists(&conn, "idx_orders_status").unwrap());
        assert!(!index_exists(&conn, "idx_nope").unwrap());
    }

    #[test]
    fn test_baseline_is_idempotent() {
        let conn = test_db();
        create_baseline_schema(&conn).unwrap();
        create_baseline_schema(&conn).unwrap();
        assert_eq!(user_table_count(&conn).unwrap(), 8);
    }

    #[test]
    fn test_column_exists() {
        let conn = test_db();
        create_baseline_schema(&conn).unwrap();
        assert!(column_exists(&conn, "sync_queue", "retry_count").unwrap());
        assert!(!column_exists(&conn, "sync_queue", "next_retry_at").unwrap());
        assert!(!column_exists(&conn, "no_such_table", "id").unwrap());
    }

    #[test]
    fn test_user_table_count_ignores_sqlite_internal_tables() {
        let conn = test_db();
        // AUTOINCREMENT creates sqlite_sequence
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT);")
            .unwrap();
        assert!(table_exists(&conn, "sqlite_sequence").unwrap());
        assert_eq!(user_table_count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = temp_dir("pos_health_test_wal");
        let db_path = dir.join("test_wal.db");
        let conn = open_and_configure(&db_path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
        drop(conn);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sidecar_paths() {
        let db = Path::new("/data/pos.db");
        assert_eq!(wal_path(db), PathBuf::from("/data/pos.db-wal"));
        assert_eq!(shm_path(db), PathBuf::from("/data/pos.db-shm"));
    }
}
