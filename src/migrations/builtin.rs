//! Migrations shipped with this build. Append only.

use rusqlite::Connection;

use super::Migration;
use crate::db::{column_exists, index_exists, table_exists};

pub static BUILTIN: &[Migration] = &[
    Migration {
        version: 1,
        name: "sync_queue_retry_scheduling",
        description: "Deferred retries and remote receipt tracking on sync_queue",
        is_applied: v1_is_applied,
        apply: v1_apply,
    },
    Migration {
        version: 2,
        name: "orders_client_request_id",
        description: "Client request id on orders for idempotent order creation",
        is_applied: v2_is_applied,
        apply: v2_apply,
    },
    Migration {
        version: 3,
        name: "driver_earnings",
        description: "Per-delivery driver earning records",
        is_applied: v3_is_applied,
        apply: v3_apply,
    },
];

fn v1_is_applied(conn: &Connection) -> rusqlite::Result<bool> {
    Ok(column_exists(conn, "sync_queue", "next_retry_at")?
        && column_exists(conn, "sync_queue", "retry_delay_ms")?
        && column_exists(conn, "sync_queue", "remote_receipt_id")?
        && index_exists(conn, "idx_sync_queue_status_next_retry")?
        && index_exists(conn, "idx_sync_queue_remote_receipt")?)
}

/// Adds:
/// - `next_retry_at` for deferred retries
/// - `retry_delay_ms` for deterministic retry pacing
/// - `remote_receipt_id` for async receipt polling
fn v1_apply(conn: &Connection) -> rusqlite::Result<()> {
    if !column_exists(conn, "sync_queue", "next_retry_at")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN next_retry_at TEXT;")?;
    }
    if !column_exists(conn, "sync_queue", "retry_delay_ms")? {
        conn.execute_batch(
            "ALTER TABLE sync_queue ADD COLUMN retry_delay_ms INTEGER NOT NULL DEFAULT 5000;",
        )?;
    }
    if !column_exists(conn, "sync_queue", "remote_receipt_id")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN remote_receipt_id TEXT;")?;
    }
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status_next_retry
            ON sync_queue(status, next_retry_at);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_remote_receipt
            ON sync_queue(remote_receipt_id);
        ",
    )
}

fn v2_is_applied(conn: &Connection) -> rusqlite::Result<bool> {
    Ok(column_exists(conn, "orders", "client_request_id")?
        && index_exists(conn, "idx_orders_client_request_id_unique")?)
}

fn v2_apply(conn: &Connection) -> rusqlite::Result<()> {
    if !column_exists(conn, "orders", "client_request_id")? {
        conn.execute_batch("ALTER TABLE orders ADD COLUMN client_request_id TEXT;")?;
    }
    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_client_request_id_unique
            ON orders(client_request_id)
            WHERE client_request_id IS NOT NULL;
        ",
    )
}

fn v3_is_applied(conn: &Connection) -> rusqlite::Result<bool> {
    table_exists(conn, "driver_earnings")
}

fn v3_apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS driver_earnings (
            id TEXT PRIMARY KEY,
            driver_id TEXT NOT NULL,
            staff_shift_id TEXT,
            order_id TEXT UNIQUE NOT NULL,
            branch_id TEXT NOT NULL,
            delivery_fee REAL DEFAULT 0,
            tip_amount REAL DEFAULT 0,
            total_earning REAL NOT NULL,
            payment_method TEXT NOT NULL CHECK(payment_method IN('cash','card','mixed')),
            cash_collected REAL DEFAULT 0,
            card_amount REAL DEFAULT 0,
            settled INTEGER DEFAULT 0,
            settled_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(staff_shift_id) REFERENCES staff_shifts(id) ON DELETE SET NULL,
            FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_driver_earnings_shift_id
            ON driver_earnings(staff_shift_id);
        CREATE INDEX IF NOT EXISTS idx_driver_earnings_driver_id
            ON driver_earnings(driver_id);
        ",
    )
}
