//! Local SQLite database layer for the recargas counter core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the managed
//! connection state shared by every core operation. The relational store is
//! the only shared resource in the system; all operations are request-scoped
//! and synchronous.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::CoreError;

/// Managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned mutex to a core error.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.conn.lock().map_err(|_| CoreError::LockPoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/recargas.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, CoreError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| CoreError::Validation(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("recargas.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), CoreError> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: shift templates, assignments, activity log and the
/// collaborator tables the core validates against (users, carriers).
fn migrate_v1(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        "
        -- users (external collaborator; the core only checks existence)
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            display_name TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- carriers (phone-credit providers; name drives the bonus rule)
        CREATE TABLE IF NOT EXISTS carriers (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- shift_templates (reusable work-period definitions)
        CREATE TABLE IF NOT EXISTS shift_templates (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            description TEXT,
            active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- shift_assignments (live binding user <-> shift template)
        -- operation_mode replaces the legacy agent/counter boolean pair:
        -- a single nullable column makes the both-held state unrepresentable.
        CREATE TABLE IF NOT EXISTS shift_assignments (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            shift_id TEXT NOT NULL REFERENCES shift_templates(id),
            assigned_at TEXT NOT NULL,
            real_start TEXT,
            real_end TEXT,
            active INTEGER NOT NULL DEFAULT 0,
            operation_mode TEXT CHECK (operation_mode IN ('agent', 'counter')),
            register_number INTEGER,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- activity_log (append-only; never mutated or deleted)
        CREATE TABLE IF NOT EXISTS activity_log (
            id TEXT PRIMARY KEY,
            shift_id TEXT,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('start', 'finalize', 'reset', 'pause', 'resume')),
            at TEXT NOT NULL,
            description TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_assignments_user ON shift_assignments(user_id, active);
        CREATE INDEX IF NOT EXISTS idx_assignments_shift ON shift_assignments(shift_id, active);
        CREATE INDEX IF NOT EXISTS idx_assignments_mode ON shift_assignments(operation_mode, active);
        CREATE INDEX IF NOT EXISTS idx_activity_log_shift ON activity_log(shift_id, at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        CoreError::Db(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: closings and the five satellite record tables.
///
/// Every satellite row carries (user_id, register_number, closing_id NULL,
/// active, occurred_at). closing_id only ever transitions from NULL to a
/// value via the association sweep.
fn migrate_v2(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        "
        -- closings (immutable register snapshot at shift end)
        CREATE TABLE IF NOT EXISTS closings (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            assignment_id TEXT NOT NULL REFERENCES shift_assignments(id),
            register_number INTEGER NOT NULL,
            initial_cash REAL NOT NULL DEFAULT 0,
            house_advance REAL NOT NULL DEFAULT 0,
            agent_advance REAL NOT NULL DEFAULT 0,
            cash_sales REAL NOT NULL DEFAULT 0,
            credit_payments REAL NOT NULL DEFAULT 0,
            balance_sales REAL NOT NULL DEFAULT 0,
            product_payments REAL NOT NULL DEFAULT 0,
            expenses REAL NOT NULL DEFAULT 0,
            agent_loans REAL NOT NULL DEFAULT 0,
            total_cash REAL NOT NULL DEFAULT 0,
            counted_cash REAL NOT NULL DEFAULT 0,
            surplus_shortfall REAL NOT NULL DEFAULT 0,
            at TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- shift_expenses
        CREATE TABLE IF NOT EXISTS shift_expenses (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            expense_type TEXT NOT NULL DEFAULT 'other',
            amount REAL NOT NULL,
            description TEXT,
            register_number INTEGER,
            closing_id TEXT REFERENCES closings(id),
            active INTEGER NOT NULL DEFAULT 1,
            occurred_at TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- balance_flows (carrier balance per register; recalculated in batch)
        CREATE TABLE IF NOT EXISTS balance_flows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            carrier_id TEXT REFERENCES carriers(id),
            user_id TEXT NOT NULL,
            initial_balance REAL NOT NULL DEFAULT 0,
            purchased_amount REAL NOT NULL DEFAULT 0,
            sold_total REAL NOT NULL DEFAULT 0,
            final_balance REAL NOT NULL DEFAULT 0,
            register_number INTEGER,
            closing_id TEXT REFERENCES closings(id),
            active INTEGER NOT NULL DEFAULT 1,
            occurred_at TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- balance_sales (individual credit sales against a flow)
        CREATE TABLE IF NOT EXISTS balance_sales (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL REFERENCES balance_flows(id),
            user_id TEXT NOT NULL,
            amount REAL NOT NULL,
            register_number INTEGER,
            closing_id TEXT REFERENCES closings(id),
            active INTEGER NOT NULL DEFAULT 1,
            occurred_at TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- bill_counts (physical denomination counts at close-out)
        CREATE TABLE IF NOT EXISTS bill_counts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            denomination INTEGER NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            register_number INTEGER,
            closing_id TEXT REFERENCES closings(id),
            active INTEGER NOT NULL DEFAULT 1,
            occurred_at TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- staff_loans (loans and advances handed out during the shift)
        CREATE TABLE IF NOT EXISTS staff_loans (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            loan_type TEXT NOT NULL DEFAULT 'loan' CHECK (loan_type IN ('loan', 'advance')),
            amount REAL NOT NULL,
            description TEXT,
            register_number INTEGER,
            closing_id TEXT REFERENCES closings(id),
            active INTEGER NOT NULL DEFAULT 1,
            occurred_at TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_closings_user ON closings(user_id, active);
        CREATE INDEX IF NOT EXISTS idx_expenses_sweep ON shift_expenses(register_number, closing_id);
        CREATE INDEX IF NOT EXISTS idx_flows_sweep ON balance_flows(register_number, closing_id);
        CREATE INDEX IF NOT EXISTS idx_flows_active ON balance_flows(active);
        CREATE INDEX IF NOT EXISTS idx_sales_flow ON balance_sales(flow_id, active);
        CREATE INDEX IF NOT EXISTS idx_sales_sweep ON balance_sales(register_number, closing_id);
        CREATE INDEX IF NOT EXISTS idx_bills_sweep ON bill_counts(register_number, closing_id);
        CREATE INDEX IF NOT EXISTS idx_loans_sweep ON staff_loans(register_number, closing_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        CoreError::Db(e)
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Test hook: run all migrations against an arbitrary (in-memory) connection.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
