//! Closing reconciliation engine for the recargas counter core.
//!
//! A closing is the immutable financial snapshot of a register at shift end:
//! the computed cash position against the physically counted cash. Creating
//! one requires a valid operating context (active assignment + register
//! number) and is followed by the association sweep, which stamps loose
//! satellite rows with the new closing's id.
//!
//! The sweep is a best-effort batch, not an all-or-nothing transaction: a
//! partial sweep is recoverable (unstamped rows remain discoverable by a
//! future sweep), whereas aborting the whole closing is not acceptable to
//! the business process.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Financial figures for a closing, computed by the aggregation layer and
/// passed in. The engine persists them and derives the two totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClosingFigures {
    pub initial_cash: f64,
    pub house_advance: f64,
    pub agent_advance: f64,
    pub cash_sales: f64,
    pub credit_payments: f64,
    pub balance_sales: f64,
    pub product_payments: f64,
    pub expenses: f64,
    pub agent_loans: f64,
    /// Cash physically counted in the till.
    pub counted_cash: f64,
    /// Closing timestamp; defaults to now when omitted.
    pub at: Option<String>,
}

impl ClosingFigures {
    /// Computed cash that should be in the till.
    pub fn total_cash(&self) -> f64 {
        self.initial_cash + self.house_advance + self.agent_advance + self.cash_sales
            + self.credit_payments
            + self.balance_sales
            - self.product_payments
            - self.expenses
            - self.agent_loans
    }

    /// Counted minus computed; positive is surplus, negative is shortfall.
    pub fn surplus_shortfall(&self) -> f64 {
        self.counted_cash - self.total_cash()
    }

    fn validate(&self) -> Result<(), CoreError> {
        let fields = [
            ("initial_cash", self.initial_cash),
            ("house_advance", self.house_advance),
            ("agent_advance", self.agent_advance),
            ("cash_sales", self.cash_sales),
            ("credit_payments", self.credit_payments),
            ("balance_sales", self.balance_sales),
            ("product_payments", self.product_payments),
            ("expenses", self.expenses),
            ("agent_loans", self.agent_loans),
            ("counted_cash", self.counted_cash),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(CoreError::Validation(format!(
                    "closing figure {name} is not a finite number"
                )));
            }
        }
        if let Some(at) = &self.at {
            chrono::DateTime::parse_from_rfc3339(at)
                .map_err(|e| CoreError::Validation(format!("bad closing time {at:?}: {e}")))?;
        }
        Ok(())
    }
}

/// Aggregate result of the association sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// Rows stamped with the closing id across all tables.
    pub stamped: usize,
    /// Tables whose update failed (by name).
    pub failed_tables: Vec<String>,
    /// One message per failed table.
    pub errors: Vec<String>,
}

/// Returned by `create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingReceipt {
    pub closing_id: String,
    pub register_number: i64,
    pub total_cash: f64,
    pub surplus_shortfall: f64,
    pub sweep: SweepOutcome,
}

/// A persisted closing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Closing {
    pub id: String,
    pub user_id: String,
    pub assignment_id: String,
    pub register_number: i64,
    pub figures: ClosingFigures,
    pub total_cash: f64,
    pub surplus_shortfall: f64,
    pub at: String,
    pub active: bool,
}

/// The five satellite shapes stamped by the sweep.
const SWEEP_TARGETS: &[&str] = &[
    "shift_expenses",
    "balance_flows",
    "balance_sales",
    "bill_counts",
    "staff_loans",
];

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Create a closing snapshot for the user's active register, then sweep.
///
/// Requires an active assignment with a register number; the closing row is
/// stamped with both. The numeric fields are persisted exactly as passed
/// (plus the two derived totals) and are never retouched afterwards.
pub fn create(
    db: &DbState,
    user_id: &str,
    figures: &ClosingFigures,
) -> Result<ClosingReceipt, CoreError> {
    figures.validate()?;

    let conn = db.lock()?;

    let assignment: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT id, register_number FROM shift_assignments
             WHERE user_id = ?1 AND active = 1
             ORDER BY assigned_at DESC LIMIT 1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (assignment_id, register_number) = match assignment {
        None => return Err(CoreError::NoActiveAssignment(user_id.to_string())),
        Some((_, None)) => return Err(CoreError::NoRegisterAssigned(user_id.to_string())),
        Some((id, Some(reg))) => (id, reg),
    };

    let closing_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let at = figures.at.clone().unwrap_or_else(|| now.clone());
    let total_cash = figures.total_cash();
    let surplus_shortfall = figures.surplus_shortfall();

    conn.execute(
        "INSERT INTO closings (
            id, user_id, assignment_id, register_number,
            initial_cash, house_advance, agent_advance, cash_sales,
            credit_payments, balance_sales, product_payments, expenses,
            agent_loans, total_cash, counted_cash, surplus_shortfall,
            at, active, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, 1, ?18)",
        params![
            closing_id,
            user_id,
            assignment_id,
            register_number,
            figures.initial_cash,
            figures.house_advance,
            figures.agent_advance,
            figures.cash_sales,
            figures.credit_payments,
            figures.balance_sales,
            figures.product_payments,
            figures.expenses,
            figures.agent_loans,
            total_cash,
            figures.counted_cash,
            surplus_shortfall,
            at,
            now,
        ],
    )?;

    info!(
        closing_id = %closing_id,
        user_id = %user_id,
        register = register_number,
        total_cash = %total_cash,
        surplus_shortfall = %surplus_shortfall,
        "Closing created"
    );

    let sweep = sweep_with_conn(&conn, &closing_id, register_number);

    Ok(ClosingReceipt {
        closing_id,
        register_number,
        total_cash,
        surplus_shortfall,
        sweep,
    })
}

// ---------------------------------------------------------------------------
// Association sweep
// ---------------------------------------------------------------------------

/// Stamp pending satellite rows (matching register, no closing reference yet)
/// with `closing_id`.
///
/// Idempotent: the `closing_id IS NULL` guard means already-stamped rows are
/// never reassigned, so re-running the sweep only picks up stragglers.
pub fn sweep_pending_records(
    db: &DbState,
    closing_id: &str,
    register_number: i64,
) -> Result<SweepOutcome, CoreError> {
    let conn = db.lock()?;
    Ok(sweep_with_conn(&conn, closing_id, register_number))
}

fn sweep_with_conn(conn: &Connection, closing_id: &str, register_number: i64) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();

    for table in SWEEP_TARGETS {
        // Tables are processed sequentially, each behind its own error
        // boundary; a failure is logged and skipped, never fatal.
        let sql = format!(
            "UPDATE {table} SET closing_id = ?1
             WHERE register_number = ?2 AND closing_id IS NULL"
        );
        match conn.execute(&sql, params![closing_id, register_number]) {
            Ok(rows) => {
                if rows > 0 {
                    info!(table = *table, rows, closing_id = %closing_id, "Sweep stamped rows");
                }
                outcome.stamped += rows;
            }
            Err(e) => {
                warn!(table = *table, closing_id = %closing_id, "Sweep step failed: {e}");
                outcome.failed_tables.push((*table).to_string());
                outcome.errors.push(format!("{table}: {e}"));
            }
        }
    }

    outcome
}

// ---------------------------------------------------------------------------
// Supersede / read-back
// ---------------------------------------------------------------------------

/// Mark a closing superseded. The numeric snapshot is left untouched.
pub fn deactivate(db: &DbState, closing_id: &str) -> Result<(), CoreError> {
    let conn = db.lock()?;

    let updated = conn.execute(
        "UPDATE closings SET active = 0 WHERE id = ?1",
        params![closing_id],
    )?;
    if updated == 0 {
        return Err(CoreError::NotFound(format!("closing {closing_id}")));
    }

    info!(closing_id = %closing_id, "Closing marked inactive");
    Ok(())
}

/// Fetch one closing by id.
pub fn get(db: &DbState, closing_id: &str) -> Result<Closing, CoreError> {
    let conn = db.lock()?;
    conn.query_row(
        "SELECT id, user_id, assignment_id, register_number,
                initial_cash, house_advance, agent_advance, cash_sales,
                credit_payments, balance_sales, product_payments, expenses,
                agent_loans, total_cash, counted_cash, surplus_shortfall,
                at, active
         FROM closings WHERE id = ?1",
        params![closing_id],
        closing_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::NotFound(format!("closing {closing_id}")))
}

/// All closings for a user, newest first.
pub fn list_for_user(db: &DbState, user_id: &str) -> Result<Vec<Closing>, CoreError> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, assignment_id, register_number,
                initial_cash, house_advance, agent_advance, cash_sales,
                credit_payments, balance_sales, product_payments, expenses,
                agent_loans, total_cash, counted_cash, surplus_shortfall,
                at, active
         FROM closings WHERE user_id = ?1
         ORDER BY at DESC",
    )?;

    let rows = stmt.query_map(params![user_id], closing_from_row)?;

    let mut closings = Vec::new();
    for row in rows {
        match row {
            Ok(c) => closings.push(c),
            Err(e) => warn!("skipping malformed closing row: {e}"),
        }
    }
    Ok(closings)
}

fn closing_from_row(row: &rusqlite::Row) -> rusqlite::Result<Closing> {
    let at: String = row.get(16)?;
    Ok(Closing {
        id: row.get(0)?,
        user_id: row.get(1)?,
        assignment_id: row.get(2)?,
        register_number: row.get(3)?,
        figures: ClosingFigures {
            initial_cash: row.get(4)?,
            house_advance: row.get(5)?,
            agent_advance: row.get(6)?,
            cash_sales: row.get(7)?,
            credit_payments: row.get(8)?,
            balance_sales: row.get(9)?,
            product_payments: row.get(10)?,
            expenses: row.get(11)?,
            agent_loans: row.get(12)?,
            counted_cash: row.get(14)?,
            at: Some(at.clone()),
        },
        total_cash: row.get(13)?,
        surplus_shortfall: row.get(15)?,
        at,
        active: row.get::<_, i64>(17)? != 0,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignments::{self, OperationMode};
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        conn.execute_batch(
            "INSERT INTO users (id, username) VALUES ('u-ana', 'ana'), ('u-luis', 'luis');
             INSERT INTO shift_templates (id, name, start_time, end_time)
             VALUES ('s-morning', 'morning', '08:00', '16:00');",
        )
        .expect("fixture rows");
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    /// Active assignment on register 2 for ana.
    fn seed_operating_context(db: &DbState) {
        assignments::acquire_operation_slot(db, "u-ana", "s-morning", OperationMode::Counter)
            .unwrap();
        assignments::set_register_number(db, "u-ana", 2).unwrap();
    }

    fn reference_figures() -> ClosingFigures {
        ClosingFigures {
            initial_cash: 500.0,
            house_advance: 50.0,
            agent_advance: 0.0,
            cash_sales: 1200.0,
            credit_payments: 0.0,
            balance_sales: 300.0,
            product_payments: 100.0,
            expenses: 80.0,
            agent_loans: 0.0,
            counted_cash: 1870.0,
            at: None,
        }
    }

    #[test]
    fn test_reconciliation_formula() {
        let figures = reference_figures();
        assert_eq!(figures.total_cash(), 1870.0);
        assert_eq!(figures.surplus_shortfall(), 0.0);

        // A short till shows as negative
        let short = ClosingFigures {
            counted_cash: 1850.0,
            ..figures
        };
        assert_eq!(short.surplus_shortfall(), -20.0);
    }

    #[test]
    fn test_create_requires_operating_context() {
        let db = test_db();

        let err = create(&db, "u-ana", &reference_figures()).expect_err("no assignment");
        assert!(matches!(err, CoreError::NoActiveAssignment(_)));

        assignments::acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Counter)
            .unwrap();
        let err = create(&db, "u-ana", &reference_figures()).expect_err("no register yet");
        assert!(matches!(err, CoreError::NoRegisterAssigned(_)));
    }

    #[test]
    fn test_create_persists_snapshot_and_sweeps() {
        let db = test_db();
        seed_operating_context(&db);

        {
            let conn = db.conn.lock().unwrap();
            // Two pending rows on register 2, one on register 9
            conn.execute_batch(
                "INSERT INTO shift_expenses (id, user_id, amount, register_number, occurred_at)
                 VALUES ('e-1', 'u-ana', 25.0, 2, '2024-03-01T10:00:00+00:00'),
                        ('e-far', 'u-luis', 10.0, 9, '2024-03-01T10:00:00+00:00');
                 INSERT INTO bill_counts (id, user_id, denomination, quantity, total, register_number, occurred_at)
                 VALUES ('b-1', 'u-ana', 100, 5, 500.0, 2, '2024-03-01T17:00:00+00:00');",
            )
            .unwrap();
        }

        let receipt = create(&db, "u-ana", &reference_figures()).unwrap();
        assert_eq!(receipt.register_number, 2);
        assert_eq!(receipt.total_cash, 1870.0);
        assert_eq!(receipt.surplus_shortfall, 0.0);
        assert_eq!(receipt.sweep.stamped, 2);
        assert!(receipt.sweep.failed_tables.is_empty());

        let conn = db.conn.lock().unwrap();
        let stamped: Option<String> = conn
            .query_row(
                "SELECT closing_id FROM shift_expenses WHERE id = 'e-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stamped.as_deref(), Some(receipt.closing_id.as_str()));

        let far: Option<String> = conn
            .query_row(
                "SELECT closing_id FROM shift_expenses WHERE id = 'e-far'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(far.is_none(), "other register must not be swept");
    }

    #[test]
    fn test_sweep_is_idempotent_and_never_reassigns() {
        let db = test_db();
        seed_operating_context(&db);

        {
            let conn = db.conn.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO shift_expenses (id, user_id, amount, register_number, closing_id, occurred_at)
                 VALUES ('e-pending', 'u-ana', 5.0, 2, NULL, '2024-03-01T10:00:00+00:00')",
            )
            .unwrap();
        }

        let first = create(&db, "u-ana", &reference_figures()).unwrap();
        assert_eq!(first.sweep.stamped, 1);

        // Re-running the same sweep stamps nothing new and leaves the
        // existing stamp alone.
        let again = sweep_pending_records(&db, &first.closing_id, 2).unwrap();
        assert_eq!(again.stamped, 0);

        // A later sweep with a different closing id must not steal the row.
        let other = sweep_pending_records(&db, "c-other", 2).unwrap();
        assert_eq!(other.stamped, 0);

        let conn = db.conn.lock().unwrap();
        let stamped: String = conn
            .query_row(
                "SELECT closing_id FROM shift_expenses WHERE id = 'e-pending'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stamped, first.closing_id);
    }

    #[test]
    fn test_sweep_survives_a_broken_table() {
        let db = test_db();
        seed_operating_context(&db);

        {
            let conn = db.conn.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO shift_expenses (id, user_id, amount, register_number, occurred_at)
                 VALUES ('e-1', 'u-ana', 25.0, 2, '2024-03-01T10:00:00+00:00');
                 ALTER TABLE staff_loans RENAME TO staff_loans_gone;",
            )
            .unwrap();
        }

        // The closing itself must succeed, with the broken table reported
        // and the healthy tables still stamped.
        let receipt = create(&db, "u-ana", &reference_figures()).unwrap();
        assert_eq!(receipt.sweep.failed_tables, vec!["staff_loans"]);
        assert_eq!(receipt.sweep.errors.len(), 1);
        assert_eq!(receipt.sweep.stamped, 1);

        let conn = db.conn.lock().unwrap();
        let stamped: Option<String> = conn
            .query_row(
                "SELECT closing_id FROM shift_expenses WHERE id = 'e-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stamped.as_deref(), Some(receipt.closing_id.as_str()));
    }

    #[test]
    fn test_deactivate_keeps_numeric_fields() {
        let db = test_db();
        seed_operating_context(&db);

        let receipt = create(&db, "u-ana", &reference_figures()).unwrap();
        deactivate(&db, &receipt.closing_id).unwrap();

        let closing = get(&db, &receipt.closing_id).unwrap();
        assert!(!closing.active);
        assert_eq!(closing.total_cash, 1870.0);
        assert_eq!(closing.figures.counted_cash, 1870.0);

        assert!(matches!(
            deactivate(&db, "c-ghost"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_non_finite_figures_rejected() {
        let db = test_db();
        seed_operating_context(&db);

        let figures = ClosingFigures {
            cash_sales: f64::NAN,
            ..reference_figures()
        };
        assert!(matches!(
            create(&db, "u-ana", &figures),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_malformed_closing_time_rejected() {
        let db = test_db();
        seed_operating_context(&db);

        let figures = ClosingFigures {
            at: Some("yesterday evening".to_string()),
            ..reference_figures()
        };
        assert!(matches!(
            create(&db, "u-ana", &figures),
            Err(CoreError::Validation(_))
        ));
        assert!(list_for_user(&db, "u-ana").unwrap().is_empty(), "nothing persisted");
    }

    #[test]
    fn test_receipt_serializes_for_the_frontend() {
        let db = test_db();
        seed_operating_context(&db);

        let receipt = create(&db, "u-ana", &reference_figures()).unwrap();
        let json = serde_json::to_value(&receipt).unwrap();

        assert_eq!(json["register_number"], 2);
        assert_eq!(json["total_cash"], 1870.0);
        assert_eq!(json["surplus_shortfall"], 0.0);
        assert!(json["sweep"]["failed_tables"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_list_for_user_newest_first() {
        let db = test_db();
        seed_operating_context(&db);

        let early = ClosingFigures {
            at: Some("2024-03-01T12:00:00+00:00".to_string()),
            ..reference_figures()
        };
        let late = ClosingFigures {
            at: Some("2024-03-01T18:00:00+00:00".to_string()),
            ..reference_figures()
        };
        create(&db, "u-ana", &early).unwrap();
        let last = create(&db, "u-ana", &late).unwrap();

        let listed = list_for_user(&db, "u-ana").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, last.closing_id);
        assert!(list_for_user(&db, "u-luis").unwrap().is_empty());
    }
}
