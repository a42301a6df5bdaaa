//! Shift lifecycle state machine for the recargas counter core.
//!
//! Drives start/finalize/reset transitions for a shift template and its
//! per-user assignments: Unassigned -> Active -> Finished, with Reset back to
//! Unassigned. Every transition appends an activity_log row.
//!
//! Finalize triggers the cascading deactivation of the finalizing user's
//! same-day rows across the six row shapes. The cascade is best-effort
//! cleanup: each table is attempted independently and a failure on one never
//! aborts the finalize transition or the remaining tables.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::assignments::{self, OperationMode};
use crate::db::DbState;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle action tags recorded in the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Start,
    Finalize,
    Reset,
    Pause,
    Resume,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::Start => "start",
            ActivityAction::Finalize => "finalize",
            ActivityAction::Reset => "reset",
            ActivityAction::Pause => "pause",
            ActivityAction::Resume => "resume",
        }
    }
}

/// Aggregate result of the cascading deactivation.
///
/// Partial completion is an accepted, recoverable outcome; re-running the
/// cascade picks up whatever a failed table left behind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeOutcome {
    /// Total rows deactivated across all tables.
    pub deactivated: usize,
    /// Tables whose update failed (by name).
    pub failed_tables: Vec<String>,
    /// One message per failed table, with enough context to retry manually.
    pub errors: Vec<String>,
}

/// Returned by `finalize`: the transition itself plus the cascade report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    pub shift_id: String,
    pub user_id: String,
    pub finalized_at: String,
    pub cascade: CascadeOutcome,
}

/// The six row shapes touched by the cascade, with their date column.
const CASCADE_TARGETS: &[(&str, &str)] = &[
    ("closings", "at"),
    ("shift_expenses", "occurred_at"),
    ("balance_flows", "occurred_at"),
    ("balance_sales", "occurred_at"),
    ("bill_counts", "occurred_at"),
    ("staff_loans", "occurred_at"),
];

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Start a shift: stamp the real start time on the acting user's assignment
/// (creating it if absent), mark the template active, log `start`.
///
/// `requested_start` overrides the clock when a supervisor back-fills a late
/// opening; it must be RFC3339.
pub fn start(
    db: &DbState,
    shift_id: &str,
    acting_user_id: &str,
    requested_start: Option<&str>,
) -> Result<String, CoreError> {
    let conn = db.lock()?;

    assignments::ensure_shift_exists(&conn, shift_id)?;
    assignments::ensure_user_exists(&conn, acting_user_id)?;

    let now = Utc::now().to_rfc3339();
    let real_start = match requested_start {
        Some(ts) => {
            chrono::DateTime::parse_from_rfc3339(ts)
                .map_err(|e| CoreError::Validation(format!("bad start time {ts:?}: {e}")))?;
            ts.to_string()
        }
        None => now.clone(),
    };

    let assignment_id = assignments::ensure_assignment(&conn, acting_user_id, shift_id, &now)?;

    conn.execute(
        "UPDATE shift_assignments SET real_start = ?1, active = 1, updated_at = ?2
         WHERE id = ?3",
        params![real_start, now, assignment_id],
    )?;
    conn.execute(
        "UPDATE shift_templates SET active = 1, updated_at = ?1 WHERE id = ?2",
        params![now, shift_id],
    )?;

    log_activity(
        &conn,
        shift_id,
        acting_user_id,
        ActivityAction::Start,
        &format!("shift started at {real_start}"),
        &now,
    )?;

    info!(shift_id = %shift_id, user_id = %acting_user_id, "Shift started");

    Ok(assignment_id)
}

/// Start a shift as a register worker, optionally claiming an exclusive
/// operation slot first.
///
/// The slot acquisition (and the double-assignment check) happens BEFORE any
/// state mutation, so a `SlotInUse` refusal leaves nothing to undo.
pub fn start_as_worker(
    db: &DbState,
    shift_id: &str,
    user_id: &str,
    mode: Option<OperationMode>,
) -> Result<String, CoreError> {
    if assignments::has_other_active_assignment(db, user_id, shift_id)? {
        return Err(CoreError::Validation(format!(
            "user {user_id} already has an active assignment under another shift"
        )));
    }

    if let Some(mode) = mode {
        assignments::acquire_operation_slot(db, user_id, shift_id, mode)?;
    }

    start(db, shift_id, user_id, None)
}

/// Finalize a shift: stamp the real end time, deactivate the assignment and
/// template, clear the operation mode, log `finalize`, then run the cascade.
///
/// The finalize transition is the authoritative event; cascade failures are
/// logged and reported in the receipt but never abort it.
pub fn finalize(
    db: &DbState,
    shift_id: &str,
    acting_user_id: &str,
) -> Result<FinalizeReceipt, CoreError> {
    let conn = db.lock()?;

    assignments::ensure_shift_exists(&conn, shift_id)?;
    assignments::ensure_user_exists(&conn, acting_user_id)?;

    let now = Utc::now().to_rfc3339();

    conn.execute(
        "UPDATE shift_assignments SET
            real_end = ?1,
            active = 0,
            operation_mode = NULL,
            updated_at = ?1
         WHERE shift_id = ?2 AND user_id = ?3 AND active = 1",
        params![now, shift_id, acting_user_id],
    )?;
    conn.execute(
        "UPDATE shift_templates SET active = 0, updated_at = ?1 WHERE id = ?2",
        params![now, shift_id],
    )?;

    log_activity(
        &conn,
        shift_id,
        acting_user_id,
        ActivityAction::Finalize,
        &format!("shift finalized at {now}"),
        &now,
    )?;

    info!(shift_id = %shift_id, user_id = %acting_user_id, "Shift finalized");

    let cascade = cascade_deactivate_with_conn(&conn, acting_user_id, &now);
    if !cascade.failed_tables.is_empty() {
        warn!(
            shift_id = %shift_id,
            user_id = %acting_user_id,
            failed_tables = ?cascade.failed_tables,
            "Cascade completed partially; finalize stands"
        );
    }

    Ok(FinalizeReceipt {
        shift_id: shift_id.to_string(),
        user_id: acting_user_id.to_string(),
        finalized_at: now,
        cascade,
    })
}

/// Reset a shift back to Unassigned: clear both real timestamps, force the
/// assignment and template inactive, log `reset`.
///
/// Recovery path for an erroneous start; no cascade runs.
pub fn reset(db: &DbState, shift_id: &str, acting_user_id: &str) -> Result<(), CoreError> {
    let conn = db.lock()?;

    assignments::ensure_shift_exists(&conn, shift_id)?;
    assignments::ensure_user_exists(&conn, acting_user_id)?;

    let now = Utc::now().to_rfc3339();

    conn.execute(
        "UPDATE shift_assignments SET
            real_start = NULL,
            real_end = NULL,
            active = 0,
            operation_mode = NULL,
            updated_at = ?1
         WHERE shift_id = ?2 AND user_id = ?3",
        params![now, shift_id, acting_user_id],
    )?;
    conn.execute(
        "UPDATE shift_templates SET active = 0, updated_at = ?1 WHERE id = ?2",
        params![now, shift_id],
    )?;

    log_activity(
        &conn,
        shift_id,
        acting_user_id,
        ActivityAction::Reset,
        "shift reset to unassigned",
        &now,
    )?;

    info!(shift_id = %shift_id, user_id = %acting_user_id, "Shift reset");
    Ok(())
}

/// Record a break start. Log-only: the assignment stays active.
pub fn pause(
    db: &DbState,
    shift_id: &str,
    acting_user_id: &str,
    note: Option<&str>,
) -> Result<(), CoreError> {
    log_only_transition(db, shift_id, acting_user_id, ActivityAction::Pause, note)
}

/// Record a return from break. Log-only counterpart of [`pause`].
pub fn resume(
    db: &DbState,
    shift_id: &str,
    acting_user_id: &str,
    note: Option<&str>,
) -> Result<(), CoreError> {
    log_only_transition(db, shift_id, acting_user_id, ActivityAction::Resume, note)
}

fn log_only_transition(
    db: &DbState,
    shift_id: &str,
    acting_user_id: &str,
    action: ActivityAction,
    note: Option<&str>,
) -> Result<(), CoreError> {
    let conn = db.lock()?;

    assignments::ensure_shift_exists(&conn, shift_id)?;
    assignments::ensure_user_exists(&conn, acting_user_id)?;

    let now = Utc::now().to_rfc3339();
    log_activity(
        &conn,
        shift_id,
        acting_user_id,
        action,
        note.unwrap_or(""),
        &now,
    )?;

    info!(shift_id = %shift_id, user_id = %acting_user_id, action = action.as_str(), "Logged");
    Ok(())
}

// ---------------------------------------------------------------------------
// Cascading deactivation
// ---------------------------------------------------------------------------

/// Deactivate the user's active rows dated within `reference_ts`'s calendar
/// day, across closings and the five satellite tables.
///
/// Idempotent (updates are conditioned on `active = 1`); safe to re-invoke
/// to pick up stragglers after a partial run.
pub fn cascade_deactivate(
    db: &DbState,
    user_id: &str,
    reference_ts: &str,
) -> Result<CascadeOutcome, CoreError> {
    let conn = db.lock()?;
    Ok(cascade_deactivate_with_conn(&conn, user_id, reference_ts))
}

fn cascade_deactivate_with_conn(
    conn: &Connection,
    user_id: &str,
    reference_ts: &str,
) -> CascadeOutcome {
    let (day_start, day_end) = day_bounds(reference_ts);
    let mut outcome = CascadeOutcome::default();

    for (table, date_col) in CASCADE_TARGETS {
        // Per-table error boundary: one broken table must not block the rest.
        let sql = format!(
            "UPDATE {table} SET active = 0
             WHERE user_id = ?1 AND active = 1
               AND {date_col} >= ?2 AND {date_col} <= ?3"
        );
        match conn.execute(&sql, params![user_id, day_start, day_end]) {
            Ok(rows) => {
                if rows > 0 {
                    info!(table = *table, rows, user_id = %user_id, "Cascade deactivated rows");
                }
                outcome.deactivated += rows;
            }
            Err(e) => {
                warn!(table = *table, user_id = %user_id, "Cascade step failed: {e}");
                outcome.failed_tables.push((*table).to_string());
                outcome.errors.push(format!("{table}: {e}"));
            }
        }
    }

    outcome
}

/// Local midnight-to-midnight window for the timestamp's calendar day,
/// expressed as comparable RFC3339-ordered bounds (the stored timestamps and
/// the bounds share the `YYYY-MM-DDTHH:MM:SS` prefix shape).
fn day_bounds(ts: &str) -> (String, String) {
    match ts.get(..10) {
        Some(date) => (format!("{date}T00:00:00"), format!("{date}T23:59:59")),
        None => (ts.to_string(), ts.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

/// Append an activity_log row. The log is append-only; nothing in the core
/// ever updates or deletes entries.
fn log_activity(
    conn: &Connection,
    shift_id: &str,
    user_id: &str,
    action: ActivityAction,
    description: &str,
    at: &str,
) -> Result<(), CoreError> {
    conn.execute(
        "INSERT INTO activity_log (id, shift_id, user_id, action, at, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            shift_id,
            user_id,
            action.as_str(),
            at,
            description,
        ],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
