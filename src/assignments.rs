//! Shift assignment registry for the recargas counter core.
//!
//! Single source of truth for "who currently holds which exclusive
//! operational role." A register worker operates either as the carrier
//! *agent* or on the *counter*; each role is a system-wide slot that at most
//! one active assignment may hold at a time.
//!
//! Slot acquisition is a single conditional UPDATE guarded by a NOT EXISTS
//! subquery, so two racing callers cannot both claim the same mode.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Exclusive operational role an assignment can hold.
///
/// Stored as a single nullable column; an assignment holds one mode or none,
/// never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Agent,
    Counter,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::Agent => "agent",
            OperationMode::Counter => "counter",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current holder of an operation slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotHolder {
    pub assignment_id: String,
    pub user_id: String,
    pub username: String,
}

/// Snapshot of both slots, for "operation in use by X" UIs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveSlots {
    pub agent: Option<SlotHolder>,
    pub counter: Option<SlotHolder>,
}

// ---------------------------------------------------------------------------
// Slot acquisition / release
// ---------------------------------------------------------------------------

/// Acquire an exclusive operation slot for a user under a shift template.
///
/// Creates the assignment row (active, mode unset) if none exists for this
/// user+shift pair, then claims the mode with one conditional UPDATE. Fails
/// with `SlotInUse` naming the current holder when another active assignment
/// already holds the mode. Re-acquiring a mode the caller already holds is a
/// no-op success.
///
/// Returns the assignment id.
pub fn acquire_operation_slot(
    db: &DbState,
    user_id: &str,
    shift_id: &str,
    mode: OperationMode,
) -> Result<String, CoreError> {
    let conn = db.lock()?;

    ensure_user_exists(&conn, user_id)?;
    ensure_shift_exists(&conn, shift_id)?;

    let now = Utc::now().to_rfc3339();

    // All writes in one transaction so a refused claim mutates nothing,
    // not even the assignment row this call would have created.
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<String, CoreError> {
        let assignment_id = ensure_assignment(&conn, user_id, shift_id, &now)?;

        // Single-statement claim: the NOT EXISTS guard makes the check-and-set
        // atomic at the store, closing the read-then-write race of the legacy
        // two-round-trip version.
        let updated = conn.execute(
            "UPDATE shift_assignments SET operation_mode = ?1, updated_at = ?2
             WHERE id = ?3
               AND NOT EXISTS (
                   SELECT 1 FROM shift_assignments other
                   WHERE other.operation_mode = ?1
                     AND other.active = 1
                     AND other.id != ?3
               )",
            params![mode.as_str(), now, assignment_id],
        )?;

        if updated == 0 {
            return match find_holder(&conn, mode, Some(&assignment_id))? {
                Some(holder) => Err(CoreError::SlotInUse {
                    mode,
                    holder: holder.username,
                }),
                None => Err(CoreError::NotFound(format!("assignment {assignment_id}"))),
            };
        }

        Ok(assignment_id)
    })();

    let assignment_id = match result {
        Ok(id) => {
            conn.execute_batch("COMMIT")?;
            id
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(
        user_id = %user_id,
        shift_id = %shift_id,
        mode = %mode,
        assignment_id = %assignment_id,
        "Operation slot acquired"
    );

    Ok(assignment_id)
}

/// Release whatever slot the user's active assignment holds and end it.
///
/// Clears the mode, flips active off and stamps `real_end`. Idempotent:
/// calling it with no active assignment is a no-op.
pub fn release_operation_slot(db: &DbState, user_id: &str) -> Result<(), CoreError> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    let updated = conn.execute(
        "UPDATE shift_assignments SET
            operation_mode = NULL,
            active = 0,
            real_end = COALESCE(real_end, ?1),
            updated_at = ?1
         WHERE user_id = ?2 AND active = 1",
        params![now, user_id],
    )?;

    if updated > 0 {
        info!(user_id = %user_id, "Operation slot released");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Does the user hold an active assignment under a *different* shift template?
///
/// Used to block one worker from operating two shifts at once.
pub fn has_other_active_assignment(
    db: &DbState,
    user_id: &str,
    excluding_shift_id: &str,
) -> Result<bool, CoreError> {
    let conn = db.lock()?;
    let exists: i64 = conn.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM shift_assignments
            WHERE user_id = ?1 AND active = 1 AND shift_id != ?2
         )",
        params![user_id, excluding_shift_id],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Current holders of the agent and counter slots, if any.
pub fn query_active_slots(db: &DbState) -> Result<ActiveSlots, CoreError> {
    let conn = db.lock()?;
    Ok(ActiveSlots {
        agent: find_holder(&conn, OperationMode::Agent, None)?,
        counter: find_holder(&conn, OperationMode::Counter, None)?,
    })
}

/// Stamp the physical till number onto the user's active assignment.
///
/// The application decides which register a worker sits at; the closing
/// engine requires the number to be present before a closing can be created.
pub fn set_register_number(
    db: &DbState,
    user_id: &str,
    register_number: i64,
) -> Result<(), CoreError> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();

    let updated = conn.execute(
        "UPDATE shift_assignments SET register_number = ?1, updated_at = ?2
         WHERE user_id = ?3 AND active = 1",
        params![register_number, now, user_id],
    )?;

    if updated == 0 {
        return Err(CoreError::NoActiveAssignment(user_id.to_string()));
    }

    info!(user_id = %user_id, register = register_number, "Register number assigned");
    Ok(())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

pub(crate) fn ensure_user_exists(conn: &Connection, user_id: &str) -> Result<(), CoreError> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM users WHERE id = ?1)",
        params![user_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(CoreError::NotFound(format!("user {user_id}")));
    }
    Ok(())
}

pub(crate) fn ensure_shift_exists(conn: &Connection, shift_id: &str) -> Result<(), CoreError> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM shift_templates WHERE id = ?1)",
        params![shift_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(CoreError::NotFound(format!("shift {shift_id}")));
    }
    Ok(())
}

/// Find the user's active assignment for this shift, creating one if absent.
pub(crate) fn ensure_assignment(
    conn: &Connection,
    user_id: &str,
    shift_id: &str,
    now: &str,
) -> Result<String, CoreError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM shift_assignments
             WHERE user_id = ?1 AND shift_id = ?2 AND active = 1
             ORDER BY assigned_at DESC LIMIT 1",
            params![user_id, shift_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO shift_assignments (
            id, user_id, shift_id, assigned_at, active, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, 1, ?4, ?4)",
        params![assignment_id, user_id, shift_id, now],
    )?;

    info!(
        user_id = %user_id,
        shift_id = %shift_id,
        assignment_id = %assignment_id,
        "Assignment created"
    );

    Ok(assignment_id)
}

/// Current active holder of `mode`, excluding one assignment id if given.
fn find_holder(
    conn: &Connection,
    mode: OperationMode,
    excluding_assignment: Option<&str>,
) -> Result<Option<SlotHolder>, CoreError> {
    let holder = conn
        .query_row(
            "SELECT a.id, a.user_id, u.username
             FROM shift_assignments a
             JOIN users u ON u.id = a.user_id
             WHERE a.operation_mode = ?1
               AND a.active = 1
               AND a.id != COALESCE(?2, '')
             LIMIT 1",
            params![mode.as_str(), excluding_assignment],
            |row| {
                Ok(SlotHolder {
                    assignment_id: row.get(0)?,
                    user_id: row.get(1)?,
                    username: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(holder)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
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
             VALUES ('s-morning', 'morning', '08:00', '16:00'),
                    ('s-evening', 'evening', '14:00', '22:00');",
        )
        .expect("fixture rows");
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_acquire_creates_assignment_and_claims_mode() {
        let db = test_db();

        let aid = acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Agent).unwrap();

        let conn = db.conn.lock().unwrap();
        let (mode, active): (Option<String>, i64) = conn
            .query_row(
                "SELECT operation_mode, active FROM shift_assignments WHERE id = ?1",
                params![aid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(mode.as_deref(), Some("agent"));
        assert_eq!(active, 1);
    }

    #[test]
    fn test_second_caller_gets_slot_in_use_with_holder() {
        let db = test_db();

        acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Agent).unwrap();
        let err = acquire_operation_slot(&db, "u-luis", "s-morning", OperationMode::Agent)
            .expect_err("agent slot is taken");

        match err {
            CoreError::SlotInUse { mode, holder } => {
                assert_eq!(mode, OperationMode::Agent);
                assert_eq!(holder, "ana");
            }
            other => panic!("expected SlotInUse, got {other:?}"),
        }
    }

    #[test]
    fn test_modes_are_independent_slots() {
        let db = test_db();

        acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Agent).unwrap();
        // Counter is free even while agent is held
        acquire_operation_slot(&db, "u-luis", "s-morning", OperationMode::Counter).unwrap();

        let slots = query_active_slots(&db).unwrap();
        assert_eq!(slots.agent.as_ref().unwrap().username, "ana");
        assert_eq!(slots.counter.as_ref().unwrap().username, "luis");
    }

    #[test]
    fn test_reacquire_by_holder_is_noop_success() {
        let db = test_db();

        let first =
            acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Counter).unwrap();
        let second =
            acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Counter).unwrap();
        assert_eq!(first, second, "same assignment row is reused");
    }

    #[test]
    fn test_release_frees_slot_and_is_idempotent() {
        let db = test_db();

        acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Agent).unwrap();
        release_operation_slot(&db, "u-ana").unwrap();

        // Slot is free for the next worker
        acquire_operation_slot(&db, "u-luis", "s-morning", OperationMode::Agent).unwrap();

        // Releasing again (and releasing a user with no assignment) is fine
        release_operation_slot(&db, "u-ana").unwrap();

        let conn = db.conn.lock().unwrap();
        let (active, real_end): (i64, Option<String>) = conn
            .query_row(
                "SELECT active, real_end FROM shift_assignments WHERE user_id = 'u-ana'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(active, 0);
        assert!(real_end.is_some(), "release stamps real_end");
    }

    #[test]
    fn test_has_other_active_assignment() {
        let db = test_db();

        acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Agent).unwrap();

        assert!(!has_other_active_assignment(&db, "u-ana", "s-morning").unwrap());
        assert!(has_other_active_assignment(&db, "u-ana", "s-evening").unwrap());
        assert!(!has_other_active_assignment(&db, "u-luis", "s-morning").unwrap());
    }

    #[test]
    fn test_acquire_unknown_user_or_shift_fails_not_found() {
        let db = test_db();

        let err = acquire_operation_slot(&db, "u-ghost", "s-morning", OperationMode::Agent)
            .expect_err("unknown user");
        assert!(matches!(err, CoreError::NotFound(_)));

        let err = acquire_operation_slot(&db, "u-ana", "s-ghost", OperationMode::Agent)
            .expect_err("unknown shift");
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn test_set_register_number_requires_active_assignment() {
        let db = test_db();

        let err = set_register_number(&db, "u-ana", 3).expect_err("no assignment yet");
        assert!(matches!(err, CoreError::NoActiveAssignment(_)));

        acquire_operation_slot(&db, "u-ana", "s-morning", OperationMode::Counter).unwrap();
        set_register_number(&db, "u-ana", 3).unwrap();

        let conn = db.conn.lock().unwrap();
        let reg: i64 = conn
            .query_row(
                "SELECT register_number FROM shift_assignments WHERE user_id = 'u-ana' AND active = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(reg, 3);
    }
}
