//! Error types for the shift lifecycle and reconciliation core.
//!
//! Lifecycle and closing-creation calls surface these synchronously. The
//! batch operations (cascade, sweep, recalculation) never return per-item
//! errors through this type — they log and aggregate counts in their
//! outcome structs instead.

use thiserror::Error;

use crate::assignments::OperationMode;

/// Core errors surfaced to the caller.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Shift, user, assignment or flow does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input (bad time window, missing numeric field, ...).
    #[error("validation: {0}")]
    Validation(String),

    /// The requested exclusive operation slot is already held.
    /// Carries the holder's username for the user-facing message.
    #[error("{mode} operation already in use by {holder}")]
    SlotInUse { mode: OperationMode, holder: String },

    /// Closing attempted without an active assignment.
    #[error("no active shift assignment for user {0}")]
    NoActiveAssignment(String),

    /// Closing attempted before the application assigned a register number.
    #[error("no register number assigned to the active assignment of user {0}")]
    NoRegisterAssigned(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,
}

impl CoreError {
    /// True for errors a client can fix by changing its request
    /// (as opposed to store-level failures).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, CoreError::Db(_) | CoreError::LockPoisoned)
    }
}
