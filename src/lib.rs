//! Shift lifecycle and closing reconciliation core for a retail/phone-credit
//! counter.
//!
//! Workers open a shift assignment, perform cash and balance transactions
//! against a register, and close out with a reconciliation that matches
//! physical cash counted against computed totals. This crate owns the parts
//! with real invariants:
//!
//! - [`assignments`] — who holds which exclusive operation slot (agent or
//!   counter), at most one active holder per slot system-wide.
//! - [`lifecycle`] — start/finalize/reset transitions plus the best-effort
//!   cascade that deactivates the finalizing user's same-day rows.
//! - [`closings`] — the immutable closing snapshot and the sweep that stamps
//!   pending satellite rows with the closing's id.
//! - [`balance_flows`] — batch recomputation of carrier balance flows from
//!   sale rows, with the carrier bonus rule.
//!
//! Entity CRUD, HTTP routing and permission checks live in the surrounding
//! application; the core receives already-validated user and shift ids and
//! talks only to the SQLite store in [`db`].

use std::path::Path;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod assignments;
pub mod balance_flows;
pub mod closings;
pub mod db;
pub mod error;
pub mod lifecycle;

pub use assignments::{ActiveSlots, OperationMode, SlotHolder};
pub use balance_flows::RecalcOutcome;
pub use closings::{Closing, ClosingFigures, ClosingReceipt, SweepOutcome};
pub use db::DbState;
pub use error::CoreError;
pub use lifecycle::{ActivityAction, CascadeOutcome, FinalizeReceipt};

/// Initialize logging: console layer plus a non-blocking daily rolling file
/// under `log_dir`. `RUST_LOG` overrides the default `info` filter.
///
/// Call once at application startup.
pub fn init_logging(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "recargas");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the app — dropping it flushes
    // logs. We leak it intentionally since the app runs until process exit.
    std::mem::forget(guard);

    info!("recargas core v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
