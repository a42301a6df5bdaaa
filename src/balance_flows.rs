//! Carrier balance-flow recalculation for the recargas counter core.
//!
//! A balance flow tracks one carrier's credit balance on one register:
//! initial balance, amount purchased from the carrier, total sold to
//! customers, and the resulting final balance. Sales accumulate as
//! individual `balance_sales` rows; `recompute_all` re-derives the sold and
//! final figures from them so the flow rows never drift from the sale rows.
//!
//! Stateless batch, one pure function per row. Per-row failures are logged
//! and counted, never fatal.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::CoreError;

/// Multiplier applied to the purchased amount for Tigo flows (5.5% bonus
/// credit the carrier grants on top of each purchase).
pub const TIGO_BONUS_RATE: f64 = 1.055;

/// Flows whose name contains this (case-insensitive) are skipped by the
/// recalculation. Deliberate hard-coded exclusion carried over from the
/// existing books; do not generalize without confirming intent.
const EXCLUDED_FLOW_NAME: &str = "flujo claro";

/// Aggregate result of a recalculation batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecalcOutcome {
    pub updated_count: usize,
    pub error_count: usize,
}

/// Recompute sold/final balance on every active flow (minus the excluded
/// names) from its active sale rows.
///
/// `sold_total = SUM(amount)` over active sales referencing the flow;
/// `final = initial + adjusted_purchased - sold_total`, where the purchased
/// term gets the Tigo bonus when the flow's carrier name contains "tigo".
pub fn recompute_all(db: &DbState) -> Result<RecalcOutcome, CoreError> {
    let conn = db.lock()?;

    let mut stmt = conn.prepare(
        "SELECT f.id, f.name, f.initial_balance, f.purchased_amount, c.name
         FROM balance_flows f
         LEFT JOIN carriers c ON c.id = f.carrier_id
         WHERE f.active = 1",
    )?;

    let mut outcome = RecalcOutcome::default();

    let mut flows: Vec<(String, String, f64, f64, Option<String>)> = Vec::new();
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    })?;
    for row in rows {
        match row {
            Ok(flow) => flows.push(flow),
            Err(e) => {
                warn!("Skipping undecodable flow row: {e}");
                outcome.error_count += 1;
            }
        }
    }
    drop(stmt);

    for (flow_id, name, initial, purchased, carrier_name) in &flows {
        if name.to_lowercase().contains(EXCLUDED_FLOW_NAME) {
            continue;
        }

        let result = (|| -> Result<(f64, f64), rusqlite::Error> {
            let sold_total: f64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM balance_sales
                 WHERE flow_id = ?1 AND active = 1",
                params![flow_id],
                |row| row.get(0),
            )?;

            let adjusted_purchased = match carrier_name {
                Some(c) if c.to_lowercase().contains("tigo") => purchased * TIGO_BONUS_RATE,
                _ => *purchased,
            };
            let new_final = initial + adjusted_purchased - sold_total;

            conn.execute(
                "UPDATE balance_flows SET
                    sold_total = ?1,
                    final_balance = ?2,
                    updated_at = datetime('now')
                 WHERE id = ?3",
                params![sold_total, new_final, flow_id],
            )?;

            Ok((sold_total, new_final))
        })();

        match result {
            Ok((sold_total, new_final)) => {
                info!(
                    flow_id = %flow_id,
                    sold_total = %sold_total,
                    final_balance = %new_final,
                    "Flow recalculated"
                );
                outcome.updated_count += 1;
            }
            Err(e) => {
                warn!(flow_id = %flow_id, flow_name = %name, "Flow recalculation failed: {e}");
                outcome.error_count += 1;
            }
        }
    }

    info!(
        updated = outcome.updated_count,
        errors = outcome.error_count,
        "Balance flow recalculation finished"
    );

    Ok(outcome)
}

/// Sum of `sold_total` across active flows, optionally filtered by register.
///
/// Feeds the balance-sales line of the closing aggregation.
pub fn sum_sold_for_active(db: &DbState, register_number: Option<i64>) -> Result<f64, CoreError> {
    let conn = db.lock()?;
    let sum: f64 = conn.query_row(
        "SELECT COALESCE(SUM(sold_total), 0) FROM balance_flows
         WHERE active = 1 AND (?1 IS NULL OR register_number = ?1)",
        params![register_number],
        |row| row.get(0),
    )?;
    Ok(sum)
}

/// Final balance of the most recently deactivated flow for a carrier and
/// register, used to pre-seed the next flow's initial balance.
pub fn last_inactive_final_balance(
    db: &DbState,
    carrier_id: &str,
    register_number: i64,
) -> Result<Option<f64>, CoreError> {
    let conn = db.lock()?;
    let balance = conn
        .query_row(
            "SELECT final_balance FROM balance_flows
             WHERE carrier_id = ?1 AND register_number = ?2 AND active = 0
             ORDER BY occurred_at DESC LIMIT 1",
            params![carrier_id, register_number],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance)
}

// ===========================================================================
// Tests
// ===========================================================================
