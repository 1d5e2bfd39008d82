use anyhow::Result;
use tracing::info;

use crate::db::models::DeltaRow;
use crate::db::Database;
use crate::windows::{WINDOWS, WINDOW_COUNT};

/// Round to two decimals, half away from zero.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Compute windowed deltas for every outcome present at the latest snapshot
/// tick. The reference for window w is the most recent snapshot at or
/// before `tick - w`; absent reference leaves the delta null. Returns the
/// number of delta rows written.
pub fn compute_deltas(db: &Database) -> Result<usize> {
    let tick = match db.latest_snapshot_tick()? {
        Some(t) => t,
        None => return Ok(0),
    };
    let snapshots = db.snapshots_at(tick)?;

    for (provider, market_id, outcome_id, prob_now) in &snapshots {
        let mut deltas_pp = [None; WINDOW_COUNT];
        for (i, window) in WINDOWS.iter().enumerate() {
            let reference = db.probability_at_or_before(
                provider,
                market_id,
                outcome_id,
                tick - window.duration(),
            )?;
            if let Some(prob_then) = reference {
                deltas_pp[i] = Some(round2((prob_now - prob_then) * 100.0));
            }
        }
        db.upsert_delta(&DeltaRow {
            ts_minute: tick,
            provider: provider.clone(),
            market_id: market_id.clone(),
            outcome_id: outcome_id.clone(),
            deltas_pp,
        })?;
    }

    info!("Computed deltas for {} outcome(s) at {}", snapshots.len(), tick);
    Ok(snapshots.len())
}
