pub mod alerts;
pub mod classify;
pub mod deltas;

pub use alerts::AlertParams;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::notify::AlertSink;
use crate::profiler::{run_profiler, ModelHandle, RULES_MODEL_VERSION};
use crate::providers::{self, MarketProvider};
use crate::signals::SpotSignals;
use crate::windows::truncate_minute;

/// One run of every stage in order: ingest, store, profile, deltas, spot
/// signals, classify, alert, prune.
pub struct Pipeline {
    db: Database,
    providers: Vec<Arc<dyn MarketProvider>>,
    model: ModelHandle,
    signals: SpotSignals,
    sink: Arc<dyn AlertSink>,
    alert_params: AlertParams,
    profile_batch_size: i64,
    retention: chrono::Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleSummary {
    pub tick: DateTime<Utc>,
    pub snapshots: usize,
    pub stored: usize,
    pub profiled: usize,
    pub delta_rows: usize,
    pub classified: usize,
    pub alerts_sent: usize,
    pub pruned: usize,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        providers: Vec<Arc<dyn MarketProvider>>,
        model: ModelHandle,
        signals: SpotSignals,
        sink: Arc<dyn AlertSink>,
        alert_params: AlertParams,
        profile_batch_size: i64,
        retention_hours: i64,
    ) -> Self {
        Pipeline {
            db,
            providers,
            model,
            signals,
            sink,
            alert_params,
            profile_batch_size,
            retention: chrono::Duration::hours(retention_hours),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let tick = truncate_minute(Utc::now());

        let snapshots = providers::fetch_all(&self.providers, tick).await;
        let mut stored = 0usize;
        let mut store_failures = 0usize;
        for snap in &snapshots {
            match self.db.upsert_snapshot(snap) {
                Ok(()) => stored += 1,
                Err(e) => {
                    store_failures += 1;
                    warn!(
                        "snapshot upsert failed for {}:{}:{}: {:#}",
                        snap.provider, snap.market_id, snap.outcome_id, e
                    );
                }
            }
        }
        if !snapshots.is_empty() && stored == 0 {
            anyhow::bail!("all {} snapshot upserts failed", store_failures);
        }

        let model = self.model.current().await;
        let model_version = model
            .as_ref()
            .map(|m| m.model_version.clone())
            .unwrap_or_else(|| RULES_MODEL_VERSION.to_string());
        let profiled = run_profiler(&self.db, model.as_deref(), self.profile_batch_size)?;

        let delta_rows = deltas::compute_deltas(&self.db)?;
        let spot = self.signals.refresh().await;
        let classified = classify::run_classifier(&self.db, spot, &model_version)?;
        let alerts_sent = alerts::run_alerts(
            &self.db,
            self.sink.as_ref(),
            &self.alert_params,
            Utc::now(),
        )
        .await?;
        let pruned = self.db.prune_history(tick - self.retention)?;

        Ok(CycleSummary {
            tick,
            snapshots: snapshots.len(),
            stored,
            profiled,
            delta_rows,
            classified,
            alerts_sent,
            pruned,
        })
    }
}

/// Drive the pipeline on a fixed interval. One cycle at a time: when the
/// timer fires while a cycle is still running, the tick is dropped and
/// logged — no queueing. The first tick fires immediately on startup.
pub fn spawn_scheduler(
    pipeline: Arc<Pipeline>,
    interval: std::time::Duration,
    cycle_active: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if cycle_active.swap(true, Ordering::SeqCst) {
                warn!("previous cycle still running, skipping this tick");
                continue;
            }
            let pipeline = Arc::clone(&pipeline);
            let active = Arc::clone(&cycle_active);
            tokio::spawn(async move {
                match pipeline.run_cycle().await {
                    Ok(summary) => info!(
                        "cycle {} done: {} snapshots ({} stored), {} profiled, {} deltas, {} classified, {} alerts, {} pruned",
                        summary.tick,
                        summary.snapshots,
                        summary.stored,
                        summary.profiled,
                        summary.delta_rows,
                        summary.classified,
                        summary.alerts_sent,
                        summary.pruned,
                    ),
                    Err(e) => error!("cycle failed: {:#}", e),
                }
                active.store(false, Ordering::SeqCst);
            });
        }
    })
}
