use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::db::models::AlertCandidate;
use crate::db::Database;
use crate::notify::AlertSink;
use crate::windows::{Window, WINDOWS, WINDOW_COUNT};

/// Upper bound on candidates examined per tick.
const ALERT_CANDIDATE_CAP: i64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct AlertParams {
    pub min_liquidity_usd: f64,
    pub max_spread_pp: f64,
    pub cooldown_minutes: i64,
}

/// The window whose |delta| exceeds its threshold by the largest factor.
/// None when no window triggers.
pub fn best_triggered_window(
    deltas_pp: &[Option<f64>; WINDOW_COUNT],
) -> Option<(&'static Window, f64)> {
    let mut best: Option<(&'static Window, f64, f64)> = None;
    for (window, delta) in WINDOWS.iter().zip(deltas_pp.iter()) {
        let delta = match delta {
            Some(d) => *d,
            None => continue,
        };
        let score = delta.abs() / window.alert_threshold_pp;
        if score < 1.0 {
            continue;
        }
        if best.map(|(_, _, s)| score > s).unwrap_or(true) {
            best = Some((window, delta, score));
        }
    }
    best.map(|(w, d, _)| (w, d))
}

/// Dedup key: one alert per outcome, window, and move direction within the
/// cooldown.
pub fn alert_signature(candidate: &AlertCandidate, window: &Window, delta_pp: f64) -> String {
    let direction = if delta_pp >= 0.0 { "UP" } else { "DOWN" };
    format!(
        "{}:{}:{}:{}:{}",
        candidate.provider, candidate.market_id, candidate.outcome_id, window.name, direction
    )
}

/// Plain-text alert body.
pub fn format_alert(candidate: &AlertCandidate, window: &Window, delta_pp: f64) -> String {
    format!(
        "🚨 Opaque move detected\n\
         provider: {}\n\
         market: {}\n\
         outcome: {}\n\
         probability: {:.1}%\n\
         Δ{}: {:+.2} pp\n\
         label: {}\n\
         reasons: {}\n\
         tick: {}",
        candidate.provider,
        candidate.market_title,
        candidate.outcome_label,
        candidate.probability * 100.0,
        window.name,
        delta_pp,
        candidate.label.as_str(),
        candidate.reason_tags.join(", "),
        candidate.ts_minute.format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

/// Select, dedup, and dispatch alerts for the latest classification tick.
/// Alert state is only recorded after the transport accepts the message, so
/// a failed send retries on the next cycle. Returns messages sent.
pub async fn run_alerts(
    db: &Database,
    sink: &dyn AlertSink,
    params: &AlertParams,
    now: DateTime<Utc>,
) -> Result<usize> {
    if !sink.enabled() {
        return Ok(0);
    }
    let tick = match db.latest_classification_tick()? {
        Some(t) => t,
        None => return Ok(0),
    };
    let candidates = db.alert_candidates(
        tick,
        params.min_liquidity_usd,
        params.max_spread_pp,
        ALERT_CANDIDATE_CAP,
    )?;

    let cooldown = Duration::minutes(params.cooldown_minutes);
    let mut sent = 0usize;
    for candidate in &candidates {
        let (window, delta_pp) = match best_triggered_window(&candidate.deltas_pp) {
            Some(hit) => hit,
            None => continue,
        };
        let signature = alert_signature(candidate, window, delta_pp);
        if let Some(last) = db.alert_last_sent(&signature)? {
            if now - last < cooldown {
                continue;
            }
        }
        match sink.send(&format_alert(candidate, window, delta_pp)).await {
            Ok(()) => {
                db.record_alert_sent(&signature, now)?;
                sent += 1;
            }
            Err(e) => {
                // State stays unrecorded so the same signature retries next
                // cycle.
                warn!("alert send failed for {}: {:#}", signature, e);
            }
        }
    }
    if sent > 0 {
        info!("Dispatched {} alert(s) at {}", sent, tick);
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        ClassificationRow, DeltaRow, MoveLabel, OutcomeSnapshot,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingSink {
        sent: AtomicUsize,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink {
                sent: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, _text: &str) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("transport down");
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tick0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn params() -> AlertParams {
        AlertParams {
            min_liquidity_usd: 1_000.0,
            max_spread_pp: 10.0,
            cooldown_minutes: 30,
        }
    }

    fn deltas(entries: &[(usize, f64)]) -> [Option<f64>; WINDOW_COUNT] {
        let mut out = [None; WINDOW_COUNT];
        for (i, v) in entries {
            out[*i] = Some(*v);
        }
        out
    }

    fn seed_candidate(db: &Database, deltas_pp: [Option<f64>; WINDOW_COUNT]) {
        db.upsert_snapshot(&OutcomeSnapshot {
            ts_minute: tick0(),
            provider: "kalshi".into(),
            market_id: "MKT-1".into(),
            outcome_id: "yes".into(),
            outcome_label: "Yes".into(),
            probability: 0.62,
            spread_pp: Some(4.0),
            volume_24h_usd: Some(50_000.0),
            liquidity_usd: Some(9_000.0),
            market_title: "Will the nominee be confirmed?".into(),
            raw_category: None,
            normalized_category: "politics".into(),
            market_status: "active".into(),
            metadata: serde_json::json!({}),
        })
        .unwrap();
        db.upsert_delta(&DeltaRow {
            ts_minute: tick0(),
            provider: "kalshi".into(),
            market_id: "MKT-1".into(),
            outcome_id: "yes".into(),
            deltas_pp,
        })
        .unwrap();
        db.upsert_classification(&ClassificationRow {
            ts_minute: tick0(),
            provider: "kalshi".into(),
            market_id: "MKT-1".into(),
            outcome_id: "yes".into(),
            opaque_score: 70.0,
            exogenous_score: 10.0,
            label: MoveLabel::OpaqueInfoSensitive,
            reason_tags: vec!["opaque_info_prone_category".into()],
            model_version: "rules-1".into(),
        })
        .unwrap();
    }

    #[test]
    fn best_window_picks_highest_threshold_ratio() {
        // 1m:+7/6, 5m:+9/8, 30m:+20/14 → 30m wins.
        let d = deltas(&[(0, 7.0), (1, 9.0), (3, 20.0)]);
        let (window, delta) = best_triggered_window(&d).unwrap();
        assert_eq!(window.name, "30m");
        assert_eq!(delta, 20.0);
    }

    #[test]
    fn no_window_triggers_below_thresholds() {
        let d = deltas(&[(0, 5.9), (1, -7.9), (7, 37.9)]);
        assert!(best_triggered_window(&d).is_none());
    }

    #[test]
    fn direction_comes_from_delta_sign() {
        let candidate = AlertCandidate {
            ts_minute: tick0(),
            provider: "kalshi".into(),
            market_id: "M".into(),
            outcome_id: "yes".into(),
            market_title: "t".into(),
            outcome_label: "Yes".into(),
            probability: 0.5,
            deltas_pp: [None; WINDOW_COUNT],
            label: MoveLabel::OpaqueInfoSensitive,
            reason_tags: vec![],
        };
        let w = &WINDOWS[3];
        assert_eq!(alert_signature(&candidate, w, 20.0), "kalshi:M:yes:30m:UP");
        assert_eq!(alert_signature(&candidate, w, -20.0), "kalshi:M:yes:30m:DOWN");
    }

    #[tokio::test]
    async fn cooldown_suppresses_and_then_releases() {
        let db = Database::open_in_memory().unwrap();
        seed_candidate(&db, deltas(&[(3, 20.0)]));
        let sink = RecordingSink::new();

        // t0: sends.
        let sent = run_alerts(&db, &sink, &params(), tick0()).await.unwrap();
        assert_eq!(sent, 1);

        // t0 + 15m: same qualifying outcome, inside cooldown.
        let sent = run_alerts(&db, &sink, &params(), tick0() + Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(sent, 0);

        // t0 + 45m: cooldown expired, sends again.
        let sent = run_alerts(&db, &sink, &params(), tick0() + Duration::minutes(45))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(sink.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_send_leaves_state_unrecorded() {
        let db = Database::open_in_memory().unwrap();
        seed_candidate(&db, deltas(&[(3, 20.0)]));
        let sink = RecordingSink::new();
        sink.fail.store(true, Ordering::SeqCst);

        let sent = run_alerts(&db, &sink, &params(), tick0()).await.unwrap();
        assert_eq!(sent, 0);

        // Transport recovers; the same signature goes straight out even
        // though we are "inside" what would have been the cooldown.
        sink.fail.store(false, Ordering::SeqCst);
        let sent = run_alerts(&db, &sink, &params(), tick0() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn untriggered_candidate_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        seed_candidate(&db, deltas(&[(0, 2.0)]));
        let sink = RecordingSink::new();
        let sent = run_alerts(&db, &sink, &params(), tick0()).await.unwrap();
        assert_eq!(sent, 0);
    }

    #[test]
    fn alert_body_is_multiline_plain_text() {
        let candidate = AlertCandidate {
            ts_minute: tick0(),
            provider: "kalshi".into(),
            market_id: "M".into(),
            outcome_id: "yes".into(),
            market_title: "Will the nominee be confirmed?".into(),
            outcome_label: "Yes".into(),
            probability: 0.62,
            deltas_pp: [None; WINDOW_COUNT],
            label: MoveLabel::OpaqueInfoSensitive,
            reason_tags: vec!["tight_spread".into(), "meaningful_size_move".into()],
        };
        let body = format_alert(&candidate, &WINDOWS[3], 20.0);
        assert!(body.contains("provider: kalshi"));
        assert!(body.contains("Δ30m: +20.00 pp"));
        assert!(body.contains("probability: 62.0%"));
        assert!(body.contains("reasons: tight_spread, meaningful_size_move"));
        assert!(body.contains("tick: 2025-03-01T12:00:00Z"));
    }
}
