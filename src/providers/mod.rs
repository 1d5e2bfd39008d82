pub mod kalshi;
pub mod opinion;
pub mod polymarket;

pub use kalshi::KalshiProvider;
pub use opinion::OpinionProvider;
pub use polymarket::PolymarketProvider;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::models::OutcomeSnapshot;

/// A prediction-market quote source. One implementation per provider; the
/// scheduler polls every enabled provider once per tick.
#[async_trait]
pub trait MarketProvider: Send + Sync {
    /// Short provider name used as the key in every stored row.
    fn name(&self) -> &'static str;

    /// False when required credentials or the feature flag are missing;
    /// disabled providers are skipped without error.
    fn enabled(&self) -> bool {
        true
    }

    /// Fetch the current quote for every open outcome, stamped with the
    /// given minute tick.
    async fn fetch_snapshots(&self, ts_minute: DateTime<Utc>) -> Result<Vec<OutcomeSnapshot>>;
}

/// Poll all enabled providers concurrently and merge their snapshots.
/// A failing provider logs a warning and contributes nothing; it must never
/// take the rest of the cycle down with it.
pub async fn fetch_all(
    providers: &[Arc<dyn MarketProvider>],
    ts_minute: DateTime<Utc>,
) -> Vec<OutcomeSnapshot> {
    let futures: Vec<_> = providers
        .iter()
        .filter(|p| p.enabled())
        .map(|p| {
            let p = Arc::clone(p);
            async move { (p.name(), p.fetch_snapshots(ts_minute).await) }
        })
        .collect();

    let results = futures_util::future::join_all(futures).await;

    let mut merged = Vec::new();
    for (name, result) in results {
        match result {
            Ok(snaps) => {
                info!("{}: {} outcome snapshot(s)", name, snaps.len());
                merged.extend(snaps);
            }
            Err(e) => warn!("Provider '{}' failed this tick: {:#}", name, e),
        }
    }
    merged
}

// ── Shared normalization ───────────────────────────────────────────────────────

/// Canonicalize a raw probability that may arrive as a fraction, a percent,
/// or price-in-cents: anything above 1 is treated as a percent, then the
/// result is clamped into [0, 1].
pub fn canonical_probability(raw: f64) -> f64 {
    let p = if raw > 1.0 { raw / 100.0 } else { raw };
    p.clamp(0.0, 1.0)
}

/// Percentage-point spread from best bid/ask expressed as fractions of 1.
/// None unless both sides are quoted.
pub fn spread_pp_from_quotes(bid: Option<f64>, ask: Option<f64>) -> Option<f64> {
    match (bid, ask) {
        (Some(b), Some(a)) => Some((a - b).abs() * 100.0),
        _ => None,
    }
}

/// Read a JSON number that providers may deliver as a number or a string.
pub fn json_f64(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Read a JSON field as a non-empty string.
pub fn json_str(value: &serde_json::Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

/// Map a provider's raw category (plus title keywords as a backstop) onto
/// the fixed category set used everywhere downstream. Word needles match by
/// token prefix so "eth" hits "ethereum" but not "whether".
pub fn normalize_category(raw: Option<&str>, title: &str) -> &'static str {
    let haystack = format!("{} {}", raw.unwrap_or(""), title).to_lowercase();
    let tokens: Vec<&str> = haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has = |needles: &[&str]| {
        needles.iter().any(|n| {
            if n.contains(' ') {
                haystack.contains(n)
            } else {
                tokens.iter().any(|t| t.starts_with(n))
            }
        })
    };
    if has(&["crypto", "bitcoin", "btc", "ethereum", "eth", "solana", "doge"]) {
        "crypto"
    } else if has(&["politic", "election", "president", "senate", "congress", "parliament"]) {
        "politics"
    } else if has(&["polic", "regulat", "law", "court", "tariff", "executive order"]) {
        "policy"
    } else if has(&["sport", "nfl", "nba", "mlb", "nhl", "soccer", "tennis", "ufc", "golf"]) {
        "sports"
    } else if has(&["macro", "econom", "inflation", "cpi", "fed", "gdp", "unemployment", "interest rate"]) {
        "macro"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_canonicalization() {
        assert_eq!(canonical_probability(0.62), 0.62);
        // Percent input collapses to a fraction.
        assert_eq!(canonical_probability(62.0), 0.62);
        // Clamping at both ends.
        assert_eq!(canonical_probability(150.0), 1.0);
        assert_eq!(canonical_probability(-0.2), 0.0);
    }

    #[test]
    fn spread_requires_both_sides() {
        assert_eq!(spread_pp_from_quotes(Some(0.60), Some(0.64)), Some(4.0));
        assert!((spread_pp_from_quotes(Some(0.64), Some(0.60)).unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(spread_pp_from_quotes(Some(0.60), None), None);
        assert_eq!(spread_pp_from_quotes(None, None), None);
    }

    #[test]
    fn numbers_as_strings_are_tolerated() {
        assert_eq!(json_f64(&serde_json::json!(0.5)), Some(0.5));
        assert_eq!(json_f64(&serde_json::json!("0.5")), Some(0.5));
        assert_eq!(json_f64(&serde_json::json!(" 12000 ")), Some(12000.0));
        assert_eq!(json_f64(&serde_json::json!(null)), None);
        assert_eq!(json_f64(&serde_json::json!("n/a")), None);
    }

    #[test]
    fn category_normalization() {
        assert_eq!(normalize_category(Some("Crypto"), "anything"), "crypto");
        assert_eq!(normalize_category(None, "Will Bitcoin close above $100k?"), "crypto");
        assert_eq!(normalize_category(Some("Politics"), ""), "politics");
        assert_eq!(normalize_category(None, "Fed interest rate decision in June"), "macro");
        assert_eq!(normalize_category(Some("Weather"), "Rain in NYC tomorrow?"), "other");
        // Embedded fragments never trigger a word needle.
        assert_eq!(normalize_category(None, "Whether it rains tomorrow"), "other");
    }
}
