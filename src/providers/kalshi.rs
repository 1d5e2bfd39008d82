use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::debug;

use super::{json_f64, json_str, normalize_category, MarketProvider};
use crate::db::models::OutcomeSnapshot;

/// Listing page size and a hard page cap so a misbehaving cursor cannot
/// spin the adapter forever.
const PAGE_LIMIT: usize = 1000;
const MAX_PAGES: usize = 20;

/// Titles shorter than this are never treated as combo leg lists.
const COMBO_TITLE_MIN_LEN: usize = 60;

/// Binary-quote provider in the Kalshi style: one listing request, yes/no
/// derived per market, combination markets folded into a legs list.
pub struct KalshiProvider {
    http: Client,
    base_url: String,
    enabled: bool,
}

impl KalshiProvider {
    pub fn new(base_url: &str, enabled: bool) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(KalshiProvider {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            enabled,
        })
    }
}

#[async_trait]
impl MarketProvider for KalshiProvider {
    fn name(&self) -> &'static str {
        "kalshi"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_snapshots(&self, ts_minute: DateTime<Utc>) -> Result<Vec<OutcomeSnapshot>> {
        let mut snapshots = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 0..MAX_PAGES {
            let mut url = format!(
                "{}/trade-api/v2/markets?status=open&limit={}",
                self.base_url, PAGE_LIMIT
            );
            if let Some(c) = &cursor {
                url.push_str("&cursor=");
                url.push_str(c);
            }
            debug!("kalshi page {}: {}", page, url);

            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .context("Kalshi listing request failed")?;
            if !resp.status().is_success() {
                anyhow::bail!("Kalshi listing error: {}", resp.status());
            }
            let raw: serde_json::Value =
                resp.json().await.context("Failed to parse Kalshi listing")?;

            let markets = match raw["markets"].as_array() {
                Some(a) => a,
                None => break,
            };
            for item in markets {
                snapshots.extend(parse_market(item, ts_minute));
            }

            cursor = raw["cursor"].as_str().filter(|c| !c.is_empty()).map(String::from);
            if cursor.is_none() || markets.len() < PAGE_LIMIT {
                break;
            }
        }

        Ok(snapshots)
    }
}

/// Project one listed market into yes/no outcome snapshots. Returns an
/// empty vector when the row is missing identity or any usable quote.
fn parse_market(item: &serde_json::Value, ts_minute: DateTime<Utc>) -> Vec<OutcomeSnapshot> {
    let ticker = match json_str(&item["ticker"]) {
        Some(t) => t.to_string(),
        None => return vec![],
    };
    let raw_title = json_str(&item["title"]).unwrap_or(&ticker).to_string();

    let (yes_prob, spread_pp) = derive_yes_quote(item);
    let yes_prob = match yes_prob {
        Some(p) => p,
        None => return vec![],
    };

    let raw_category = json_str(&item["category"]).map(String::from);
    let volume_24h = json_f64(&item["volume_24h"]);
    let liquidity = json_f64(&item["liquidity"]);

    let mut metadata = serde_json::Map::new();
    if let Some(event) = json_str(&item["event_ticker"]) {
        metadata.insert("event_ticker".into(), event.into());
    }

    // Combination markets: keep the legs structured and surface a short
    // display title instead of the full comma list.
    let title = match detect_combo_legs(&ticker, &raw_title, item) {
        Some(legs) => {
            let head = legs.first().cloned().unwrap_or_else(|| raw_title.clone());
            let summary = format!("{} (+{} legs)", head, legs.len().saturating_sub(1));
            metadata.insert("original_title".into(), raw_title.clone().into());
            metadata.insert(
                "legs".into(),
                serde_json::Value::Array(legs.into_iter().map(Into::into).collect()),
            );
            summary
        }
        None => raw_title,
    };

    let normalized_category = normalize_category(raw_category.as_deref(), &title);
    let status = json_str(&item["status"]).unwrap_or("open").to_string();
    let metadata = serde_json::Value::Object(metadata);

    let base = |outcome_id: &str, label: &str, probability: f64| OutcomeSnapshot {
        ts_minute,
        provider: "kalshi".into(),
        market_id: ticker.clone(),
        outcome_id: outcome_id.into(),
        outcome_label: label.into(),
        probability,
        spread_pp,
        volume_24h_usd: volume_24h,
        liquidity_usd: liquidity,
        market_title: title.clone(),
        raw_category: raw_category.clone(),
        normalized_category: normalized_category.into(),
        market_status: status.clone(),
        metadata: metadata.clone(),
    };

    vec![
        base("yes", "Yes", yes_prob),
        base("no", "No", 1.0 - yes_prob),
    ]
}

/// Yes-probability and spread from a binary quote. Prices arrive in cents.
/// Mid of bid/ask when both sides are real quotes; 0 and 100 are
/// absence-of-quote sentinels, in which case we fall back to last price and
/// report no spread.
fn derive_yes_quote(item: &serde_json::Value) -> (Option<f64>, Option<f64>) {
    let bid = json_f64(&item["yes_bid"]).filter(|b| *b > 0.0 && *b < 100.0);
    let ask = json_f64(&item["yes_ask"]).filter(|a| *a > 0.0 && *a < 100.0);
    match (bid, ask) {
        (Some(b), Some(a)) => (
            // Quotes are in cents; a 1¢ mid is a 0.01 probability, so divide
            // unconditionally instead of using the >1 percent heuristic.
            Some(((b + a) / 2.0 / 100.0).clamp(0.0, 1.0)),
            Some((a - b).abs()),
        ),
        _ => (
            json_f64(&item["last_price"])
                .map(|cents| (cents / 100.0).clamp(0.0, 1.0)),
            None,
        ),
    }
}

/// Combination-market heuristics: an explicit legs field, a multivariate
/// event ticker, or a long comma-delimited "yes …/no …" title.
fn detect_combo_legs(
    ticker: &str,
    title: &str,
    item: &serde_json::Value,
) -> Option<Vec<String>> {
    if let Some(legs) = item["selected_legs"].as_array() {
        let parsed: Vec<String> = legs
            .iter()
            .filter_map(|l| {
                json_str(l)
                    .map(String::from)
                    .or_else(|| json_str(&l["title"]).map(String::from))
            })
            .collect();
        if parsed.len() >= 2 {
            return Some(parsed);
        }
    }

    let looks_multivariate = ticker.starts_with("KXMVE") || ticker.contains("MVE-");
    if looks_multivariate || title.len() >= COMBO_TITLE_MIN_LEN {
        let legs: Vec<String> = title
            .split(',')
            .map(str::trim)
            .filter(|seg| {
                let lower = seg.to_lowercase();
                lower.starts_with("yes ") || lower.starts_with("no ")
            })
            .map(String::from)
            .collect();
        if legs.len() >= 2 {
            return Some(legs);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn mid_quote_with_spread() {
        let item = serde_json::json!({
            "ticker": "CPI-25MAR-T3.0",
            "title": "Will CPI come in above 3.0%?",
            "category": "Economics",
            "yes_bid": 58, "yes_ask": 62, "last_price": 55,
            "volume_24h": 120000, "liquidity": 40000,
            "event_ticker": "CPI-25MAR", "status": "open"
        });
        let snaps = parse_market(&item, ts());
        assert_eq!(snaps.len(), 2);
        let yes = &snaps[0];
        assert!((yes.probability - 0.60).abs() < 1e-9);
        assert_eq!(yes.spread_pp, Some(4.0));
        assert_eq!(yes.normalized_category, "macro");
        // Binary invariant: yes + no = 1.
        assert!((snaps[0].probability + snaps[1].probability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn boundary_quote_falls_back_to_last() {
        let item = serde_json::json!({
            "ticker": "X-1",
            "title": "Some market",
            "yes_bid": 0, "yes_ask": 100, "last_price": 37,
        });
        let snaps = parse_market(&item, ts());
        assert!((snaps[0].probability - 0.37).abs() < 1e-9);
        assert_eq!(snaps[0].spread_pp, None);
    }

    #[test]
    fn string_prices_are_tolerated() {
        let item = serde_json::json!({
            "ticker": "X-2",
            "title": "Another market",
            "yes_bid": "40", "yes_ask": "44", "last_price": "41",
        });
        let snaps = parse_market(&item, ts());
        assert!((snaps[0].probability - 0.42).abs() < 1e-9);
    }

    #[test]
    fn penny_market_mid_is_a_small_probability() {
        let item = serde_json::json!({
            "ticker": "X-6",
            "title": "Longshot market",
            "yes_bid": 1, "yes_ask": 1,
        });
        let snaps = parse_market(&item, ts());
        assert!((snaps[0].probability - 0.01).abs() < 1e-9);
        assert!((snaps[1].probability - 0.99).abs() < 1e-9);
    }

    #[test]
    fn no_quote_at_all_is_skipped() {
        let item = serde_json::json!({"ticker": "X-3", "title": "Quoteless"});
        assert!(parse_market(&item, ts()).is_empty());
    }

    #[test]
    fn combo_title_becomes_legs_with_summary() {
        let long_title = "yes Chiefs beat the Eagles, no Lakers cover the spread, yes BTC closes above $100k on Friday";
        let item = serde_json::json!({
            "ticker": "KXMVE-25MAR-ABC",
            "title": long_title,
            "last_price": 12,
        });
        let snaps = parse_market(&item, ts());
        assert_eq!(
            snaps[0].market_title,
            "yes Chiefs beat the Eagles (+2 legs)"
        );
        let legs = snaps[0].metadata["legs"].as_array().unwrap();
        assert_eq!(legs.len(), 3);
        assert_eq!(snaps[0].metadata["original_title"], long_title);
    }

    #[test]
    fn explicit_legs_field_wins() {
        let item = serde_json::json!({
            "ticker": "X-4",
            "title": "Parlay",
            "last_price": 20,
            "selected_legs": ["yes A wins", "no B wins"],
        });
        let snaps = parse_market(&item, ts());
        assert_eq!(snaps[0].market_title, "yes A wins (+1 legs)");
    }

    #[test]
    fn short_plain_title_is_not_a_combo() {
        let item = serde_json::json!({
            "ticker": "X-5",
            "title": "Will it rain, or snow?",
            "last_price": 50,
        });
        let snaps = parse_market(&item, ts());
        assert_eq!(snaps[0].market_title, "Will it rain, or snow?");
        assert!(snaps[0].metadata.get("legs").is_none());
    }
}
