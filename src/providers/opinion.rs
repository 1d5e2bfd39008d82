use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    canonical_probability, json_f64, json_str, normalize_category, spread_pp_from_quotes,
    MarketProvider,
};
use crate::db::models::OutcomeSnapshot;

/// The documented limit is ~14 requests/second; request starts are held at
/// least this far apart to stay strictly under it.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(72);

const PAGE_SIZE: usize = 50;
const MAX_PAGES: usize = 40;
const MAX_RATE_LIMIT_RETRIES: u32 = 4;

/// Rate-limited REST provider in the Opinion style: paginated listing, a
/// process-scoped pacer advancing a next-allowed-start instant on every
/// request, exponential backoff on 429.
pub struct OpinionProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    feature_enabled: bool,
    next_allowed: Mutex<Instant>,
}

impl OpinionProvider {
    pub fn new(base_url: &str, api_key: Option<String>, feature_enabled: bool) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(OpinionProvider {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            feature_enabled,
            next_allowed: Mutex::new(Instant::now()),
        })
    }

    /// Hold until this request's start slot, then advance the slot. The
    /// mutex is dropped before sleeping so queued requests book consecutive
    /// slots instead of serializing on the lock.
    async fn pace(&self) {
        let wait = {
            let mut next = self.next_allowed.lock().await;
            let now = Instant::now();
            if *next <= now {
                *next = now + MIN_REQUEST_INTERVAL;
                Duration::ZERO
            } else {
                let wait = *next - now;
                *next += MIN_REQUEST_INTERVAL;
                wait
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn paced_get(&self, url: &str) -> Result<serde_json::Value> {
        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            self.pace().await;
            let mut req = self.http.get(url);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            let resp = req.send().await.context("Opinion request failed")?;

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    anyhow::bail!("Opinion rate limit persisted after {} retries", attempt);
                }
                let delay = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| rate_limit_backoff(attempt));
                warn!("Opinion 429, backing off {:?} (attempt {})", delay, attempt + 1);
                tokio::time::sleep(delay).await;
                continue;
            }
            if !resp.status().is_success() {
                anyhow::bail!("Opinion error: {}", resp.status());
            }
            return resp.json().await.context("Opinion response parse failed");
        }
        unreachable!("retry loop always returns or bails")
    }

    async fn fetch_outcome_depth(&self, market_id: &str, outcome_id: &str) -> Result<DepthQuote> {
        let url = format!(
            "{}/api/v1/markets/{}/orderbook?outcome_id={}",
            self.base_url, market_id, outcome_id
        );
        let raw = self.paced_get(&url).await?;
        Ok(parse_depth(&raw))
    }
}

#[derive(Debug, Default)]
struct DepthQuote {
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    depth_usd: Option<f64>,
}

#[async_trait]
impl MarketProvider for OpinionProvider {
    fn name(&self) -> &'static str {
        "opinion"
    }

    fn enabled(&self) -> bool {
        self.feature_enabled && self.api_key.is_some()
    }

    async fn fetch_snapshots(&self, ts_minute: DateTime<Utc>) -> Result<Vec<OutcomeSnapshot>> {
        let mut snapshots = Vec::new();

        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}/api/v1/markets?status=open&page={}&page_size={}",
                self.base_url, page, PAGE_SIZE
            );
            debug!("opinion page {}", page);
            let raw = self.paced_get(&url).await?;
            let items = raw["markets"]
                .as_array()
                .or_else(|| raw["data"].as_array())
                .cloned()
                .unwrap_or_default();
            if items.is_empty() {
                break;
            }

            for item in &items {
                if let Err(e) = self.collect_market(item, ts_minute, &mut snapshots).await {
                    warn!("opinion market skipped: {:#}", e);
                }
            }

            if items.len() < PAGE_SIZE {
                break;
            }
        }

        Ok(snapshots)
    }
}

impl OpinionProvider {
    async fn collect_market(
        &self,
        item: &serde_json::Value,
        ts_minute: DateTime<Utc>,
        out: &mut Vec<OutcomeSnapshot>,
    ) -> Result<()> {
        let market_id = json_str(&item["market_id"])
            .or_else(|| json_str(&item["id"]))
            .context("market without id")?
            .to_string();
        let title = json_str(&item["title"]).unwrap_or(&market_id).to_string();
        let raw_category = json_str(&item["category"]).map(String::from);
        let normalized_category = normalize_category(raw_category.as_deref(), &title);
        let status = json_str(&item["status"]).unwrap_or("open").to_string();
        let volume_24h_usd = json_f64(&item["volume_24h_usd"]).or_else(|| json_f64(&item["volume24h"]));
        let market_liquidity = json_f64(&item["liquidity"]);

        let base = |outcome_id: String,
                    label: String,
                    probability: f64,
                    spread_pp: Option<f64>,
                    liquidity: Option<f64>| OutcomeSnapshot {
            ts_minute,
            provider: "opinion".into(),
            market_id: market_id.clone(),
            outcome_id,
            outcome_label: label,
            probability,
            spread_pp,
            volume_24h_usd,
            liquidity_usd: liquidity.or(market_liquidity),
            market_title: title.clone(),
            raw_category: raw_category.clone(),
            normalized_category: normalized_category.into(),
            market_status: status.clone(),
            metadata: serde_json::json!({}),
        };

        let outcomes = item["outcomes"].as_array().cloned().unwrap_or_default();
        if outcomes.len() > 2 {
            // Multi-outcome market: per-outcome order depth.
            for outcome in &outcomes {
                let outcome_id = match json_str(&outcome["outcome_id"])
                    .or_else(|| json_str(&outcome["id"]))
                {
                    Some(id) => id.to_string(),
                    None => continue,
                };
                let label = json_str(&outcome["label"])
                    .or_else(|| json_str(&outcome["name"]))
                    .unwrap_or(&outcome_id)
                    .to_string();
                let listed = json_f64(&outcome["price"]).or_else(|| json_f64(&outcome["probability"]));

                let depth = match self.fetch_outcome_depth(&market_id, &outcome_id).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("depth fetch failed for {}/{}: {:#}", market_id, outcome_id, e);
                        DepthQuote::default()
                    }
                };
                let probability = match (depth.best_bid, depth.best_ask) {
                    (Some(b), Some(a)) => canonical_probability((b + a) / 2.0),
                    _ => match listed {
                        Some(p) => canonical_probability(p),
                        None => continue,
                    },
                };
                out.push(base(
                    outcome_id,
                    label,
                    probability,
                    spread_pp_from_quotes(depth.best_bid, depth.best_ask),
                    depth.depth_usd,
                ));
            }
            return Ok(());
        }

        // Binary market: the listing's yes price is authoritative, no is its
        // complement.
        let yes = outcomes
            .iter()
            .find(|o| {
                json_str(&o["label"])
                    .map(|l| l.eq_ignore_ascii_case("yes"))
                    .unwrap_or(false)
            })
            .and_then(|o| json_f64(&o["price"]))
            .or_else(|| json_f64(&item["yes_price"]));
        let yes = match yes {
            Some(p) => canonical_probability(p),
            None => anyhow::bail!("binary market {} without yes price", market_id),
        };
        out.push(base("yes".into(), "Yes".into(), yes, None, None));
        out.push(base("no".into(), "No".into(), 1.0 - yes, None, None));
        Ok(())
    }
}

fn rate_limit_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt))
}

fn parse_depth(raw: &serde_json::Value) -> DepthQuote {
    let best = |key: &str, pick_max: bool| -> Option<f64> {
        raw[key].as_array().and_then(|levels| {
            levels
                .iter()
                .filter_map(|l| json_f64(&l["price"]))
                .fold(None, |acc: Option<f64>, p| {
                    Some(acc.map_or(p, |a| if pick_max { a.max(p) } else { a.min(p) }))
                })
        })
    };
    let depth = ["bids", "asks"]
        .iter()
        .flat_map(|key| raw[*key].as_array().into_iter().flatten())
        .filter_map(|l| Some(json_f64(&l["price"])? * json_f64(&l["size"])?))
        .sum::<f64>();
    DepthQuote {
        best_bid: best("bids", true),
        best_ask: best("asks", false),
        depth_usd: (depth > 0.0).then_some(depth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn provider() -> OpinionProvider {
        OpinionProvider::new("https://api.example.test", Some("key".into()), true).unwrap()
    }

    #[test]
    fn disabled_without_credentials_or_flag() {
        let p = OpinionProvider::new("https://api.example.test", None, true).unwrap();
        assert!(!p.enabled());
        let p = OpinionProvider::new("https://api.example.test", Some("key".into()), false).unwrap();
        assert!(!p.enabled());
        assert!(provider().enabled());
    }

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(rate_limit_backoff(0), Duration::from_millis(500));
        assert_eq!(rate_limit_backoff(1), Duration::from_millis(1000));
        assert_eq!(rate_limit_backoff(3), Duration::from_millis(4000));
    }

    #[test]
    fn depth_parse_picks_best_quotes() {
        let raw = serde_json::json!({
            "bids": [{"price": 0.30, "size": 10}, {"price": 0.32, "size": 5}],
            "asks": [{"price": 0.40, "size": 8}, {"price": 0.38, "size": 4}]
        });
        let d = parse_depth(&raw);
        assert_eq!(d.best_bid, Some(0.32));
        assert_eq!(d.best_ask, Some(0.38));
        assert!(d.depth_usd.unwrap() > 0.0);

        let empty = parse_depth(&serde_json::json!({}));
        assert_eq!(empty.best_bid, None);
        assert_eq!(empty.depth_usd, None);
    }

    #[tokio::test]
    async fn binary_market_emits_complementary_pair() {
        let p = provider();
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let item = serde_json::json!({
            "market_id": "op-77",
            "title": "Will the bill pass?",
            "category": "Policy",
            "yes_price": 64,
            "volume_24h_usd": 9000,
            "liquidity": 4000
        });
        let mut out = Vec::new();
        p.collect_market(&item, ts, &mut out).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0].probability - 0.64).abs() < 1e-9);
        assert!((out[0].probability + out[1].probability - 1.0).abs() < 1e-9);
        assert_eq!(out[0].normalized_category, "policy");
        assert_eq!(out[0].liquidity_usd, Some(4000.0));
    }

    #[tokio::test]
    async fn pacer_spaces_request_starts() {
        let p = provider();
        let start = Instant::now();
        p.pace().await;
        p.pace().await;
        p.pace().await;
        // Third start is booked two intervals after the first.
        assert!(start.elapsed() >= MIN_REQUEST_INTERVAL * 2);
    }
}
