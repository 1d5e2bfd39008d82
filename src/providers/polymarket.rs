use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{
    canonical_probability, json_f64, json_str, normalize_category, spread_pp_from_quotes,
    MarketProvider,
};
use crate::db::models::OutcomeSnapshot;

/// Concurrent order-book requests per tick.
const BOOK_CONCURRENCY: usize = 16;

/// Price levels summed per side when estimating book liquidity.
const DEPTH_LEVELS: usize = 20;

const PAGE_LIMIT: usize = 500;

/// Order-book provider in the Polymarket style: one listing request, then a
/// bounded-parallel book fetch per outcome token.
pub struct PolymarketProvider {
    http: Client,
    gamma_url: String,
    clob_url: String,
}

/// Market-level fields shared by every outcome future of one market.
struct MarketCtx {
    market_id: String,
    title: String,
    raw_category: Option<String>,
    normalized_category: &'static str,
    status: String,
    metadata: serde_json::Value,
    volume_24h_usd: Option<f64>,
    liquidity_usd: Option<f64>,
}

#[derive(Debug, Default, PartialEq)]
struct BookSummary {
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    depth_usd: f64,
}

impl PolymarketProvider {
    pub fn new(gamma_url: &str, clob_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(PolymarketProvider {
            http,
            gamma_url: gamma_url.trim_end_matches('/').to_string(),
            clob_url: clob_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_book(&self, token_id: &str) -> Result<BookSummary> {
        let url = format!("{}/book?token_id={}", self.clob_url, token_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("order book request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("order book error: {}", resp.status());
        }
        let raw: serde_json::Value = resp.json().await.context("order book parse failed")?;
        Ok(summarize_book(&raw))
    }
}

#[async_trait]
impl MarketProvider for PolymarketProvider {
    fn name(&self) -> &'static str {
        "polymarket"
    }

    async fn fetch_snapshots(&self, ts_minute: DateTime<Utc>) -> Result<Vec<OutcomeSnapshot>> {
        let url = format!(
            "{}/markets?active=true&closed=false&limit={}",
            self.gamma_url, PAGE_LIMIT
        );
        debug!("polymarket listing: {}", url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Polymarket listing request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Polymarket listing error: {}", resp.status());
        }
        let raw: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse Polymarket listing")?;
        let items = match raw.as_array() {
            Some(a) => a,
            None => match raw["markets"].as_array() {
                Some(a) => a,
                None => return Ok(vec![]),
            },
        };

        let semaphore = Arc::new(Semaphore::new(BOOK_CONCURRENCY));
        let mut futures = Vec::new();

        for item in items {
            let market_id = match json_str(&item["conditionId"]).or_else(|| json_str(&item["id"]))
            {
                Some(id) => id.to_string(),
                None => continue,
            };
            let title = json_str(&item["question"]).unwrap_or(&market_id).to_string();
            let raw_category = json_str(&item["category"]).map(String::from);
            let outcome_labels = parse_str_array(&item["outcomes"]);
            let token_ids = parse_str_array(&item["clobTokenIds"]);
            let prices = parse_f64_array(&item["outcomePrices"]);
            if outcome_labels.is_empty() {
                continue;
            }

            let mut metadata = serde_json::Map::new();
            if let Some(slug) = json_str(&item["slug"]) {
                metadata.insert("slug".into(), slug.into());
            }

            let ctx = Arc::new(MarketCtx {
                normalized_category: normalize_category(raw_category.as_deref(), &title),
                market_id,
                title,
                raw_category,
                status: if item["active"].as_bool().unwrap_or(true) {
                    "active".into()
                } else {
                    "closed".into()
                },
                metadata: serde_json::Value::Object(metadata),
                volume_24h_usd: json_f64(&item["volume24hr"]).or_else(|| json_f64(&item["volume"])),
                liquidity_usd: json_f64(&item["liquidity"]),
            });

            for (i, label) in outcome_labels.iter().enumerate() {
                let ctx = Arc::clone(&ctx);
                let label = label.clone();
                let token_id = token_ids.get(i).cloned();
                let listed_price = prices.get(i).copied();
                let semaphore = Arc::clone(&semaphore);
                futures.push(async move {
                    let book = match &token_id {
                        Some(token) => {
                            // The semaphore is never closed, so acquire only
                            // gates concurrency.
                            let _permit = semaphore.acquire().await.ok()?;
                            match self.fetch_book(token).await {
                                Ok(b) => Some(b),
                                Err(e) => {
                                    warn!(
                                        "book fetch failed for {} ({}): {:#}",
                                        ctx.market_id, token, e
                                    );
                                    None
                                }
                            }
                        }
                        None => None,
                    };
                    build_snapshot(ts_minute, &ctx, i, &label, token_id, listed_price, book)
                });
            }
        }

        let snapshots = futures_util::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect();
        Ok(snapshots)
    }
}

/// Assemble one outcome snapshot, preferring book-derived quotes and
/// falling back to the listing's price and market-level liquidity.
fn build_snapshot(
    ts_minute: DateTime<Utc>,
    ctx: &MarketCtx,
    index: usize,
    label: &str,
    token_id: Option<String>,
    listed_price: Option<f64>,
    book: Option<BookSummary>,
) -> Option<OutcomeSnapshot> {
    let book = book.unwrap_or_default();
    let probability = match (book.best_bid, book.best_ask) {
        (Some(b), Some(a)) => canonical_probability((b + a) / 2.0),
        _ => canonical_probability(listed_price?),
    };
    let spread_pp = spread_pp_from_quotes(book.best_bid, book.best_ask);
    let liquidity_usd = if book.depth_usd > 0.0 {
        Some(book.depth_usd)
    } else {
        ctx.liquidity_usd
    };

    Some(OutcomeSnapshot {
        ts_minute,
        provider: "polymarket".into(),
        market_id: ctx.market_id.clone(),
        outcome_id: token_id.unwrap_or_else(|| format!("{}:{}", ctx.market_id, index)),
        outcome_label: label.to_string(),
        probability,
        spread_pp,
        volume_24h_usd: ctx.volume_24h_usd,
        liquidity_usd,
        market_title: ctx.title.clone(),
        raw_category: ctx.raw_category.clone(),
        normalized_category: ctx.normalized_category.into(),
        market_status: ctx.status.clone(),
        metadata: ctx.metadata.clone(),
    })
}

/// Best bid/ask plus depth over the top levels of each side.
fn summarize_book(raw: &serde_json::Value) -> BookSummary {
    let side = |key: &str| -> Vec<(f64, f64)> {
        raw[key]
            .as_array()
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|l| Some((json_f64(&l["price"])?, json_f64(&l["size"])?)))
                    .collect()
            })
            .unwrap_or_default()
    };
    let bids = side("bids");
    let asks = side("asks");

    let best_bid = bids.iter().map(|(p, _)| *p).fold(None, |acc: Option<f64>, p| {
        Some(acc.map_or(p, |a| a.max(p)))
    });
    let best_ask = asks.iter().map(|(p, _)| *p).fold(None, |acc: Option<f64>, p| {
        Some(acc.map_or(p, |a| a.min(p)))
    });

    let depth = |mut levels: Vec<(f64, f64)>, descending: bool| -> f64 {
        levels.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        if descending {
            levels.reverse();
        }
        levels
            .iter()
            .take(DEPTH_LEVELS)
            .map(|(p, s)| p * s)
            .sum()
    };
    let depth_usd = depth(bids, true) + depth(asks, false);

    BookSummary {
        best_bid,
        best_ask,
        depth_usd,
    }
}

/// Gamma delivers arrays either as real JSON arrays or as JSON-encoded
/// strings like "[\"Yes\",\"No\"]".
fn parse_str_array(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| json_str(v).map(String::from))
            .collect(),
        serde_json::Value::String(s) => serde_json::from_str::<Vec<String>>(s).unwrap_or_default(),
        _ => vec![],
    }
}

fn parse_f64_array(value: &serde_json::Value) -> Vec<f64> {
    match value {
        serde_json::Value::Array(items) => items.iter().filter_map(json_f64).collect(),
        serde_json::Value::String(s) => serde_json::from_str::<Vec<serde_json::Value>>(s)
            .map(|vals| vals.iter().filter_map(json_f64).collect())
            .unwrap_or_default(),
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_summary_best_quotes_and_depth() {
        let raw = serde_json::json!({
            "bids": [
                {"price": "0.58", "size": "100"},
                {"price": "0.60", "size": "50"},
                {"price": "0.55", "size": "200"}
            ],
            "asks": [
                {"price": "0.66", "size": "80"},
                {"price": "0.64", "size": "40"}
            ]
        });
        let book = summarize_book(&raw);
        assert_eq!(book.best_bid, Some(0.60));
        assert_eq!(book.best_ask, Some(0.64));
        let expected = 0.58 * 100.0 + 0.60 * 50.0 + 0.55 * 200.0 + 0.66 * 80.0 + 0.64 * 40.0;
        assert!((book.depth_usd - expected).abs() < 1e-9);
    }

    #[test]
    fn empty_book_has_no_quotes() {
        let book = summarize_book(&serde_json::json!({}));
        assert_eq!(book, BookSummary::default());
    }

    #[test]
    fn depth_is_bounded_to_top_levels() {
        let levels: Vec<serde_json::Value> = (0..30)
            .map(|i| serde_json::json!({"price": 0.50, "size": 10.0 + i as f64 * 0.0}))
            .collect();
        let raw = serde_json::json!({"bids": levels, "asks": []});
        let book = summarize_book(&raw);
        // 20 of the 30 levels count.
        assert!((book.depth_usd - 20.0 * 0.50 * 10.0).abs() < 1e-9);
    }

    #[test]
    fn stringified_arrays_are_decoded() {
        assert_eq!(
            parse_str_array(&serde_json::json!("[\"Yes\",\"No\"]")),
            vec!["Yes".to_string(), "No".to_string()]
        );
        assert_eq!(
            parse_str_array(&serde_json::json!(["Up", "Down"])),
            vec!["Up".to_string(), "Down".to_string()]
        );
        assert_eq!(
            parse_f64_array(&serde_json::json!("[\"0.4\",\"0.6\"]")),
            vec![0.4, 0.6]
        );
    }

    #[test]
    fn snapshot_falls_back_to_listing_price_and_market_liquidity() {
        let ctx = MarketCtx {
            market_id: "0xabc".into(),
            title: "Will X happen?".into(),
            raw_category: None,
            normalized_category: "other",
            status: "active".into(),
            metadata: serde_json::json!({}),
            volume_24h_usd: Some(5000.0),
            liquidity_usd: Some(1234.0),
        };
        let ts = Utc::now();
        let snap = build_snapshot(ts, &ctx, 0, "Yes", None, Some(0.42), None).unwrap();
        assert!((snap.probability - 0.42).abs() < 1e-9);
        assert_eq!(snap.spread_pp, None);
        assert_eq!(snap.liquidity_usd, Some(1234.0));
        assert_eq!(snap.outcome_id, "0xabc:0");

        // No book and no listed price: nothing to emit.
        assert!(build_snapshot(ts, &ctx, 0, "Yes", None, None, None).is_none());
    }
}
