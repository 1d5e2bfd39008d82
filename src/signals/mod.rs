use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::providers::json_f64;

const BTC_SYMBOL: &str = "BTCUSDT";
const ETH_SYMBOL: &str = "ETHUSDT";

/// Per-cycle spot-price percent changes injected into the classifier. None
/// until two observations exist for a symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpotChanges {
    pub btc_1m_pct: Option<f64>,
    pub eth_1m_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    price: f64,
    observed_at: DateTime<Utc>,
}

/// Polls a spot-price source once per pipeline tick and keeps only the
/// previous observation per symbol. Nothing is persisted.
pub struct SpotSignals {
    http: Client,
    base_url: String,
    previous: Mutex<HashMap<&'static str, Observation>>,
}

impl SpotSignals {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(SpotSignals {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            previous: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch both symbols in parallel and return percent changes against the
    /// previous refresh. A failed fetch leaves that symbol's previous
    /// observation in place and reports None this cycle.
    pub async fn refresh(&self) -> SpotChanges {
        let (btc, eth) = tokio::join!(
            self.fetch_price(BTC_SYMBOL),
            self.fetch_price(ETH_SYMBOL)
        );
        SpotChanges {
            btc_1m_pct: self.advance(BTC_SYMBOL, btc),
            eth_1m_pct: self.advance(ETH_SYMBOL, eth),
        }
    }

    async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("spot price request failed for {symbol}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("spot price error for {}: {}", symbol, resp.status());
        }
        let raw: serde_json::Value = resp.json().await.context("spot price parse failed")?;
        json_f64(&raw["price"]).with_context(|| format!("no price in payload for {symbol}"))
    }

    /// Record the new observation and compute the percent change vs the one
    /// it replaces.
    fn advance(&self, symbol: &'static str, fetched: Result<f64>) -> Option<f64> {
        let price = match fetched {
            Ok(p) => p,
            Err(e) => {
                warn!("{:#}", e);
                return None;
            }
        };
        let now = Utc::now();
        let mut previous = self.previous.lock().unwrap();
        let prior = previous.insert(
            symbol,
            Observation {
                price,
                observed_at: now,
            },
        );
        let pct = match prior {
            Some(obs) if obs.price != 0.0 => {
                debug!(
                    "{} spot {} after {}s, prev {}",
                    symbol,
                    price,
                    (now - obs.observed_at).num_seconds(),
                    obs.price
                );
                Some((price - obs.price) / obs.price * 100.0)
            }
            _ => None,
        };
        pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> SpotSignals {
        SpotSignals::new("https://spot.example.test").unwrap()
    }

    #[test]
    fn first_observation_has_no_change() {
        let s = signals();
        assert_eq!(s.advance(BTC_SYMBOL, Ok(50_000.0)), None);
    }

    #[test]
    fn second_observation_reports_percent_change() {
        let s = signals();
        s.advance(BTC_SYMBOL, Ok(50_000.0));
        let pct = s.advance(BTC_SYMBOL, Ok(50_600.0)).unwrap();
        assert!((pct - 1.2).abs() < 1e-9);
        // And the window slides: next change is measured from 50,600.
        let pct = s.advance(BTC_SYMBOL, Ok(50_600.0)).unwrap();
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn failed_fetch_clears_nothing_and_reports_none() {
        let s = signals();
        s.advance(ETH_SYMBOL, Ok(3_000.0));
        assert_eq!(s.advance(ETH_SYMBOL, Err(anyhow::anyhow!("down"))), None);
        // The stored observation is still the last successful one.
        let pct = s.advance(ETH_SYMBOL, Ok(3_030.0)).unwrap();
        assert!((pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_previous_price_yields_none() {
        let s = signals();
        s.advance(BTC_SYMBOL, Ok(0.0));
        assert_eq!(s.advance(BTC_SYMBOL, Ok(100.0)), None);
    }
}
