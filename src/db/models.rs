use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::windows::WINDOW_COUNT;

/// What drives a market's probability. Spot and live-score anchors track a
/// fast public reference; the remaining types leave room for private
/// information to move the price first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    SpotPriceAnchored,
    LiveScoreAnchored,
    ScheduledMacroRelease,
    PolicyRegulatoryDecision,
    SportsTeamNews,
    CryptoNewsSecurity,
    OtherUnknown,
}

impl AnchorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorType::SpotPriceAnchored => "spot_price_anchored",
            AnchorType::LiveScoreAnchored => "live_score_anchored",
            AnchorType::ScheduledMacroRelease => "scheduled_macro_release",
            AnchorType::PolicyRegulatoryDecision => "policy_regulatory_decision",
            AnchorType::SportsTeamNews => "sports_team_news",
            AnchorType::CryptoNewsSecurity => "crypto_news_security",
            AnchorType::OtherUnknown => "other_unknown",
        }
    }

    pub fn parse(s: &str) -> Option<AnchorType> {
        match s {
            "spot_price_anchored" => Some(AnchorType::SpotPriceAnchored),
            "live_score_anchored" => Some(AnchorType::LiveScoreAnchored),
            "scheduled_macro_release" => Some(AnchorType::ScheduledMacroRelease),
            "policy_regulatory_decision" => Some(AnchorType::PolicyRegulatoryDecision),
            "sports_team_news" => Some(AnchorType::SportsTeamNews),
            "crypto_news_security" => Some(AnchorType::CryptoNewsSecurity),
            "other_unknown" => Some(AnchorType::OtherUnknown),
            _ => None,
        }
    }

    /// Insider information is plausible for everything except the two
    /// exogenously-anchored types.
    pub fn insider_possible(&self) -> bool {
        !matches!(
            self,
            AnchorType::SpotPriceAnchored | AnchorType::LiveScoreAnchored
        )
    }
}

/// Final verdict on what moved an outcome this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveLabel {
    OpaqueInfoSensitive,
    ExogenousArbitrage,
    Unclear,
}

impl MoveLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveLabel::OpaqueInfoSensitive => "opaque_info_sensitive",
            MoveLabel::ExogenousArbitrage => "exogenous_arbitrage",
            MoveLabel::Unclear => "unclear",
        }
    }

    pub fn parse(s: &str) -> Option<MoveLabel> {
        match s {
            "opaque_info_sensitive" => Some(MoveLabel::OpaqueInfoSensitive),
            "exogenous_arbitrage" => Some(MoveLabel::ExogenousArbitrage),
            "unclear" => Some(MoveLabel::Unclear),
            _ => None,
        }
    }
}

/// One provider outcome quote at one minute tick, normalized into the
/// uniform shape every adapter emits. Market-level fields ride along so the
/// store can upsert market, outcome, and snapshot from a single record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeSnapshot {
    pub ts_minute: DateTime<Utc>,
    pub provider: String,
    pub market_id: String,
    pub outcome_id: String,
    /// Human-readable outcome label, e.g. "Yes" or a candidate name.
    pub outcome_label: String,
    /// Canonical probability in [0, 1].
    pub probability: f64,
    /// Best bid/ask distance in percentage points; None when the provider
    /// publishes only a mid/last quote or the book sits at a 0/100 sentinel.
    pub spread_pp: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub market_title: String,
    pub raw_category: Option<String>,
    /// One of crypto | politics | policy | sports | macro | other.
    pub normalized_category: String,
    pub market_status: String,
    /// Provider-specific bag: URL slug, combo legs, event ticker, etc.
    pub metadata: serde_json::Value,
}

/// Per-market anchor profile written by the profiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketProfile {
    pub provider: String,
    pub market_id: String,
    pub anchor_type: AnchorType,
    pub insider_possible: bool,
    pub confidence: f64,
    pub model_version: String,
    pub updated_at: DateTime<Utc>,
}

/// Windowed probability changes for one outcome at one tick. The array is
/// parallel to `windows::WINDOWS`; None means no reference snapshot existed
/// at or before `ts_minute - window`.
#[derive(Debug, Clone)]
pub struct DeltaRow {
    pub ts_minute: DateTime<Utc>,
    pub provider: String,
    pub market_id: String,
    pub outcome_id: String,
    pub deltas_pp: [Option<f64>; WINDOW_COUNT],
}

/// Classifier output for one outcome at one tick.
#[derive(Debug, Clone)]
pub struct ClassificationRow {
    pub ts_minute: DateTime<Utc>,
    pub provider: String,
    pub market_id: String,
    pub outcome_id: String,
    pub opaque_score: f64,
    pub exogenous_score: f64,
    pub label: MoveLabel,
    pub reason_tags: Vec<String>,
    pub model_version: String,
}

/// A market awaiting (re-)profiling, with the text fields the cascade needs.
#[derive(Debug, Clone)]
pub struct ProfileCandidate {
    pub provider: String,
    pub market_id: String,
    pub title: String,
    pub raw_category: Option<String>,
    pub normalized_category: String,
    pub metadata: serde_json::Value,
}

/// Joined row feeding the outcome classifier: the snapshot at the tick, its
/// deltas, the market fields, and the profile when one exists.
#[derive(Debug, Clone)]
pub struct ClassificationInput {
    pub ts_minute: DateTime<Utc>,
    pub provider: String,
    pub market_id: String,
    pub outcome_id: String,
    pub probability: f64,
    pub spread_pp: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub market_title: String,
    pub raw_category: Option<String>,
    pub normalized_category: String,
    pub deltas_pp: [Option<f64>; WINDOW_COUNT],
    pub anchor_type: Option<AnchorType>,
    /// Profile confidence; None when no profile exists or the stored row
    /// carries no confidence. The classifier applies its own defaults.
    pub anchor_confidence: Option<f64>,
}

/// An opaque-labelled outcome that passed the alerter's liquidity and
/// spread gates, with everything needed to build and dedup a message.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub ts_minute: DateTime<Utc>,
    pub provider: String,
    pub market_id: String,
    pub outcome_id: String,
    pub market_title: String,
    pub outcome_label: String,
    pub probability: f64,
    pub deltas_pp: [Option<f64>; WINDOW_COUNT],
    pub label: MoveLabel,
    pub reason_tags: Vec<String>,
}

/// One outcome row of the movers query: the full join the read API groups
/// into market rows.
#[derive(Debug, Clone)]
pub struct MoverRow {
    pub ts_minute: DateTime<Utc>,
    pub provider: String,
    pub market_id: String,
    pub market_title: String,
    pub normalized_category: String,
    pub metadata: serde_json::Value,
    pub outcome_id: String,
    pub outcome_label: String,
    pub probability: f64,
    pub spread_pp: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub deltas_pp: [Option<f64>; WINDOW_COUNT],
    pub label: MoveLabel,
    pub reason_tags: Vec<String>,
}

/// Row counts surfaced by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoreCounts {
    pub markets: i64,
    pub outcomes: i64,
    pub snapshots: i64,
    pub latest_tick: Option<DateTime<Utc>>,
}
