pub mod model;

pub use model::{AnchorModel, ModelHandle};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::db::models::{AnchorType, MarketProfile, ProfileCandidate};
use crate::db::Database;

/// Version reported when no trained model is loaded and the profile came
/// from rules alone.
pub const RULES_MODEL_VERSION: &str = "rules-1";

/// Minimum model confidence for accepting an ML prediction in the cascade.
const ML_ACCEPT_CONFIDENCE: f64 = 0.55;

const CRYPTO_KEYWORDS: &[&str] = &[
    "btc", "bitcoin", "eth", "ethereum", "solana", "dogecoin", "doge", "xrp",
    "crypto", "token", "stablecoin", "altcoin", "binance", "coinbase",
];

/// Price-anchor phrasing; combined with a digit this marks a market that
/// simply tracks a number.
const PRICE_ANCHOR_KEYWORDS: &[&str] =
    &["above", "below", "over", "under", "at least", ">=", "<=", "$"];

const SPORTS_KEYWORDS: &[&str] = &[
    "nfl", "nba", "mlb", "nhl", "soccer", "football", "basketball", "baseball",
    "hockey", "tennis", "ufc", "golf", "premier league", "champions league",
    "playoff", "super bowl", "world cup", "grand slam",
];

const LIVE_SCORE_PATTERNS: &[&str] = &[
    "win the", "beat the", "beats", "defeats", " vs ", "vs.", "score",
    "points in", "total points", "margin of victory", "lead at", "first half",
    "quarter", "overtime", "shutout", "moneyline", "cover the spread",
];

const TEAM_NEWS_PATTERNS: &[&str] = &[
    "trade", "traded", "injury", "injured", "signs", "signing", "coach",
    "fired", "hired", "draft", "suspend", "retire", "roster",
    "contract extension", "out for the season",
];

const MACRO_PATTERNS: &[&str] = &[
    "cpi", "inflation", "fomc", "fed funds", "rate cut", "rate hike",
    "interest rate decision", "nonfarm", "payroll", "gdp",
    "unemployment rate", "jobless claims", "pce", "recession",
];

const CRYPTO_NEWS_PATTERNS: &[&str] = &[
    "hack", "exploit", "etf approval", "etf approved", "sec approve",
    "delist", "listing", "list on", "mainnet", "halving", "hard fork",
    "airdrop", "bankrupt", "insolven", "depeg", "rug pull",
];

const POLICY_PATTERNS: &[&str] = &[
    "ban", "regulation", "regulatory", "bill", "law", "congress", "senate",
    "parliament", "executive order", "supreme court", "ruling", "veto",
    "sanction", "tariff", "nominee", "confirm", "pardon", "impeach", "resign",
];

/// Plain-word needles match by token prefix ("hack" hits "hacked" but not
/// "shacked"); needles with spaces or symbols match as substrings.
fn text_matches(text: &str, needle: &str) -> bool {
    if needle.chars().all(|c| c.is_ascii_alphanumeric()) {
        text.split_whitespace().any(|token| token.starts_with(needle))
    } else {
        text.contains(needle)
    }
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text_matches(text, n))
}

fn has_digit(text: &str) -> bool {
    text.bytes().any(|b| b.is_ascii_digit())
}

/// A market is crypto-context when its category says so or its text does.
pub fn crypto_context(normalized_category: &str, text: &str) -> bool {
    normalized_category == "crypto" || contains_any(text, CRYPTO_KEYWORDS)
}

pub fn sports_context(normalized_category: &str, text: &str) -> bool {
    normalized_category == "sports" || contains_any(text, SPORTS_KEYWORDS)
}

/// Lowercase and strip punctuation except `$ + . : -`, collapsing runs of
/// whitespace. All profiling and training operates on this form.
pub fn normalize_text(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        for c in part.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_alphanumeric() || matches!(c, '$' | '+' | '.' | ':' | '-') {
                out.push(c);
            } else {
                out.push(' ');
            }
        }
        out.push(' ');
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Profiling document for a market: title plus the original title and leg
/// texts of combo markets.
pub fn profile_document(candidate: &ProfileCandidate) -> String {
    let mut parts: Vec<&str> = vec![&candidate.title];
    if let Some(original) = candidate.metadata["original_title"].as_str() {
        parts.push(original);
    }
    if let Some(legs) = candidate.metadata["legs"].as_array() {
        parts.extend(legs.iter().filter_map(|l| l.as_str()));
    }
    normalize_text(&parts)
}

/// The hybrid cascade: hard rules, then the trained classifier (with a
/// context veto on the two exogenous anchors), then the fallback ladder.
pub fn classify_anchor(
    text: &str,
    normalized_category: &str,
    model: Option<&AnchorModel>,
) -> (AnchorType, f64) {
    let crypto = crypto_context(normalized_category, text);
    let sports = sports_context(normalized_category, text);

    // Hard rules, highest precision first.
    if crypto && contains_any(text, PRICE_ANCHOR_KEYWORDS) && has_digit(text) {
        return (AnchorType::SpotPriceAnchored, 0.95);
    }
    if sports
        && contains_any(text, LIVE_SCORE_PATTERNS)
        && !contains_any(text, TEAM_NEWS_PATTERNS)
    {
        return (AnchorType::LiveScoreAnchored, 0.95);
    }

    // Trained classifier. A prediction of an exogenous anchor without the
    // matching context is rejected outright.
    if let Some(model) = model {
        if let Some((anchor, confidence)) = model
            .predict(text)
            .and_then(|(name, conf)| AnchorType::parse(&name).map(|a| (a, conf)))
        {
            let context_ok = match anchor {
                AnchorType::SpotPriceAnchored => crypto,
                AnchorType::LiveScoreAnchored => sports,
                _ => true,
            };
            if context_ok && confidence >= ML_ACCEPT_CONFIDENCE {
                return (anchor, confidence);
            }
        }
    }

    // Fallback ladder, first match wins.
    if contains_any(text, MACRO_PATTERNS) {
        return (AnchorType::ScheduledMacroRelease, 0.8);
    }
    if crypto
        && contains_any(text, CRYPTO_NEWS_PATTERNS)
        && !contains_any(text, LIVE_SCORE_PATTERNS)
    {
        return (AnchorType::CryptoNewsSecurity, 0.8);
    }
    if sports && contains_any(text, TEAM_NEWS_PATTERNS) {
        return (AnchorType::SportsTeamNews, 0.8);
    }
    if normalized_category == "policy" || contains_any(text, POLICY_PATTERNS) {
        return (AnchorType::PolicyRegulatoryDecision, 0.65);
    }

    (AnchorType::OtherUnknown, 0.3)
}

/// Profile every market still lacking a profile for the active model
/// version, bounded per cycle. Returns the number of profiles written.
pub fn run_profiler(
    db: &Database,
    model: Option<&AnchorModel>,
    batch_size: i64,
) -> Result<usize> {
    let version = model
        .map(|m| m.model_version.clone())
        .unwrap_or_else(|| RULES_MODEL_VERSION.to_string());
    let pending = db.markets_needing_profile(&version, batch_size)?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut written = 0usize;
    for candidate in &pending {
        let text = profile_document(candidate);
        let (anchor_type, confidence) =
            classify_anchor(&text, &candidate.normalized_category, model);
        debug!(
            "profiled {}:{} as {} ({:.2})",
            candidate.provider,
            candidate.market_id,
            anchor_type.as_str(),
            confidence
        );
        db.upsert_profile(&MarketProfile {
            provider: candidate.provider.clone(),
            market_id: candidate.market_id.clone(),
            anchor_type,
            insider_possible: anchor_type.insider_possible(),
            confidence,
            model_version: version.clone(),
            updated_at: Utc::now(),
        })?;
        written += 1;
    }
    info!("Profiled {} market(s) with model {}", written, version);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(title: &str, category: &str) -> (AnchorType, f64) {
        let text = normalize_text(&[title]);
        classify_anchor(&text, category, None)
    }

    #[test]
    fn word_needles_match_token_prefixes_only() {
        assert!(text_matches("the exchange was hacked", "hack"));
        assert!(text_matches("will ethereum rally", "eth"));
        // "eth" buried inside "whether" must not read as crypto.
        assert!(!text_matches("whether it rains", "eth"));
        assert!(text_matches("btc above $100k", "$"));
        assert!(text_matches("team a vs. team b", "vs."));
    }

    #[test]
    fn normalize_keeps_price_punctuation() {
        let text = normalize_text(&["Will BTC close ABOVE $100,000?!"]);
        assert_eq!(text, "will btc close above $100 000");
    }

    #[test]
    fn spot_price_hard_rule() {
        let (a, c) = anchor("Will Bitcoin trade above $100,000 on June 1?", "crypto");
        assert_eq!(a, AnchorType::SpotPriceAnchored);
        assert_eq!(c, 0.95);
        assert!(!a.insider_possible());
    }

    #[test]
    fn spot_rule_needs_a_digit() {
        let (a, _) = anchor("Will Bitcoin go above its previous high?", "crypto");
        assert_ne!(a, AnchorType::SpotPriceAnchored);
    }

    #[test]
    fn live_score_hard_rule() {
        let (a, c) = anchor("Will the Chiefs beat the Eagles by 7+ points?", "sports");
        assert_eq!(a, AnchorType::LiveScoreAnchored);
        assert_eq!(c, 0.95);
        assert!(!a.insider_possible());
    }

    #[test]
    fn team_news_vetoes_live_score() {
        let (a, c) = anchor("Will the Chiefs trade their starting quarterback?", "sports");
        assert_eq!(a, AnchorType::SportsTeamNews);
        assert_eq!(c, 0.8);
        assert!(a.insider_possible());
    }

    #[test]
    fn macro_fallback() {
        let (a, c) = anchor("Will CPI inflation exceed expectations in July?", "macro");
        assert_eq!(a, AnchorType::ScheduledMacroRelease);
        assert_eq!(c, 0.8);
    }

    #[test]
    fn crypto_news_fallback() {
        let (a, c) = anchor("Will a major exchange get hacked this year?", "crypto");
        assert_eq!(a, AnchorType::CryptoNewsSecurity);
        assert_eq!(c, 0.8);
    }

    #[test]
    fn policy_fallback() {
        let (a, c) = anchor("Will the senate pass the spending bill?", "politics");
        assert_eq!(a, AnchorType::PolicyRegulatoryDecision);
        assert_eq!(c, 0.65);
    }

    #[test]
    fn unknown_fallback() {
        let (a, c) = anchor("Will it rain in Paris tomorrow?", "other");
        assert_eq!(a, AnchorType::OtherUnknown);
        assert_eq!(c, 0.3);
    }

    #[test]
    fn ml_prediction_rejected_without_context() {
        // A model certain that everything is spot-anchored must not win on
        // a politics market with no crypto context.
        let model = model::tests_support::constant_model("spot_price_anchored");
        let text = normalize_text(&["Who will be confirmed as the next chair?"]);
        let (a, _) = classify_anchor(&text, "politics", Some(&model));
        assert_ne!(a, AnchorType::SpotPriceAnchored);
    }

    #[test]
    fn ml_prediction_accepted_with_context() {
        let model = model::tests_support::constant_model("scheduled_macro_release");
        let text = normalize_text(&["Completely novel wording with no patterns"]);
        let (a, c) = classify_anchor(&text, "other", Some(&model));
        assert_eq!(a, AnchorType::ScheduledMacroRelease);
        assert!(c >= 0.55);
    }

    #[test]
    fn profile_document_includes_combo_legs() {
        let candidate = ProfileCandidate {
            provider: "kalshi".into(),
            market_id: "M".into(),
            title: "yes A (+2 legs)".into(),
            raw_category: None,
            normalized_category: "other".into(),
            metadata: serde_json::json!({
                "original_title": "yes A, no B, yes C",
                "legs": ["yes A", "no B", "yes C"],
            }),
        };
        let doc = profile_document(&candidate);
        assert!(doc.contains("no b"));
        assert!(doc.contains("yes c"));
    }

    #[test]
    fn profiler_writes_bounded_batch() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..3 {
            let mut snap = base_snapshot(i);
            snap.market_id = format!("MKT-{i}");
            db.upsert_snapshot(&snap).unwrap();
        }
        let written = run_profiler(&db, None, 2).unwrap();
        assert_eq!(written, 2);
        let written = run_profiler(&db, None, 2).unwrap();
        assert_eq!(written, 1);
        assert_eq!(run_profiler(&db, None, 2).unwrap(), 0);
    }

    fn base_snapshot(i: usize) -> crate::db::models::OutcomeSnapshot {
        crate::db::models::OutcomeSnapshot {
            ts_minute: Utc::now(),
            provider: "kalshi".into(),
            market_id: format!("MKT-{i}"),
            outcome_id: "yes".into(),
            outcome_label: "Yes".into(),
            probability: 0.5,
            spread_pp: None,
            volume_24h_usd: None,
            liquidity_usd: None,
            market_title: "Will CPI inflation rise?".into(),
            raw_category: None,
            normalized_category: "macro".into(),
            market_status: "active".into(),
            metadata: serde_json::json!({}),
        }
    }
}
