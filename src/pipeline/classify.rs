use anyhow::Result;
use tracing::info;

use crate::db::models::{AnchorType, ClassificationInput, ClassificationRow, MoveLabel};
use crate::db::Database;
use crate::profiler::{crypto_context, normalize_text, sports_context};
use crate::signals::SpotChanges;
use crate::windows::IDX_1M;

/// Default profile confidence when a profile exists without one.
const DEFAULT_ANCHOR_CONFIDENCE: f64 = 0.7;

/// Floor applied to confidence in the exogenous abrupt-move rule only.
const ABRUPT_MOVE_CONFIDENCE_FLOOR: f64 = 0.9;

/// Feature view of one outcome at the tick.
#[derive(Debug, Clone)]
pub struct OutcomeFeatures {
    pub anchor: Option<AnchorType>,
    pub anchor_confidence: Option<f64>,
    pub normalized_category: String,
    pub crypto_ctx: bool,
    pub sports_ctx: bool,
    pub volume_24h_usd: Option<f64>,
    pub spread_pp: Option<f64>,
    pub delta_1m_pp: Option<f64>,
    pub btc_1m_pct: Option<f64>,
    pub eth_1m_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub opaque: f64,
    pub exogenous: f64,
    pub label: MoveLabel,
    pub reason_tags: Vec<String>,
}

/// Additive scoring of one outcome on the opaque-information and
/// exogenous-arbitrage axes. Rules fire independently; scores clamp to
/// [0, 100] at the end.
pub fn score_outcome(f: &OutcomeFeatures) -> Scored {
    let mut opaque: f64 = 20.0;
    let mut exogenous: f64 = 10.0;
    let mut tags: Vec<String> = Vec::new();
    let tag = |tags: &mut Vec<String>, t: &str| tags.push(t.to_string());

    let conf = f
        .anchor_confidence
        .unwrap_or(DEFAULT_ANCHOR_CONFIDENCE)
        .clamp(0.0, 1.0);
    let abs_delta_1m = f.delta_1m_pp.map(f64::abs);

    match f.anchor {
        Some(AnchorType::LiveScoreAnchored) => {
            exogenous += 60.0 * conf;
            tag(&mut tags, "anchor_live_score");
        }
        Some(AnchorType::SpotPriceAnchored) => {
            exogenous += 55.0 * conf;
            tag(&mut tags, "anchor_spot_price");
        }
        Some(AnchorType::SportsTeamNews) => {
            opaque += 45.0 * conf;
            tag(&mut tags, "anchor_sports_team_news");
        }
        Some(AnchorType::CryptoNewsSecurity) => {
            opaque += 45.0 * conf;
            tag(&mut tags, "anchor_crypto_news");
        }
        Some(AnchorType::ScheduledMacroRelease) => {
            opaque += 35.0 * conf;
            tag(&mut tags, "anchor_macro_release");
        }
        Some(AnchorType::PolicyRegulatoryDecision) => {
            opaque += 30.0 * conf;
            tag(&mut tags, "anchor_policy_decision");
        }
        Some(AnchorType::OtherUnknown) | None => {}
    }

    let unanchored = matches!(f.anchor, None | Some(AnchorType::OtherUnknown));
    if unanchored && f.sports_ctx {
        exogenous += 15.0;
        tag(&mut tags, "sports_related");
    }
    if unanchored && f.crypto_ctx {
        exogenous += 10.0;
        tag(&mut tags, "crypto_related");
    }

    if f.anchor == Some(AnchorType::SpotPriceAnchored) {
        let shock = f
            .btc_1m_pct
            .map(f64::abs)
            .into_iter()
            .chain(f.eth_1m_pct.map(f64::abs))
            .fold(0.0f64, f64::max);
        if shock >= 0.8 {
            exogenous += 18.0;
            tag(&mut tags, "spot_price_shock");
        }
    }

    if matches!(
        f.normalized_category.as_str(),
        "politics" | "policy" | "macro" | "other"
    ) {
        opaque += 20.0;
        tag(&mut tags, "opaque_info_prone_category");
    }

    if f.volume_24h_usd.unwrap_or(0.0) >= 10_000.0 && abs_delta_1m.unwrap_or(0.0) >= 4.0 {
        opaque += 20.0;
        tag(&mut tags, "meaningful_size_move");
    }

    if f.spread_pp.map(|s| s <= 8.0).unwrap_or(false) {
        opaque += 10.0;
        tag(&mut tags, "tight_spread");
    }

    if abs_delta_1m.unwrap_or(0.0) >= 15.0 {
        if matches!(
            f.anchor,
            Some(AnchorType::LiveScoreAnchored) | Some(AnchorType::SpotPriceAnchored)
        ) {
            exogenous += 12.0 * conf.max(ABRUPT_MOVE_CONFIDENCE_FLOOR);
        } else {
            opaque += 10.0;
        }
        tag(&mut tags, "abrupt_micro_move");
    }

    let opaque = opaque.clamp(0.0, 100.0);
    let exogenous = exogenous.clamp(0.0, 100.0);
    let label = if opaque >= exogenous && opaque >= 50.0 {
        MoveLabel::OpaqueInfoSensitive
    } else if exogenous >= 50.0 {
        MoveLabel::ExogenousArbitrage
    } else {
        MoveLabel::Unclear
    };

    Scored {
        opaque,
        exogenous,
        label,
        reason_tags: tags,
    }
}

fn features_from_input(input: &ClassificationInput, spot: SpotChanges) -> OutcomeFeatures {
    let text = normalize_text(&[&input.market_title]);
    OutcomeFeatures {
        anchor: input.anchor_type,
        anchor_confidence: input.anchor_confidence,
        normalized_category: input.normalized_category.clone(),
        crypto_ctx: crypto_context(&input.normalized_category, &text),
        sports_ctx: sports_context(&input.normalized_category, &text),
        volume_24h_usd: input.volume_24h_usd,
        spread_pp: input.spread_pp,
        delta_1m_pp: input.deltas_pp[IDX_1M],
        btc_1m_pct: spot.btc_1m_pct,
        eth_1m_pct: spot.eth_1m_pct,
    }
}

/// Classify every outcome at the latest delta tick and upsert one
/// classification row each. Returns the number of rows written.
pub fn run_classifier(db: &Database, spot: SpotChanges, model_version: &str) -> Result<usize> {
    let tick = match db.latest_delta_tick()? {
        Some(t) => t,
        None => return Ok(0),
    };
    let inputs = db.classification_inputs(tick)?;
    let mut written = 0usize;
    for input in &inputs {
        let scored = score_outcome(&features_from_input(input, spot));
        db.upsert_classification(&ClassificationRow {
            ts_minute: input.ts_minute,
            provider: input.provider.clone(),
            market_id: input.market_id.clone(),
            outcome_id: input.outcome_id.clone(),
            opaque_score: scored.opaque,
            exogenous_score: scored.exogenous,
            label: scored.label,
            reason_tags: scored.reason_tags,
            model_version: model_version.to_string(),
        })?;
        written += 1;
    }
    info!("Classified {} outcome(s) at {}", written, tick);
    Ok(written)
}
