use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::db::models::{MoveLabel, MoverRow};
use crate::db::Database;
use crate::windows::{self, WINDOWS};

const DEFAULT_MIN_LIQUIDITY: f64 = 5_000.0;
const DEFAULT_MAX_SPREAD_PP: f64 = 15.0;
const DEFAULT_PAGE_SIZE: u32 = 50;
const DEFAULT_SORT_WINDOW: &str = "1h";
const DEFAULT_PROVIDERS: &[&str] = &["polymarket", "kalshi"];
const KNOWN_PROVIDERS: &[&str] = &["polymarket", "kalshi", "opinion"];

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub enabled_providers: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/movers", get(movers_handler))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

// ── Query parameters ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MoversQuery {
    providers: Option<String>,
    category: Option<String>,
    tab: Option<String>,
    sort_window: Option<String>,
    sort: Option<String>,
    include_low_liquidity: Option<bool>,
    min_liquidity: Option<f64>,
    max_spread: Option<f64>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedQuery {
    providers: Vec<String>,
    category: Option<String>,
    label: Option<MoveLabel>,
    sort_window: usize,
    sort_window_name: &'static str,
    descending: bool,
    liquidity_gate: Option<(f64, f64)>,
    page: u32,
    page_size: u32,
}

fn resolve_query(q: &MoversQuery) -> ResolvedQuery {
    let providers: Vec<String> = q
        .providers
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|p| p.trim().to_lowercase())
        .filter(|p| KNOWN_PROVIDERS.contains(&p.as_str()))
        .collect();
    let providers = if providers.is_empty() {
        DEFAULT_PROVIDERS.iter().map(|s| s.to_string()).collect()
    } else {
        providers
    };

    let category = q
        .category
        .as_deref()
        .filter(|c| !c.is_empty() && *c != "all")
        .map(String::from);

    let label = match q.tab.as_deref() {
        Some("opaque") => Some(MoveLabel::OpaqueInfoSensitive),
        Some("exogenous") => Some(MoveLabel::ExogenousArbitrage),
        _ => None,
    };

    let sort_window = q
        .sort_window
        .as_deref()
        .and_then(windows::index_of)
        .unwrap_or_else(|| windows::index_of(DEFAULT_SORT_WINDOW).unwrap_or(0));

    let descending = !matches!(q.sort.as_deref(), Some("asc"));

    let liquidity_gate = if q.include_low_liquidity.unwrap_or(false) {
        None
    } else {
        Some((
            q.min_liquidity.unwrap_or(DEFAULT_MIN_LIQUIDITY),
            q.max_spread.unwrap_or(DEFAULT_MAX_SPREAD_PP),
        ))
    };

    ResolvedQuery {
        providers,
        category,
        label,
        sort_window,
        sort_window_name: WINDOWS[sort_window].name,
        descending,
        liquidity_gate,
        page: q.page.unwrap_or(1).max(1),
        page_size: q.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(10, 100),
    }
}

// ── Response shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct MoversResponse {
    pub data: Vec<MarketRowDto>,
    pub meta: MetaDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaDto {
    pub sort_window: String,
    pub sort: String,
    pub page: u32,
    pub page_size: u32,
    pub total_rows: usize,
    pub total_pages: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRowDto {
    pub provider: String,
    pub market_id: String,
    pub market_title: String,
    pub normalized_category: String,
    pub label: String,
    pub reason_tags: Vec<String>,
    pub lead_outcome_id: String,
    pub market_meta: serde_json::Value,
    pub outcomes: Vec<OutcomeRowDto>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRowDto {
    pub outcome_id: String,
    pub outcome_label: String,
    pub probability: f64,
    pub spread_pp: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub label: String,
    pub reason_tags: Vec<String>,
    pub deltas_pp: serde_json::Map<String, serde_json::Value>,
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn movers_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MoversQuery>,
) -> Result<Json<MoversResponse>, (StatusCode, Json<serde_json::Value>)> {
    match build_movers(&state.db, &q) {
        Ok(resp) => Ok(Json(resp)),
        Err(e) => {
            // Internal detail stays in the logs; the client gets an opaque
            // body.
            error!("movers query failed: {:#}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to load movers."})),
            ))
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.counts() {
        Ok(counts) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "providers": state.enabled_providers,
                "markets": counts.markets,
                "outcomes": counts.outcomes,
                "snapshots": counts.snapshots,
                "latestTick": counts.latest_tick,
            })),
        ),
        Err(e) => {
            error!("health query failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"status": "error"})),
            )
        }
    }
}

fn build_movers(db: &Database, q: &MoversQuery) -> anyhow::Result<MoversResponse> {
    let resolved = resolve_query(q);
    let tick = db.latest_delta_tick()?;
    let rows = match tick {
        Some(tick) => db.mover_rows(
            tick,
            &resolved.providers,
            resolved.category.as_deref(),
            resolved.label,
            resolved.liquidity_gate,
        )?,
        None => vec![],
    };
    Ok(assemble_response(rows, &resolved))
}

/// Compare two nullable deltas with NULLs last regardless of direction.
fn cmp_deltas(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => {
            let ord = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Group outcome rows into ranked market rows: pick each market's lead
/// outcome on the sort window, order markets by the lead's delta, paginate,
/// and order outcomes within each market by |delta| descending.
fn assemble_response(rows: Vec<MoverRow>, opts: &ResolvedQuery) -> MoversResponse {
    let sw = opts.sort_window;

    let mut grouped: HashMap<(String, String), Vec<MoverRow>> = HashMap::new();
    for row in rows {
        grouped
            .entry((row.provider.clone(), row.market_id.clone()))
            .or_default()
            .push(row);
    }

    let mut markets: Vec<Vec<MoverRow>> = grouped.into_values().collect();
    for outcomes in &mut markets {
        // Lead first: extreme sort-window delta under the direction, NULLs
        // last.
        outcomes.sort_by(|a, b| {
            cmp_deltas(a.deltas_pp[sw], b.deltas_pp[sw], opts.descending)
                .then_with(|| a.outcome_id.cmp(&b.outcome_id))
        });
    }
    markets.sort_by(|a, b| {
        cmp_deltas(a[0].deltas_pp[sw], b[0].deltas_pp[sw], opts.descending)
            .then_with(|| a[0].market_id.cmp(&b[0].market_id))
    });

    let total_rows = markets.len();
    let total_pages = total_rows.div_ceil(opts.page_size as usize);
    let offset = (opts.page as usize - 1) * opts.page_size as usize;

    let data: Vec<MarketRowDto> = markets
        .into_iter()
        .skip(offset)
        .take(opts.page_size as usize)
        .map(|mut outcomes| {
            let lead = outcomes[0].clone();
            // Display order within a market: magnitude of the sort-window
            // delta, largest first.
            outcomes.sort_by(|a, b| {
                cmp_deltas(
                    a.deltas_pp[sw].map(f64::abs),
                    b.deltas_pp[sw].map(f64::abs),
                    true,
                )
                .then_with(|| a.outcome_id.cmp(&b.outcome_id))
            });
            MarketRowDto {
                provider: lead.provider.clone(),
                market_id: lead.market_id.clone(),
                market_title: lead.market_title.clone(),
                normalized_category: lead.normalized_category.clone(),
                label: lead.label.as_str().to_string(),
                reason_tags: lead.reason_tags.clone(),
                lead_outcome_id: lead.outcome_id.clone(),
                market_meta: lead.metadata.clone(),
                timestamp: lead.ts_minute,
                outcomes: outcomes.into_iter().map(outcome_dto).collect(),
            }
        })
        .collect();

    MoversResponse {
        data,
        meta: MetaDto {
            sort_window: opts.sort_window_name.to_string(),
            sort: if opts.descending { "desc" } else { "asc" }.to_string(),
            page: opts.page,
            page_size: opts.page_size,
            total_rows,
            total_pages,
        },
    }
}

fn outcome_dto(row: MoverRow) -> OutcomeRowDto {
    let mut deltas_pp = serde_json::Map::new();
    for (window, delta) in WINDOWS.iter().zip(row.deltas_pp.iter()) {
        deltas_pp.insert(
            window.name.to_string(),
            delta.map(Into::into).unwrap_or(serde_json::Value::Null),
        );
    }
    OutcomeRowDto {
        outcome_id: row.outcome_id,
        outcome_label: row.outcome_label,
        probability: row.probability,
        spread_pp: row.spread_pp,
        volume_24h_usd: row.volume_24h_usd,
        liquidity_usd: row.liquidity_usd,
        label: row.label.as_str().to_string(),
        reason_tags: row.reason_tags,
        deltas_pp,
    }
}
