use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tracing::info;

pub mod models;
use models::*;

use crate::windows::{WINDOW_COUNT, WINDOWS};

/// Thread-safe SQLite handle (single connection behind a mutex). Every
/// write is its own implicit transaction, so a shutdown mid-cycle never
/// leaves partial rows behind.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Named, idempotent migrations. Applied in order; each one runs inside a
/// transaction and is recorded in schema_migrations so it never re-runs.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_markets",
        "CREATE TABLE IF NOT EXISTS markets (
            provider            TEXT NOT NULL,
            market_id           TEXT NOT NULL,
            title               TEXT NOT NULL,
            raw_category        TEXT,
            normalized_category TEXT NOT NULL DEFAULT 'other',
            status              TEXT NOT NULL DEFAULT 'active',
            metadata            TEXT NOT NULL DEFAULT '{}',
            first_seen_at       TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            PRIMARY KEY (provider, market_id)
        );",
    ),
    (
        "0002_outcomes",
        "CREATE TABLE IF NOT EXISTS outcomes (
            provider   TEXT NOT NULL,
            market_id  TEXT NOT NULL,
            outcome_id TEXT NOT NULL,
            label      TEXT NOT NULL,
            PRIMARY KEY (provider, market_id, outcome_id),
            FOREIGN KEY (provider, market_id)
                REFERENCES markets(provider, market_id) ON DELETE CASCADE
        );",
    ),
    (
        "0003_snapshots",
        "CREATE TABLE IF NOT EXISTS snapshots (
            ts_minute      TEXT NOT NULL,
            provider       TEXT NOT NULL,
            market_id      TEXT NOT NULL,
            outcome_id     TEXT NOT NULL,
            probability    REAL NOT NULL,
            spread_pp      REAL,
            volume_24h_usd REAL,
            liquidity_usd  REAL,
            PRIMARY KEY (ts_minute, provider, market_id, outcome_id)
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_outcome_ts
            ON snapshots(provider, market_id, outcome_id, ts_minute);",
    ),
    (
        "0004_deltas",
        "CREATE TABLE IF NOT EXISTS deltas (
            ts_minute  TEXT NOT NULL,
            provider   TEXT NOT NULL,
            market_id  TEXT NOT NULL,
            outcome_id TEXT NOT NULL,
            delta_1m   REAL,
            delta_5m   REAL,
            delta_10m  REAL,
            delta_30m  REAL,
            delta_1h   REAL,
            delta_6h   REAL,
            delta_12h  REAL,
            delta_24h  REAL,
            PRIMARY KEY (ts_minute, provider, market_id, outcome_id)
        );",
    ),
    (
        "0005_classifications",
        "CREATE TABLE IF NOT EXISTS classifications (
            ts_minute       TEXT NOT NULL,
            provider        TEXT NOT NULL,
            market_id       TEXT NOT NULL,
            outcome_id      TEXT NOT NULL,
            opaque_score    REAL NOT NULL,
            exogenous_score REAL NOT NULL,
            label           TEXT NOT NULL,
            reason_tags     TEXT NOT NULL DEFAULT '[]',
            model_version   TEXT NOT NULL,
            PRIMARY KEY (ts_minute, provider, market_id, outcome_id)
        );
        CREATE INDEX IF NOT EXISTS idx_classifications_label
            ON classifications(ts_minute, label);",
    ),
    (
        "0006_market_profiles",
        "CREATE TABLE IF NOT EXISTS market_profiles (
            provider         TEXT NOT NULL,
            market_id        TEXT NOT NULL,
            anchor_type      TEXT NOT NULL,
            insider_possible INTEGER NOT NULL,
            confidence       REAL,
            model_version    TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            PRIMARY KEY (provider, market_id)
        );",
    ),
    (
        "0007_alert_state",
        "CREATE TABLE IF NOT EXISTS alert_state (
            signature    TEXT PRIMARY KEY,
            last_sent_at TEXT NOT NULL
        );",
    ),
];

/// Delta column list in canonical window order; must stay in sync with
/// `windows::WINDOWS`.
const DELTA_COLUMNS: &str =
    "delta_1m, delta_5m, delta_10m, delta_30m, delta_1h, delta_6h, delta_12h, delta_24h";

impl Database {
    /// Open (or create) the database at the given path and bring the schema
    /// up to date.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open database {path}"))?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Apply any migrations not yet recorded in schema_migrations. Each
    /// migration runs inside its own transaction.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name       TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        let mut applied = 0usize;
        for (name, sql) in MIGRATIONS {
            let done: Option<String> = conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            if done.is_some() {
                continue;
            }
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)
                .with_context(|| format!("migration {name}"))?;
            tx.execute(
                "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
                params![name, Utc::now()],
            )?;
            tx.commit()?;
            applied += 1;
        }
        if applied > 0 {
            info!("Applied {} schema migration(s)", applied);
        }
        Ok(())
    }

    // ── Snapshots (C1 → C2) ──────────────────────────────────────────────────

    /// Upsert the market, outcome, and snapshot rows for one normalized
    /// provider quote. Keyed upserts make re-running a tick idempotent.
    pub fn upsert_snapshot(&self, snap: &OutcomeSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO markets (provider, market_id, title, raw_category,
                                  normalized_category, status, metadata,
                                  first_seen_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8)
             ON CONFLICT(provider, market_id) DO UPDATE SET
                title=excluded.title,
                raw_category=excluded.raw_category,
                normalized_category=excluded.normalized_category,
                status=excluded.status,
                metadata=excluded.metadata,
                updated_at=excluded.updated_at",
            params![
                snap.provider,
                snap.market_id,
                snap.market_title,
                snap.raw_category,
                snap.normalized_category,
                snap.market_status,
                snap.metadata.to_string(),
                now,
            ],
        )?;
        conn.execute(
            "INSERT INTO outcomes (provider, market_id, outcome_id, label)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(provider, market_id, outcome_id) DO UPDATE SET
                label=excluded.label",
            params![snap.provider, snap.market_id, snap.outcome_id, snap.outcome_label],
        )?;
        conn.execute(
            "INSERT INTO snapshots (ts_minute, provider, market_id, outcome_id,
                                    probability, spread_pp, volume_24h_usd, liquidity_usd)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(ts_minute, provider, market_id, outcome_id) DO UPDATE SET
                probability=excluded.probability,
                spread_pp=excluded.spread_pp,
                volume_24h_usd=excluded.volume_24h_usd,
                liquidity_usd=excluded.liquidity_usd",
            params![
                snap.ts_minute,
                snap.provider,
                snap.market_id,
                snap.outcome_id,
                snap.probability,
                snap.spread_pp,
                snap.volume_24h_usd,
                snap.liquidity_usd,
            ],
        )?;
        Ok(())
    }

    /// Most recent tick present in snapshots.
    pub fn latest_snapshot_tick(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT MAX(ts_minute) FROM snapshots", [], |row| row.get(0))?)
    }

    /// All outcome keys + probabilities at a tick, for the delta engine.
    pub fn snapshots_at(&self, ts: DateTime<Utc>) -> Result<Vec<(String, String, String, f64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT provider, market_id, outcome_id, probability
             FROM snapshots WHERE ts_minute = ?1",
        )?;
        let rows = stmt
            .query_map(params![ts], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent probability for an outcome at or before the given time.
    /// This is the temporal-join primitive behind every windowed delta.
    pub fn probability_at_or_before(
        &self,
        provider: &str,
        market_id: &str,
        outcome_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let prob = conn
            .query_row(
                "SELECT probability FROM snapshots
                 WHERE provider = ?1 AND market_id = ?2 AND outcome_id = ?3
                   AND ts_minute <= ?4
                 ORDER BY ts_minute DESC LIMIT 1",
                params![provider, market_id, outcome_id, at],
                |row| row.get(0),
            )
            .optional()?;
        Ok(prob)
    }

    // ── Deltas (C4) ──────────────────────────────────────────────────────────

    pub fn upsert_delta(&self, row: &DeltaRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO deltas (ts_minute, provider, market_id, outcome_id,
                                 delta_1m, delta_5m, delta_10m, delta_30m,
                                 delta_1h, delta_6h, delta_12h, delta_24h)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(ts_minute, provider, market_id, outcome_id) DO UPDATE SET
                delta_1m=excluded.delta_1m,
                delta_5m=excluded.delta_5m,
                delta_10m=excluded.delta_10m,
                delta_30m=excluded.delta_30m,
                delta_1h=excluded.delta_1h,
                delta_6h=excluded.delta_6h,
                delta_12h=excluded.delta_12h,
                delta_24h=excluded.delta_24h",
            params![
                row.ts_minute,
                row.provider,
                row.market_id,
                row.outcome_id,
                row.deltas_pp[0],
                row.deltas_pp[1],
                row.deltas_pp[2],
                row.deltas_pp[3],
                row.deltas_pp[4],
                row.deltas_pp[5],
                row.deltas_pp[6],
                row.deltas_pp[7],
            ],
        )?;
        Ok(())
    }

    pub fn latest_delta_tick(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT MAX(ts_minute) FROM deltas", [], |row| row.get(0))?)
    }

    // ── Market profiles (C3) ─────────────────────────────────────────────────

    /// Markets with no profile, or a profile from a different model version.
    pub fn markets_needing_profile(
        &self,
        model_version: &str,
        limit: i64,
    ) -> Result<Vec<ProfileCandidate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.provider, m.market_id, m.title, m.raw_category,
                    m.normalized_category, m.metadata
             FROM markets m
             LEFT JOIN market_profiles p
               ON p.provider = m.provider AND p.market_id = m.market_id
             WHERE p.provider IS NULL OR p.model_version != ?1
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![model_version, limit], |row| {
                let metadata: String = row.get(5)?;
                Ok(ProfileCandidate {
                    provider: row.get(0)?,
                    market_id: row.get(1)?,
                    title: row.get(2)?,
                    raw_category: row.get(3)?,
                    normalized_category: row.get(4)?,
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn upsert_profile(&self, profile: &MarketProfile) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO market_profiles (provider, market_id, anchor_type,
                                          insider_possible, confidence,
                                          model_version, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(provider, market_id) DO UPDATE SET
                anchor_type=excluded.anchor_type,
                insider_possible=excluded.insider_possible,
                confidence=excluded.confidence,
                model_version=excluded.model_version,
                updated_at=excluded.updated_at",
            params![
                profile.provider,
                profile.market_id,
                profile.anchor_type.as_str(),
                profile.insider_possible,
                profile.confidence,
                profile.model_version,
                profile.updated_at,
            ],
        )?;
        Ok(())
    }

    // ── Classifications (C5) ─────────────────────────────────────────────────

    /// Joined rows for the classifier at one tick: delta + snapshot + market
    /// fields + optional profile.
    pub fn classification_inputs(&self, ts: DateTime<Utc>) -> Result<Vec<ClassificationInput>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT d.ts_minute, d.provider, d.market_id, d.outcome_id,
                    s.probability, s.spread_pp, s.volume_24h_usd, s.liquidity_usd,
                    m.title, m.raw_category, m.normalized_category,
                    d.{cols},
                    p.anchor_type, p.confidence
             FROM deltas d
             JOIN snapshots s
               ON s.ts_minute = d.ts_minute AND s.provider = d.provider
              AND s.market_id = d.market_id AND s.outcome_id = d.outcome_id
             JOIN markets m
               ON m.provider = d.provider AND m.market_id = d.market_id
             LEFT JOIN market_profiles p
               ON p.provider = d.provider AND p.market_id = d.market_id
             WHERE d.ts_minute = ?1",
            cols = DELTA_COLUMNS.replace(", ", ", d.")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![ts], |row| {
                let anchor: Option<String> = row.get(11 + WINDOW_COUNT)?;
                Ok(ClassificationInput {
                    ts_minute: row.get(0)?,
                    provider: row.get(1)?,
                    market_id: row.get(2)?,
                    outcome_id: row.get(3)?,
                    probability: row.get(4)?,
                    spread_pp: row.get(5)?,
                    volume_24h_usd: row.get(6)?,
                    liquidity_usd: row.get(7)?,
                    market_title: row.get(8)?,
                    raw_category: row.get(9)?,
                    normalized_category: row.get(10)?,
                    deltas_pp: read_delta_columns(row, 11)?,
                    anchor_type: anchor.as_deref().and_then(AnchorType::parse),
                    anchor_confidence: row.get(12 + WINDOW_COUNT)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn upsert_classification(&self, row: &ClassificationRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO classifications (ts_minute, provider, market_id, outcome_id,
                                          opaque_score, exogenous_score, label,
                                          reason_tags, model_version)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(ts_minute, provider, market_id, outcome_id) DO UPDATE SET
                opaque_score=excluded.opaque_score,
                exogenous_score=excluded.exogenous_score,
                label=excluded.label,
                reason_tags=excluded.reason_tags,
                model_version=excluded.model_version",
            params![
                row.ts_minute,
                row.provider,
                row.market_id,
                row.outcome_id,
                row.opaque_score,
                row.exogenous_score,
                row.label.as_str(),
                serde_json::to_string(&row.reason_tags).unwrap_or_else(|_| "[]".into()),
                row.model_version,
            ],
        )?;
        Ok(())
    }

    pub fn latest_classification_tick(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT MAX(ts_minute) FROM classifications", [], |row| row.get(0))?)
    }

    // ── Alerting (C7) ────────────────────────────────────────────────────────

    /// Opaque-labelled outcomes at the tick passing the liquidity/spread
    /// gates, ordered by short-window magnitude, bounded.
    pub fn alert_candidates(
        &self,
        ts: DateTime<Utc>,
        min_liquidity: f64,
        max_spread_pp: f64,
        cap: i64,
    ) -> Result<Vec<AlertCandidate>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT c.ts_minute, c.provider, c.market_id, c.outcome_id,
                    m.title, o.label, s.probability,
                    d.{cols},
                    c.label, c.reason_tags
             FROM classifications c
             JOIN snapshots s
               ON s.ts_minute = c.ts_minute AND s.provider = c.provider
              AND s.market_id = c.market_id AND s.outcome_id = c.outcome_id
             JOIN deltas d
               ON d.ts_minute = c.ts_minute AND d.provider = c.provider
              AND d.market_id = c.market_id AND d.outcome_id = c.outcome_id
             JOIN markets m
               ON m.provider = c.provider AND m.market_id = c.market_id
             JOIN outcomes o
               ON o.provider = c.provider AND o.market_id = c.market_id
              AND o.outcome_id = c.outcome_id
             WHERE c.ts_minute = ?1 AND c.label = 'opaque_info_sensitive'
               AND s.liquidity_usd >= ?2
               AND s.spread_pp <= ?3
             ORDER BY ABS(COALESCE(d.delta_1m, 0.0)) DESC
             LIMIT ?4",
            cols = DELTA_COLUMNS.replace(", ", ", d.")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![ts, min_liquidity, max_spread_pp, cap], |row| {
                let label: String = row.get(7 + WINDOW_COUNT)?;
                let tags: String = row.get(8 + WINDOW_COUNT)?;
                Ok(AlertCandidate {
                    ts_minute: row.get(0)?,
                    provider: row.get(1)?,
                    market_id: row.get(2)?,
                    outcome_id: row.get(3)?,
                    market_title: row.get(4)?,
                    outcome_label: row.get(5)?,
                    probability: row.get(6)?,
                    deltas_pp: read_delta_columns(row, 7)?,
                    label: MoveLabel::parse(&label).unwrap_or(MoveLabel::Unclear),
                    reason_tags: serde_json::from_str(&tags).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn alert_last_sent(&self, signature: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let at = conn
            .query_row(
                "SELECT last_sent_at FROM alert_state WHERE signature = ?1",
                params![signature],
                |row| row.get(0),
            )
            .optional()?;
        Ok(at)
    }

    pub fn record_alert_sent(&self, signature: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_state (signature, last_sent_at) VALUES (?1, ?2)
             ON CONFLICT(signature) DO UPDATE SET last_sent_at=excluded.last_sent_at",
            params![signature, at],
        )?;
        Ok(())
    }

    // ── Read API (C9) ────────────────────────────────────────────────────────

    /// Every classified outcome at the tick passing the requested filters.
    /// Grouping into market rows happens in the API layer.
    pub fn mover_rows(
        &self,
        ts: DateTime<Utc>,
        providers: &[String],
        category: Option<&str>,
        label: Option<MoveLabel>,
        liquidity_gate: Option<(f64, f64)>,
    ) -> Result<Vec<MoverRow>> {
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; providers.len()].join(",");
        let mut sql = format!(
            "SELECT d.ts_minute, d.provider, d.market_id, m.title,
                    m.normalized_category, m.metadata,
                    d.outcome_id, o.label, s.probability, s.spread_pp,
                    s.volume_24h_usd, s.liquidity_usd,
                    d.{cols},
                    c.label, c.reason_tags
             FROM deltas d
             JOIN snapshots s
               ON s.ts_minute = d.ts_minute AND s.provider = d.provider
              AND s.market_id = d.market_id AND s.outcome_id = d.outcome_id
             JOIN markets m
               ON m.provider = d.provider AND m.market_id = d.market_id
             JOIN outcomes o
               ON o.provider = d.provider AND o.market_id = d.market_id
              AND o.outcome_id = d.outcome_id
             JOIN classifications c
               ON c.ts_minute = d.ts_minute AND c.provider = d.provider
              AND c.market_id = d.market_id AND c.outcome_id = d.outcome_id
             WHERE d.ts_minute = ?1 AND d.provider IN ({placeholders})",
            cols = DELTA_COLUMNS.replace(", ", ", d."),
        );
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        values.push(ts.to_rfc3339().into());
        for p in providers {
            values.push(p.clone().into());
        }
        if let Some(cat) = category {
            sql.push_str(" AND m.normalized_category = ?");
            values.push(cat.to_string().into());
        }
        if let Some(label) = label {
            sql.push_str(" AND c.label = ?");
            values.push(label.as_str().to_string().into());
        }
        if let Some((min_liquidity, max_spread)) = liquidity_gate {
            sql.push_str(" AND s.liquidity_usd >= ? AND s.spread_pp <= ?");
            values.push(min_liquidity.into());
            values.push(max_spread.into());
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                let metadata: String = row.get(5)?;
                let label: String = row.get(12 + WINDOW_COUNT)?;
                let tags: String = row.get(13 + WINDOW_COUNT)?;
                Ok(MoverRow {
                    ts_minute: row.get(0)?,
                    provider: row.get(1)?,
                    market_id: row.get(2)?,
                    market_title: row.get(3)?,
                    normalized_category: row.get(4)?,
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                    outcome_id: row.get(6)?,
                    outcome_label: row.get(7)?,
                    probability: row.get(8)?,
                    spread_pp: row.get(9)?,
                    volume_24h_usd: row.get(10)?,
                    liquidity_usd: row.get(11)?,
                    deltas_pp: read_delta_columns(row, 12)?,
                    label: MoveLabel::parse(&label).unwrap_or(MoveLabel::Unclear),
                    reason_tags: serde_json::from_str(&tags).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Drop time-series rows older than the cutoff. Markets, outcomes, and
    /// profiles are kept; only the rolling history is bounded.
    pub fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut deleted = 0usize;
        for table in ["snapshots", "deltas", "classifications"] {
            deleted += conn.execute(
                &format!("DELETE FROM {table} WHERE ts_minute < ?1"),
                params![cutoff],
            )?;
        }
        Ok(deleted)
    }

    /// Row counts for the health endpoint.
    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn.lock().unwrap();
        let markets: i64 =
            conn.query_row("SELECT COUNT(*) FROM markets", [], |r| r.get(0))?;
        let outcomes: i64 =
            conn.query_row("SELECT COUNT(*) FROM outcomes", [], |r| r.get(0))?;
        let snapshots: i64 =
            conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))?;
        let latest_tick: Option<DateTime<Utc>> =
            conn.query_row("SELECT MAX(ts_minute) FROM snapshots", [], |r| r.get(0))?;
        Ok(StoreCounts {
            markets,
            outcomes,
            snapshots,
            latest_tick,
        })
    }
}

/// Read WINDOW_COUNT nullable delta columns starting at the given index.
fn read_delta_columns(
    row: &rusqlite::Row,
    start: usize,
) -> rusqlite::Result<[Option<f64>; WINDOW_COUNT]> {
    let mut out = [None; WINDOW_COUNT];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = row.get(start + i)?;
    }
    Ok(out)
}

/// Sanity check: the literal column list matches the canonical window set.
#[allow(dead_code)]
fn delta_columns_match_windows() -> bool {
    DELTA_COLUMNS
        .split(", ")
        .zip(WINDOWS.iter())
        .all(|(col, w)| col == w.column)
        && DELTA_COLUMNS.split(", ").count() == WINDOW_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, min, 0).unwrap()
    }

    fn snap(ts: DateTime<Utc>, outcome: &str, prob: f64) -> OutcomeSnapshot {
        OutcomeSnapshot {
            ts_minute: ts,
            provider: "kalshi".into(),
            market_id: "MKT-1".into(),
            outcome_id: outcome.into(),
            outcome_label: outcome.to_uppercase(),
            probability: prob,
            spread_pp: Some(4.0),
            volume_24h_usd: Some(25_000.0),
            liquidity_usd: Some(8_000.0),
            market_title: "Will the CPI print above 3%?".into(),
            raw_category: Some("Economics".into()),
            normalized_category: "macro".into(),
            market_status: "active".into(),
            metadata: serde_json::json!({"event_ticker": "CPI"}),
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        // A second pass over an already-migrated schema is a no-op.
        db.migrate().unwrap();
        let counts = db.counts().unwrap();
        assert_eq!(counts.markets, 0);
    }

    #[test]
    fn delta_columns_stay_in_sync_with_window_set() {
        assert!(delta_columns_match_windows());
    }

    #[test]
    fn snapshot_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let s = snap(tick(0), "yes", 0.62);
        db.upsert_snapshot(&s).unwrap();
        db.upsert_snapshot(&s).unwrap();
        let counts = db.counts().unwrap();
        assert_eq!(counts.markets, 1);
        assert_eq!(counts.outcomes, 1);
        assert_eq!(counts.snapshots, 1);
        assert_eq!(counts.latest_tick, Some(tick(0)));
    }

    #[test]
    fn temporal_lookup_picks_most_recent_prior() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_snapshot(&snap(tick(0), "yes", 0.50)).unwrap();
        db.upsert_snapshot(&snap(tick(3), "yes", 0.55)).unwrap();
        db.upsert_snapshot(&snap(tick(10), "yes", 0.70)).unwrap();

        // At-or-before minute 5: the minute-3 snapshot wins over minute 0.
        let p = db
            .probability_at_or_before("kalshi", "MKT-1", "yes", tick(5))
            .unwrap();
        assert_eq!(p, Some(0.55));

        // Before any snapshot: nothing.
        let p = db
            .probability_at_or_before("kalshi", "MKT-1", "yes", tick(0) - chrono::Duration::minutes(1))
            .unwrap();
        assert_eq!(p, None);
    }

    #[test]
    fn profile_roundtrip_and_reprofiling_on_version_change() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_snapshot(&snap(tick(0), "yes", 0.5)).unwrap();

        let pending = db.markets_needing_profile("anchor-v2", 600).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].market_id, "MKT-1");

        db.upsert_profile(&MarketProfile {
            provider: "kalshi".into(),
            market_id: "MKT-1".into(),
            anchor_type: AnchorType::ScheduledMacroRelease,
            insider_possible: true,
            confidence: 0.8,
            model_version: "anchor-v2".into(),
            updated_at: Utc::now(),
        })
        .unwrap();
        assert!(db.markets_needing_profile("anchor-v2", 600).unwrap().is_empty());

        // A new active model version makes the market eligible again.
        assert_eq!(db.markets_needing_profile("anchor-v3", 600).unwrap().len(), 1);
    }

    #[test]
    fn alert_state_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let sig = "kalshi:MKT-1:yes:30m:UP";
        assert_eq!(db.alert_last_sent(sig).unwrap(), None);
        db.record_alert_sent(sig, tick(0)).unwrap();
        assert_eq!(db.alert_last_sent(sig).unwrap(), Some(tick(0)));
        db.record_alert_sent(sig, tick(45)).unwrap();
        assert_eq!(db.alert_last_sent(sig).unwrap(), Some(tick(45)));
    }

    #[test]
    fn alert_candidates_apply_gates_and_ordering() {
        let db = Database::open_in_memory().unwrap();
        for (outcome, prob, liq) in [("yes", 0.62, 8_000.0), ("no", 0.38, 100.0)] {
            let mut s = snap(tick(0), outcome, prob);
            s.liquidity_usd = Some(liq);
            db.upsert_snapshot(&s).unwrap();
        }
        for (outcome, d1) in [("yes", Some(7.0)), ("no", Some(-7.0))] {
            let mut deltas = [None; WINDOW_COUNT];
            deltas[0] = d1;
            db.upsert_delta(&DeltaRow {
                ts_minute: tick(0),
                provider: "kalshi".into(),
                market_id: "MKT-1".into(),
                outcome_id: outcome.into(),
                deltas_pp: deltas,
            })
            .unwrap();
            db.upsert_classification(&ClassificationRow {
                ts_minute: tick(0),
                provider: "kalshi".into(),
                market_id: "MKT-1".into(),
                outcome_id: outcome.into(),
                opaque_score: 70.0,
                exogenous_score: 10.0,
                label: MoveLabel::OpaqueInfoSensitive,
                reason_tags: vec!["tight_spread".into()],
                model_version: "anchor-v2".into(),
            })
            .unwrap();
        }

        // The low-liquidity "no" outcome is gated out.
        let candidates = db.alert_candidates(tick(0), 1_000.0, 10.0, 500).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].outcome_id, "yes");
        assert_eq!(candidates[0].deltas_pp[0], Some(7.0));
        assert_eq!(candidates[0].reason_tags, vec!["tight_spread".to_string()]);
    }

    #[test]
    fn mover_rows_filter_by_provider_and_label() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_snapshot(&snap(tick(0), "yes", 0.62)).unwrap();
        let mut deltas = [None; WINDOW_COUNT];
        deltas[4] = Some(12.0);
        db.upsert_delta(&DeltaRow {
            ts_minute: tick(0),
            provider: "kalshi".into(),
            market_id: "MKT-1".into(),
            outcome_id: "yes".into(),
            deltas_pp: deltas,
        })
        .unwrap();
        db.upsert_classification(&ClassificationRow {
            ts_minute: tick(0),
            provider: "kalshi".into(),
            market_id: "MKT-1".into(),
            outcome_id: "yes".into(),
            opaque_score: 70.0,
            exogenous_score: 10.0,
            label: MoveLabel::OpaqueInfoSensitive,
            reason_tags: vec![],
            model_version: "anchor-v2".into(),
        })
        .unwrap();

        let rows = db
            .mover_rows(tick(0), &["kalshi".into()], None, None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].deltas_pp[4], Some(12.0));

        let rows = db
            .mover_rows(tick(0), &["polymarket".into()], None, None, None)
            .unwrap();
        assert!(rows.is_empty());

        let rows = db
            .mover_rows(
                tick(0),
                &["kalshi".into()],
                None,
                Some(MoveLabel::ExogenousArbitrage),
                None,
            )
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn prune_drops_only_old_time_series_rows() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_snapshot(&snap(tick(0), "yes", 0.5)).unwrap();
        db.upsert_snapshot(&snap(tick(30), "yes", 0.6)).unwrap();
        let deleted = db.prune_history(tick(10)).unwrap();
        assert_eq!(deleted, 1);
        let counts = db.counts().unwrap();
        assert_eq!(counts.snapshots, 1);
        assert_eq!(counts.markets, 1);
    }
}
