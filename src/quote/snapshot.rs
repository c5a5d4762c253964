//! Quote snapshot persistence: one row per issued quote for traceability.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::quote::models::QuoteResult;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS quote_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_key TEXT NOT NULL,
    provider TEXT NOT NULL,
    cost_source TEXT,
    cost_version TEXT,
    pricing_rule_version TEXT,
    total_fee REAL NOT NULL,
    latency_ms INTEGER NOT NULL,
    provider_chain TEXT,
    fallback_reason TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_key ON quote_snapshots(cache_key, created_at DESC);
"#;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRow {
    pub id: i64,
    pub cache_key: String,
    pub provider: String,
    pub cost_source: String,
    pub cost_version: String,
    pub pricing_rule_version: String,
    pub total_fee: f64,
    pub latency_ms: i64,
    pub provider_chain: Vec<String>,
    pub fallback_reason: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStats {
    pub total: i64,
    pub fallback_count: i64,
    pub avg_latency_ms: f64,
    pub by_provider: Vec<(String, i64)>,
}

pub struct QuoteSnapshotStore {
    conn: Mutex<Connection>,
}

impl QuoteSnapshotStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot db dir {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("open snapshot db {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("init snapshot schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, cache_key: &str, result: &QuoteResult) -> Result<()> {
        let Some(snapshot) = &result.snapshot else {
            return Ok(());
        };
        let now = chrono::Utc::now().timestamp();
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO quote_snapshots(
                    cache_key, provider, cost_source, cost_version, pricing_rule_version,
                    total_fee, latency_ms, provider_chain, fallback_reason, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    cache_key,
                    result.provider,
                    snapshot.cost_source,
                    snapshot.cost_version,
                    snapshot.pricing_rule_version,
                    result.total_fee,
                    snapshot.latency_ms as i64,
                    snapshot.provider_chain.join(","),
                    snapshot.fallback_reason,
                    now,
                ],
            )
            .context("insert quote snapshot")?;
        Ok(())
    }

    pub fn latest(&self, cache_key: &str) -> Result<Option<SnapshotRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, cache_key, provider, cost_source, cost_version, pricing_rule_version,
                        total_fee, latency_ms, provider_chain, fallback_reason, created_at
                 FROM quote_snapshots WHERE cache_key = ?1 ORDER BY id DESC LIMIT 1",
                params![cache_key],
                Self::map_row,
            )
            .optional()
            .context("query latest snapshot")?;
        Ok(row)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, cache_key, provider, cost_source, cost_version, pricing_rule_version,
                    total_fee, latency_ms, provider_chain, fallback_reason, created_at
             FROM quote_snapshots ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit.max(1) as i64], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query recent snapshots")?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<SnapshotStats> {
        let conn = self.conn.lock();
        let (total, fallback_count, avg_latency_ms): (i64, i64, f64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN fallback_reason != '' THEN 1 ELSE 0 END), 0),
                    COALESCE(AVG(latency_ms), 0.0)
             FROM quote_snapshots",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let mut stmt =
            conn.prepare("SELECT provider, COUNT(*) FROM quote_snapshots GROUP BY provider")?;
        let by_provider = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(SnapshotStats {
            total,
            fallback_count,
            avg_latency_ms,
            by_provider,
        })
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
        let chain: String = row.get(8)?;
        Ok(SnapshotRow {
            id: row.get(0)?,
            cache_key: row.get(1)?,
            provider: row.get(2)?,
            cost_source: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            cost_version: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            pricing_rule_version: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            total_fee: row.get(6)?,
            latency_ms: row.get(7)?,
            provider_chain: if chain.is_empty() {
                Vec::new()
            } else {
                chain.split(',').map(|s| s.to_string()).collect()
            },
            fallback_reason: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            created_at: row.get(10)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::models::QuoteSnapshot;
    use std::collections::BTreeMap;

    fn result_with_snapshot() -> QuoteResult {
        QuoteResult {
            provider: "rule_table".into(),
            base_fee: 8.0,
            surcharges: BTreeMap::new(),
            total_fee: 12.0,
            currency: "CNY".into(),
            eta_minutes: 2880,
            confidence: 0.9,
            explain: serde_json::Map::new(),
            fallback_used: true,
            cache_hit: false,
            stale: false,
            snapshot: Some(QuoteSnapshot {
                cost_source: "cost_table".into(),
                cost_version: "local".into(),
                pricing_rule_version: "v1.2".into(),
                latency_ms: 12,
                provider_chain: vec!["hot_cache_miss".into(), "cost_table".into()],
                fallback_reason: "Remote provider timeout".into(),
            }),
        }
    }

    #[test]
    fn save_and_read_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuoteSnapshotStore::open(dir.path().join("snapshots.db")).unwrap();
        store.save("k1", &result_with_snapshot()).unwrap();
        let row = store.latest("k1").unwrap().unwrap();
        assert_eq!(row.provider, "rule_table");
        assert_eq!(row.provider_chain, vec!["hot_cache_miss", "cost_table"]);
        assert_eq!(row.fallback_reason, "Remote provider timeout");
    }

    #[test]
    fn snapshotless_result_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuoteSnapshotStore::open(dir.path().join("snapshots.db")).unwrap();
        let mut result = result_with_snapshot();
        result.snapshot = None;
        store.save("k1", &result).unwrap();
        assert!(store.latest("k1").unwrap().is_none());
    }
}
