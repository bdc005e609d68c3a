//! Activity Store: agents, their transactions, score history and alerts.
//!
//! One SQLite connection behind a mutex. Every public method takes the lock
//! for the whole operation, so multi-statement writes (a scoring cycle) are
//! never observed half-done.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use trustgraph_core::alerts::AlertDraft;
use trustgraph_core::{
    Address, Agent, AgentStatus, Alert, Transaction, TrustError, TrustScoreFactors,
    TrustScoreSnapshot, EXCELLENT_SCORE, GOOD_SCORE, NEUTRAL_SCORE, WARNING_SCORE,
};

// ============================================================================
// Query / summary types
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub agent:           Option<Address>,
    pub unresolved_only: bool,
    pub limit:           usize,
}

/// Agent counts per trust band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrustDistribution {
    pub excellent: usize,
    pub good:      usize,
    pub fair:      usize,
    pub poor:      usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_agents:       usize,
    pub active_agents:      usize,
    pub total_transactions: usize,
    pub open_alerts:        usize,
    /// Mean `trust_score` over all agents; `None` with no agents.
    pub avg_trust_score:    Option<f64>,
    pub trust_distribution: TrustDistribution,
}

/// Everything one scoring cycle writes.
#[derive(Debug, Clone, Copy)]
pub struct CycleWrite<'a> {
    pub score:      f64,
    pub factors:    &'a TrustScoreFactors,
    pub narrative:  &'a str,
    pub confidence: f64,
    /// Transaction hashes to flag as analyzed.
    pub analyzed:   &'a [String],
    pub alerts:     &'a [AlertDraft],
}

#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub snapshot: TrustScoreSnapshot,
    pub alerts:   Vec<Alert>,
}

// ============================================================================
// SQLite persistence layer
// ============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    address     TEXT    PRIMARY KEY,
    name        TEXT    NOT NULL,
    category    TEXT    NOT NULL,
    trust_score REAL    NOT NULL,
    status      TEXT    NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    hash         TEXT    PRIMARY KEY,
    agent        TEXT    NOT NULL,
    from_addr    TEXT    NOT NULL,
    to_addr      TEXT,
    value        TEXT    NOT NULL,
    gas_used     TEXT,
    gas_price    TEXT,
    status       TEXT    NOT NULL,
    chain_id     INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    ts           INTEGER NOT NULL,
    analyzed     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tx_agent_ts ON transactions(agent, ts);

CREATE TABLE IF NOT EXISTS trust_scores (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    agent      TEXT    NOT NULL,
    score      REAL    NOT NULL,
    factors    TEXT    NOT NULL,
    narrative  TEXT    NOT NULL,
    confidence REAL    NOT NULL,
    ts         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ts_agent_ts ON trust_scores(agent, ts);

CREATE TABLE IF NOT EXISTS alerts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    agent       TEXT    NOT NULL,
    alert_type  TEXT    NOT NULL,
    severity    TEXT    NOT NULL,
    rule        TEXT    NOT NULL,
    message     TEXT    NOT NULL,
    details     TEXT    NOT NULL,
    resolved    INTEGER NOT NULL DEFAULT 0,
    resolved_at INTEGER,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_agent ON alerts(agent, resolved);

PRAGMA journal_mode = WAL;
PRAGMA synchronous  = NORMAL;
";

const AGENT_COLUMNS: &str =
    "address, name, category, trust_score, status, created_at, updated_at";
const TX_COLUMNS: &str = "hash, agent, from_addr, to_addr, value, gas_used, gas_price, \
     status, chain_id, block_number, ts, analyzed";
const SNAPSHOT_COLUMNS: &str = "id, agent, score, factors, narrative, confidence, ts";
const ALERT_COLUMNS: &str = "id, agent, alert_type, severity, rule, message, details, \
     resolved, resolved_at, created_at";

struct Db(rusqlite::Connection);

impl Db {
    fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db(conn))
    }

    fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db(conn))
    }

    // ── agents ──────────────────────────────────────────────────────────────

    /// Returns true when a new row was created.
    fn insert_agent(&self, address: &str, name: &str, category: &str, now: u64) -> rusqlite::Result<bool> {
        let n = self.0.execute(
            "INSERT OR IGNORE INTO agents
                 (address, name, category, trust_score, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![address, name, category, NEUTRAL_SCORE, AgentStatus::Active.as_str(), now as i64],
        )?;
        Ok(n == 1)
    }

    fn query_agent(&self, address: &str) -> rusqlite::Result<Option<Agent>> {
        self.0
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE address = ?1"),
                params![address],
                row_to_agent,
            )
            .optional()
    }

    fn query_agents(&self, status: Option<AgentStatus>) -> rusqlite::Result<Vec<Agent>> {
        let mut stmt = self.0.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY trust_score DESC, address ASC"
        ))?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], row_to_agent)?;
        rows.collect()
    }

    fn count_agents(&self) -> rusqlite::Result<usize> {
        let n: i64 = self.0.query_row("SELECT COUNT(*) FROM agents", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn update_status(&self, address: &str, status: AgentStatus, now: u64) -> rusqlite::Result<usize> {
        self.0.execute(
            "UPDATE agents SET status = ?2, updated_at = ?3 WHERE address = ?1",
            params![address, status.as_str(), now as i64],
        )
    }

    // ── transactions ────────────────────────────────────────────────────────

    /// Insert every unseen transaction in one SQLite transaction and return
    /// the ones that were new.
    fn insert_transactions(&mut self, txs: &[Transaction]) -> rusqlite::Result<Vec<Transaction>> {
        let sql_tx = self.0.transaction()?;
        let mut inserted = Vec::new();
        {
            let mut stmt = sql_tx.prepare(&format!(
                "INSERT OR IGNORE INTO transactions ({TX_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ))?;
            for tx in txs {
                let n = stmt.execute(params![
                    tx.hash,
                    tx.agent,
                    tx.from,
                    tx.to,
                    tx.value.to_string(),
                    tx.gas_used.map(|v| v.to_string()),
                    tx.gas_price.map(|v| v.to_string()),
                    tx.status.as_str(),
                    tx.chain_id as i64,
                    tx.block_number as i64,
                    tx.timestamp as i64,
                    tx.analyzed,
                ])?;
                if n == 1 {
                    inserted.push(tx.clone());
                }
            }
        }
        sql_tx.commit()?;
        Ok(inserted)
    }

    fn query_transactions(&self, agent: &str, limit: usize) -> rusqlite::Result<Vec<Transaction>> {
        let mut stmt = self.0.prepare(&format!(
            "SELECT {TX_COLUMNS} FROM transactions
             WHERE agent = ?1
             ORDER BY ts DESC, block_number DESC, hash ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![agent, limit as i64], row_to_transaction)?;
        rows.collect()
    }

    fn query_transaction(&self, hash: &str) -> rusqlite::Result<Option<Transaction>> {
        self.0
            .query_row(
                &format!("SELECT {TX_COLUMNS} FROM transactions WHERE hash = ?1"),
                params![hash],
                row_to_transaction,
            )
            .optional()
    }

    fn count_transactions(&self, agent: Option<&str>) -> rusqlite::Result<usize> {
        let n: i64 = self.0.query_row(
            "SELECT COUNT(*) FROM transactions WHERE (?1 IS NULL OR agent = ?1)",
            params![agent],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    fn latest_transaction_ts(&self, agent: &str) -> rusqlite::Result<Option<u64>> {
        let ts: Option<i64> = self.0.query_row(
            "SELECT MAX(ts) FROM transactions WHERE agent = ?1",
            params![agent],
            |r| r.get(0),
        )?;
        Ok(ts.map(|t| t as u64))
    }

    // ── scoring cycles ──────────────────────────────────────────────────────

    /// Snapshot, agent score, analyzed flags and alerts in one SQLite
    /// transaction. Any failure rolls the whole cycle back.
    fn commit_cycle(&mut self, agent: &str, write: &CycleWrite<'_>, now: u64) -> rusqlite::Result<CycleRecord> {
        let sql_tx = self.0.transaction()?;
        let snapshot = write_snapshot(&sql_tx, agent, write, now)?;
        {
            let mut stmt = sql_tx.prepare("UPDATE transactions SET analyzed = 1 WHERE hash = ?1")?;
            for hash in write.analyzed {
                stmt.execute(params![hash])?;
            }
        }
        let alerts = write
            .alerts
            .iter()
            .map(|draft| write_alert(&sql_tx, agent, draft, snapshot.timestamp))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        sql_tx.commit()?;
        Ok(CycleRecord { snapshot, alerts })
    }

    /// Newest first.
    fn query_snapshots(&self, agent: &str, limit: usize) -> rusqlite::Result<Vec<TrustScoreSnapshot>> {
        let mut stmt = self.0.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM trust_scores
             WHERE agent = ?1
             ORDER BY ts DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![agent, limit as i64], row_to_snapshot)?;
        rows.collect()
    }

    // ── alerts ──────────────────────────────────────────────────────────────

    fn query_alerts(&self, agent: Option<&str>, unresolved_only: bool, limit: usize) -> rusqlite::Result<Vec<Alert>> {
        let mut stmt = self.0.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE (?1 IS NULL OR agent = ?1) AND (?2 = 0 OR resolved = 0)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![agent, unresolved_only, limit as i64], row_to_alert)?;
        rows.collect()
    }

    fn query_alert(&self, id: i64) -> rusqlite::Result<Option<Alert>> {
        self.0
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                params![id],
                row_to_alert,
            )
            .optional()
    }

    fn mark_resolved(&self, id: i64, now: u64) -> rusqlite::Result<()> {
        self.0.execute(
            "UPDATE alerts SET resolved = 1, resolved_at = ?2 WHERE id = ?1 AND resolved = 0",
            params![id, now as i64],
        )?;
        Ok(())
    }

    fn count_open_alerts(&self) -> rusqlite::Result<usize> {
        let n: i64 = self.0.query_row("SELECT COUNT(*) FROM alerts WHERE resolved = 0", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

// ── cycle writers ───────────────────────────────────────────────────────────

fn write_snapshot(
    conn: &rusqlite::Connection,
    agent: &str,
    write: &CycleWrite<'_>,
    now: u64,
) -> rusqlite::Result<TrustScoreSnapshot> {
    let factors_json = serde_json::to_string(write.factors)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    // Never order a new snapshot before an existing one, even if the wall
    // clock stepped backwards.
    let prev: Option<i64> = conn.query_row(
        "SELECT MAX(ts) FROM trust_scores WHERE agent = ?1",
        params![agent],
        |r| r.get(0),
    )?;
    let ts = now.max(prev.unwrap_or(0) as u64);

    conn.execute(
        "INSERT INTO trust_scores (agent, score, factors, narrative, confidence, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![agent, write.score, factors_json, write.narrative, write.confidence, ts as i64],
    )?;
    let id = conn.last_insert_rowid();

    let updated = conn.execute(
        "UPDATE agents SET trust_score = ?2, updated_at = ?3 WHERE address = ?1",
        params![agent, write.score, ts as i64],
    )?;
    if updated == 0 {
        // Unknown agent; the caller's transaction rolls the snapshot back.
        return Err(rusqlite::Error::QueryReturnedNoRows);
    }

    Ok(TrustScoreSnapshot {
        id,
        agent: agent.to_string(),
        score: write.score,
        factors: *write.factors,
        narrative: write.narrative.to_string(),
        confidence: write.confidence,
        timestamp: ts,
    })
}

fn write_alert(conn: &rusqlite::Connection, agent: &str, draft: &AlertDraft, now: u64) -> rusqlite::Result<Alert> {
    let details = serde_json::to_string(&draft.details)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO alerts (agent, alert_type, severity, rule, message, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            agent,
            draft.alert_type.as_str(),
            draft.severity.as_str(),
            draft.rule,
            draft.message,
            details,
            now as i64,
        ],
    )?;
    Ok(Alert {
        id:          conn.last_insert_rowid(),
        agent:       agent.to_string(),
        alert_type:  draft.alert_type,
        severity:    draft.severity,
        rule:        draft.rule.clone(),
        message:     draft.message.clone(),
        details:     draft.details.clone(),
        resolved:    false,
        resolved_at: None,
        created_at:  now,
    })
}

// ── row mapping ─────────────────────────────────────────────────────────────

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| conversion_err(idx, e))
}

fn opt_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: Option<String> = row.get(idx)?;
    s.map(|s| s.parse::<T>().map_err(|e| conversion_err(idx, e))).transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        address:     row.get(0)?,
        name:        row.get(1)?,
        category:    row.get(2)?,
        trust_score: row.get(3)?,
        status:      parsed(row, 4)?,
        created_at:  row.get::<_, i64>(5)? as u64,
        updated_at:  row.get::<_, i64>(6)? as u64,
    })
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        hash:         row.get(0)?,
        agent:        row.get(1)?,
        from:         row.get(2)?,
        to:           row.get(3)?,
        value:        parsed(row, 4)?,
        gas_used:     opt_parsed(row, 5)?,
        gas_price:    opt_parsed(row, 6)?,
        status:       parsed(row, 7)?,
        chain_id:     row.get::<_, i64>(8)? as u64,
        block_number: row.get::<_, i64>(9)? as u64,
        timestamp:    row.get::<_, i64>(10)? as u64,
        analyzed:     row.get(11)?,
    })
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<TrustScoreSnapshot> {
    Ok(TrustScoreSnapshot {
        id:         row.get(0)?,
        agent:      row.get(1)?,
        score:      row.get(2)?,
        factors:    json_col(row, 3)?,
        narrative:  row.get(4)?,
        confidence: row.get(5)?,
        timestamp:  row.get::<_, i64>(6)? as u64,
    })
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id:          row.get(0)?,
        agent:       row.get(1)?,
        alert_type:  parsed(row, 2)?,
        severity:    parsed(row, 3)?,
        rule:        row.get(4)?,
        message:     row.get(5)?,
        details:     json_col(row, 6)?,
        resolved:    row.get(7)?,
        resolved_at: row.get::<_, Option<i64>>(8)?.map(|t| t as u64),
        created_at:  row.get::<_, i64>(9)? as u64,
    })
}

// ============================================================================
// ActivityStore
// ============================================================================

#[derive(Clone)]
pub struct ActivityStore {
    db: Arc<Mutex<Db>>,
}

impl ActivityStore {
    /// Volatile store; everything is lost on restart.
    pub fn in_memory() -> anyhow::Result<Self> {
        let db = Db::open_in_memory().map_err(|e| anyhow::anyhow!("SQLite open failed: {e}"))?;
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    /// Open (or create) a SQLite database at `path`.
    pub fn with_db(path: &Path) -> anyhow::Result<Self> {
        let db = Db::open(path).map_err(|e| anyhow::anyhow!("SQLite open failed: {e}"))?;
        let agents = db
            .count_agents()
            .map_err(|e| anyhow::anyhow!("SQLite load failed: {e}"))?;
        tracing::info!("Opened activity store at {} ({} agents)", path.display(), agents);
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    fn with<T>(&self, op: &str, f: impl FnOnce(&mut Db) -> rusqlite::Result<T>) -> Result<T, TrustError> {
        let mut db = self
            .db
            .lock()
            .map_err(|_| TrustError::Persistence(format!("{op}: store lock poisoned")))?;
        f(&mut db).map_err(|e| TrustError::Persistence(format!("{op}: {e}")))
    }

    // ── agents ──────────────────────────────────────────────────────────────

    /// Register an agent. Returns the stored row and whether it was created;
    /// an existing agent is returned unchanged.
    pub fn register_agent(
        &self,
        address: &Address,
        name: &str,
        category: &str,
    ) -> Result<(Agent, bool), TrustError> {
        let now = now_secs();
        self.with("register_agent", |db| {
            let created = db.insert_agent(address.as_str(), name, category, now)?;
            let agent = db
                .query_agent(address.as_str())?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            Ok((agent, created))
        })
    }

    pub fn get_agent(&self, address: &Address) -> Result<Option<Agent>, TrustError> {
        self.with("get_agent", |db| db.query_agent(address.as_str()))
    }

    /// Highest trust score first.
    pub fn list_agents(&self, status: Option<AgentStatus>) -> Result<Vec<Agent>, TrustError> {
        self.with("list_agents", |db| db.query_agents(status))
    }

    /// Returns the updated agent, or `None` when unknown.
    pub fn set_status(&self, address: &Address, status: AgentStatus) -> Result<Option<Agent>, TrustError> {
        let now = now_secs();
        self.with("set_status", |db| {
            if db.update_status(address.as_str(), status, now)? == 0 {
                return Ok(None);
            }
            db.query_agent(address.as_str())
        })
    }

    // ── transactions ────────────────────────────────────────────────────────

    /// Store `txs`, skipping hashes already present. Returns the new ones.
    pub fn insert_transactions(&self, txs: &[Transaction]) -> Result<Vec<Transaction>, TrustError> {
        if txs.is_empty() {
            return Ok(Vec::new());
        }
        self.with("insert_transactions", |db| db.insert_transactions(txs))
    }

    /// Most recent `limit` transactions, newest first.
    pub fn recent_transactions(&self, agent: &Address, limit: usize) -> Result<Vec<Transaction>, TrustError> {
        self.with("recent_transactions", |db| db.query_transactions(agent.as_str(), limit))
    }

    pub fn get_transaction(&self, hash: &str) -> Result<Option<Transaction>, TrustError> {
        self.with("get_transaction", |db| db.query_transaction(hash))
    }

    pub fn transaction_count(&self, agent: &Address) -> Result<usize, TrustError> {
        self.with("transaction_count", |db| db.count_transactions(Some(agent.as_str())))
    }

    pub fn latest_transaction_ts(&self, agent: &Address) -> Result<Option<u64>, TrustError> {
        self.with("latest_transaction_ts", |db| db.latest_transaction_ts(agent.as_str()))
    }

    // ── scoring cycles ──────────────────────────────────────────────────────

    /// Persist one scoring cycle atomically: append the snapshot, set the
    /// agent's `trust_score`, flag `write.analyzed` and insert the alerts.
    /// Fails (and writes nothing) for an unknown agent.
    pub fn commit_cycle(&self, agent: &Address, write: &CycleWrite<'_>) -> Result<CycleRecord, TrustError> {
        let now = now_secs();
        self.with("commit_cycle", |db| db.commit_cycle(agent.as_str(), write, now))
    }

    pub fn latest_snapshot(&self, agent: &Address) -> Result<Option<TrustScoreSnapshot>, TrustError> {
        self.with("latest_snapshot", |db| {
            Ok(db.query_snapshots(agent.as_str(), 1)?.into_iter().next())
        })
    }

    /// Newest first.
    pub fn recent_snapshots(&self, agent: &Address, limit: usize) -> Result<Vec<TrustScoreSnapshot>, TrustError> {
        self.with("recent_snapshots", |db| db.query_snapshots(agent.as_str(), limit))
    }

    // ── alerts ──────────────────────────────────────────────────────────────

    pub fn open_alerts(&self, agent: &Address) -> Result<Vec<Alert>, TrustError> {
        self.with("open_alerts", |db| db.query_alerts(Some(agent.as_str()), true, i64::MAX as usize))
    }

    /// Newest first.
    pub fn alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, TrustError> {
        self.with("alerts", |db| {
            db.query_alerts(
                filter.agent.as_ref().map(Address::as_str),
                filter.unresolved_only,
                filter.limit,
            )
        })
    }

    /// Mark an alert resolved. Resolving twice keeps the first `resolved_at`.
    /// Returns `None` for an unknown id.
    pub fn resolve_alert(&self, id: i64) -> Result<Option<Alert>, TrustError> {
        let now = now_secs();
        self.with("resolve_alert", |db| {
            db.mark_resolved(id, now)?;
            db.query_alert(id)
        })
    }

    // ── stats ───────────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats, TrustError> {
        self.with("stats", |db| {
            let agents = db.query_agents(None)?;
            let total_transactions = db.count_transactions(None)?;
            let open_alerts = db.count_open_alerts()?;

            let mut dist = TrustDistribution::default();
            for a in &agents {
                match a.trust_score {
                    s if s >= EXCELLENT_SCORE => dist.excellent += 1,
                    s if s >= GOOD_SCORE => dist.good += 1,
                    s if s >= WARNING_SCORE => dist.fair += 1,
                    _ => dist.poor += 1,
                }
            }
            let avg_trust_score = (!agents.is_empty())
                .then(|| agents.iter().map(|a| a.trust_score).sum::<f64>() / agents.len() as f64);

            Ok(StoreStats {
                total_agents: agents.len(),
                active_agents: agents.iter().filter(|a| a.status == AgentStatus::Active).count(),
                total_transactions,
                open_alerts,
                avg_trust_score,
                trust_distribution: dist,
            })
        })
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustgraph_core::{AlertType, Severity, TxStatus};

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn tx(agent: &Address, i: u64, value: u128, status: TxStatus) -> Transaction {
        Transaction {
            hash:         format!("0x{:064x}", i),
            agent:        agent.to_string(),
            from:         agent.to_string(),
            to:           Some(addr(0xee).to_string()),
            value,
            gas_used:     Some(21_000),
            gas_price:    None,
            status,
            chain_id:     1,
            block_number: 100 + i,
            timestamp:    1_700_000_000 + i * 60,
            analyzed:     false,
        }
    }

    fn cycle<'a>(score: f64, factors: &'a TrustScoreFactors) -> CycleWrite<'a> {
        CycleWrite { score, factors, narrative: "n", confidence: 0.6, analyzed: &[], alerts: &[] }
    }

    fn record_score(store: &ActivityStore, a: &Address, score: f64) -> Result<TrustScoreSnapshot, TrustError> {
        store.commit_cycle(a, &cycle(score, &TrustScoreFactors::NEUTRAL)).map(|r| r.snapshot)
    }

    fn draft(rule: &str) -> AlertDraft {
        AlertDraft {
            alert_type: AlertType::Risk,
            severity:   Severity::High,
            rule:       rule.to_string(),
            message:    format!("{rule} fired"),
            details:    serde_json::json!({ "value": 42 }),
        }
    }

    // ── agents ──────────────────────────────────────────────────────────────

    #[test]
    fn register_is_idempotent_and_starts_neutral() {
        let store = ActivityStore::in_memory().unwrap();
        let (agent, created) = store.register_agent(&addr(1), "Bot", "trading").unwrap();
        assert!(created);
        assert_eq!(agent.trust_score, NEUTRAL_SCORE);
        assert_eq!(agent.status, AgentStatus::Active);

        let (again, created) = store.register_agent(&addr(1), "Other name", "defi").unwrap();
        assert!(!created);
        assert_eq!(again.name, "Bot");
        assert_eq!(store.list_agents(None).unwrap().len(), 1);
    }

    #[test]
    fn status_update_and_filtering() {
        let store = ActivityStore::in_memory().unwrap();
        store.register_agent(&addr(1), "a", "x").unwrap();
        store.register_agent(&addr(2), "b", "x").unwrap();

        let updated = store.set_status(&addr(2), AgentStatus::Suspended).unwrap().unwrap();
        assert_eq!(updated.status, AgentStatus::Suspended);
        assert!(store.set_status(&addr(9), AgentStatus::Flagged).unwrap().is_none());

        let active = store.list_agents(Some(AgentStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, addr(1).to_string());
    }

    // ── transactions ────────────────────────────────────────────────────────

    #[test]
    fn same_hash_is_stored_once() {
        let store = ActivityStore::in_memory().unwrap();
        let a = addr(1);
        let t = tx(&a, 1, 5, TxStatus::Success);

        assert_eq!(store.insert_transactions(&[t.clone()]).unwrap().len(), 1);
        assert!(store.insert_transactions(&[t.clone()]).unwrap().is_empty());
        // Duplicate within one batch too.
        assert!(store.insert_transactions(&[t.clone(), t]).unwrap().is_empty());
        assert_eq!(store.transaction_count(&a).unwrap(), 1);
    }

    #[test]
    fn transaction_round_trip_preserves_big_values() {
        let store = ActivityStore::in_memory().unwrap();
        let a = addr(1);
        let mut t = tx(&a, 7, u128::MAX, TxStatus::Failed);
        t.gas_price = Some(u128::MAX - 1);
        t.to = None;
        store.insert_transactions(&[t.clone()]).unwrap();

        let back = store.get_transaction(&t.hash).unwrap().unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn recent_transactions_newest_first_and_limited() {
        let store = ActivityStore::in_memory().unwrap();
        let a = addr(1);
        let txs: Vec<_> = (0..10).map(|i| tx(&a, i, 1, TxStatus::Success)).collect();
        store.insert_transactions(&txs).unwrap();
        store.insert_transactions(&[tx(&addr(2), 99, 1, TxStatus::Success)]).unwrap();

        let recent = store.recent_transactions(&a, 3).unwrap();
        let blocks: Vec<_> = recent.iter().map(|t| t.block_number).collect();
        assert_eq!(blocks, vec![109, 108, 107]);
        assert_eq!(store.latest_transaction_ts(&a).unwrap(), Some(1_700_000_000 + 9 * 60));
        assert_eq!(store.latest_transaction_ts(&addr(3)).unwrap(), None);
    }

    #[test]
    fn provider_records_survive_storage_unchanged() {
        use serde_json::json;
        use trustgraph_ledger::normalize;

        let store = ActivityStore::in_memory().unwrap();
        let a = Address::parse("0x00000000000000000000000000000000000000AA").unwrap();
        let peer = "0x00000000000000000000000000000000000000BB";
        let moralis = json!({ "result": [{
            "hash": format!("0x{}", "AB".repeat(32)),
            "from_address": a.as_str(),
            "to_address": peer,
            "value": "340282366920938463463374607431768211455",
            "receipt_gas_used": "21000",
            "gas_price": "0x3b9aca00",
            "receipt_status": "1",
            "block_number": "19000000",
            "block_timestamp": "2023-11-14T22:13:20.000Z"
        }]});
        let generic = json!([{
            "hash": format!("0x{}", "cd".repeat(32)),
            "from": peer,
            "to": a.as_str(),
            "value": "1500000000000000000",
            "blockNumber": 19_000_001u64,
            "timestampSeconds": 1_700_000_060u64,
            "statusCode": 0,
        }]);

        let mut fetched = normalize::moralis_activity(moralis, &a, 1).unwrap().transactions;
        fetched.extend(normalize::generic_activity(generic, &a, 1).unwrap().transactions);
        assert_eq!(store.insert_transactions(&fetched).unwrap().len(), 2);

        for original in &fetched {
            let back = store.get_transaction(&original.hash).unwrap().unwrap();
            assert_eq!(&back, original);
        }
        let first = store.get_transaction(&format!("0x{}", "ab".repeat(32))).unwrap().unwrap();
        assert_eq!(first.value, u128::MAX);
        assert_eq!(first.to.as_deref(), Some("0x00000000000000000000000000000000000000bb"));
        assert_eq!(first.agent, a.as_str());
        assert_eq!(store.recent_transactions(&a, 10).unwrap().len(), 2);
    }

    // ── scoring cycles ──────────────────────────────────────────────────────

    #[test]
    fn cycle_updates_agent_in_same_write() {
        let store = ActivityStore::in_memory().unwrap();
        let a = addr(1);
        store.register_agent(&a, "a", "x").unwrap();

        let f = TrustScoreFactors { success_rate: 90.0, ..TrustScoreFactors::NEUTRAL };
        let first = store.commit_cycle(&a, &cycle(61.0, &f)).unwrap().snapshot;
        let second = store.commit_cycle(&a, &cycle(73.0, &f)).unwrap().snapshot;
        assert!(second.id > first.id);
        assert!(second.timestamp >= first.timestamp);

        let latest = store.latest_snapshot(&a).unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.factors, f);
        assert_eq!(store.get_agent(&a).unwrap().unwrap().trust_score, 73.0);

        let history = store.recent_snapshots(&a, 5).unwrap();
        assert_eq!(history.iter().map(|s| s.score).collect::<Vec<_>>(), vec![73.0, 61.0]);
    }

    #[test]
    fn cycle_flags_only_named_hashes_and_raises_alerts() {
        let store = ActivityStore::in_memory().unwrap();
        let a = addr(1);
        store.register_agent(&a, "a", "x").unwrap();
        let txs: Vec<_> = (0..3).map(|i| tx(&a, i, 1, TxStatus::Success)).collect();
        store.insert_transactions(&txs).unwrap();

        let analyzed = [txs[0].hash.clone(), txs[2].hash.clone()];
        let drafts = [draft("low_success_rate")];
        let record = store
            .commit_cycle(&a, &CycleWrite {
                analyzed: &analyzed,
                alerts: &drafts,
                ..cycle(35.0, &TrustScoreFactors::NEUTRAL)
            })
            .unwrap();

        assert!(store.get_transaction(&txs[0].hash).unwrap().unwrap().analyzed);
        assert!(!store.get_transaction(&txs[1].hash).unwrap().unwrap().analyzed);
        assert!(store.get_transaction(&txs[2].hash).unwrap().unwrap().analyzed);

        assert_eq!(record.alerts.len(), 1);
        assert_eq!(record.alerts[0].created_at, record.snapshot.timestamp);
        assert_eq!(store.open_alerts(&a).unwrap()[0].id, record.alerts[0].id);
    }

    #[test]
    fn failed_cycle_writes_nothing() {
        let store = ActivityStore::in_memory().unwrap();
        let stranger = addr(5);
        let txs: Vec<_> = (0..2).map(|i| tx(&stranger, i, 1, TxStatus::Success)).collect();
        store.insert_transactions(&txs).unwrap();

        let analyzed: Vec<_> = txs.iter().map(|t| t.hash.clone()).collect();
        let drafts = [draft("critical_score")];
        let err = store
            .commit_cycle(&stranger, &CycleWrite {
                analyzed: &analyzed,
                alerts: &drafts,
                ..cycle(40.0, &TrustScoreFactors::NEUTRAL)
            })
            .unwrap_err();

        assert!(matches!(err, TrustError::Persistence(_)));
        assert!(store.latest_snapshot(&stranger).unwrap().is_none());
        assert!(store.open_alerts(&stranger).unwrap().is_empty());
        assert!(store.recent_transactions(&stranger, 10).unwrap().iter().all(|t| !t.analyzed));
    }

    // ── alerts ──────────────────────────────────────────────────────────────

    #[test]
    fn alerts_filter_and_resolve() {
        let store = ActivityStore::in_memory().unwrap();
        let (a, b) = (addr(1), addr(2));
        store.register_agent(&a, "a", "x").unwrap();
        store.register_agent(&b, "b", "x").unwrap();
        let for_a = [draft("low_success_rate"), draft("high_risk_level")];
        let for_b = [draft("critical_score")];
        let raised = store
            .commit_cycle(&a, &CycleWrite { alerts: &for_a, ..cycle(30.0, &TrustScoreFactors::NEUTRAL) })
            .unwrap()
            .alerts;
        store
            .commit_cycle(&b, &CycleWrite { alerts: &for_b, ..cycle(10.0, &TrustScoreFactors::NEUTRAL) })
            .unwrap();
        let first = &raised[0];

        assert_eq!(store.open_alerts(&a).unwrap().len(), 2);

        let resolved = store.resolve_alert(first.id).unwrap().unwrap();
        assert!(resolved.resolved);
        let at = resolved.resolved_at.unwrap();
        assert_eq!(resolved.details["value"], 42);

        // Resolving again keeps the original timestamp.
        assert_eq!(store.resolve_alert(first.id).unwrap().unwrap().resolved_at, Some(at));
        assert!(store.resolve_alert(9_999).unwrap().is_none());

        let open_a = store
            .alerts(&AlertFilter { agent: Some(a.clone()), unresolved_only: true, limit: 50 })
            .unwrap();
        assert_eq!(open_a.len(), 1);
        assert_eq!(open_a[0].rule, "high_risk_level");

        let all = store.alerts(&AlertFilter { agent: None, unresolved_only: false, limit: 50 }).unwrap();
        assert_eq!(all.len(), 3);
    }

    // ── stats / persistence ─────────────────────────────────────────────────

    #[test]
    fn stats_bucket_agents_by_trust_band() {
        let store = ActivityStore::in_memory().unwrap();
        for (n, score) in [(1u8, 90.0), (2, 75.0), (3, 55.0)] {
            store.register_agent(&addr(n), "a", "x").unwrap();
            record_score(&store, &addr(n), score).unwrap();
        }
        store.register_agent(&addr(4), "a", "x").unwrap();
        let critical = [draft("critical_score")];
        store
            .commit_cycle(&addr(4), &CycleWrite { alerts: &critical, ..cycle(20.0, &TrustScoreFactors::NEUTRAL) })
            .unwrap();
        store.insert_transactions(&[tx(&addr(1), 1, 1, TxStatus::Success)]).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_agents, 4);
        assert_eq!(stats.active_agents, 4);
        assert_eq!(stats.total_transactions, 1);
        assert_eq!(stats.open_alerts, 1);
        assert_eq!(stats.avg_trust_score, Some(60.0));
        assert_eq!(
            stats.trust_distribution,
            TrustDistribution { excellent: 1, good: 1, fair: 1, poor: 1 }
        );
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.db");
        let a = addr(1);
        {
            let store = ActivityStore::with_db(&path).unwrap();
            store.register_agent(&a, "a", "x").unwrap();
            store.insert_transactions(&[tx(&a, 1, 10, TxStatus::Success)]).unwrap();
            record_score(&store, &a, 66.0).unwrap();
        }
        let store = ActivityStore::with_db(&path).unwrap();
        assert_eq!(store.get_agent(&a).unwrap().unwrap().trust_score, 66.0);
        assert_eq!(store.transaction_count(&a).unwrap(), 1);
        assert_eq!(store.latest_snapshot(&a).unwrap().unwrap().score, 66.0);
    }
}
