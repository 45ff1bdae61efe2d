//! Session/cycle recorder
//!
//! Durable records live behind a narrow save/load interface. Cycle numbers
//! are allocated atomically per session, sealed cycles are immutable, and a
//! session's status/balance are the only fields ever mutated in place.
//! Persistence failures surface to the caller; the state machine never
//! retries them.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AgentError;
use crate::models::{
    AgentEvent, AgentMemory, CycleLog, PortfolioSnapshot, SessionStatus, TradingSession,
};
use crate::Result;

/// Narrow persistence interface for sessions and cycle logs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist a new session with `status = active`.
    async fn start_session(
        &self,
        config: BTreeMap<String, serde_json::Value>,
        initial_balance: f64,
    ) -> Result<TradingSession>;

    async fn get_session(&self, session_id: Uuid) -> Result<Option<TradingSession>>;

    /// Most recently started session still in `active` status.
    async fn active_session(&self) -> Result<Option<TradingSession>>;

    /// Allocate the next cycle number (highest existing + 1, from 1), stamp
    /// `start_time`, persist a skeleton record. Refuses non-active sessions.
    async fn start_cycle(&self, session_id: Uuid) -> Result<CycleLog>;

    /// Stamp `end_time`, record the full raw event sequence, and attach the
    /// memory/snapshot when the cycle succeeded or the error when it did not.
    /// Sealing an already-sealed cycle is rejected.
    async fn seal_cycle(
        &self,
        cycle_id: Uuid,
        events: Vec<AgentEvent>,
        memory: Option<AgentMemory>,
        snapshot: Option<PortfolioSnapshot>,
        error: Option<String>,
    ) -> Result<CycleLog>;

    /// Memory of the highest-numbered cycle that produced one. Failed cycles
    /// never record memory, so this is always a successful cycle's.
    async fn latest_memory(&self, session_id: Uuid) -> Result<Option<AgentMemory>>;

    async fn update_session_balance(&self, session_id: Uuid, new_balance: f64) -> Result<()>;

    /// Move the session to a terminal status. Fails if already terminal.
    async fn close_session(&self, session_id: Uuid, status: SessionStatus) -> Result<()>;

    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CycleLog>>;

    async fn list_cycles(&self, session_id: Uuid) -> Result<Vec<CycleLog>>;
}

/// SHA-256 over the serialized event sequence, streamed into the hasher.
pub fn compute_events_hash(events: &[AgentEvent]) -> String {
    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), events).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//
// ================= In-Memory Store =================
//

/// In-memory store for development and tests. The single write lock also
/// serializes cycle-number allocation per session.
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, TradingSession>>>,
    cycles: Arc<RwLock<HashMap<Uuid, CycleLog>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cycles: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn start_session(
        &self,
        config: BTreeMap<String, serde_json::Value>,
        initial_balance: f64,
    ) -> Result<TradingSession> {
        let session = TradingSession::new(config, initial_balance);
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id, session.clone());
        info!(session_id = %session.id, initial_balance, "Session started");
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<TradingSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id).cloned())
    }

    async fn active_session(&self) -> Result<Option<TradingSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .max_by_key(|s| s.start_time)
            .cloned())
    }

    async fn start_cycle(&self, session_id: Uuid) -> Result<CycleLog> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(AgentError::SessionClosed(session_id.to_string()));
        }
        drop(sessions);

        let mut cycles = self.cycles.write().await;
        let next_number = cycles
            .values()
            .filter(|c| c.session_id == session_id)
            .map(|c| c.cycle_number)
            .max()
            .unwrap_or(0)
            + 1;

        let cycle = CycleLog::new(session_id, next_number);
        cycles.insert(cycle.id, cycle.clone());
        debug!(session_id = %session_id, cycle_number = next_number, "Cycle started");
        Ok(cycle)
    }

    async fn seal_cycle(
        &self,
        cycle_id: Uuid,
        events: Vec<AgentEvent>,
        memory: Option<AgentMemory>,
        snapshot: Option<PortfolioSnapshot>,
        error: Option<String>,
    ) -> Result<CycleLog> {
        let mut cycles = self.cycles.write().await;
        let cycle = cycles
            .get_mut(&cycle_id)
            .ok_or_else(|| AgentError::CycleNotFound(cycle_id.to_string()))?;
        if cycle.is_sealed() {
            return Err(AgentError::CycleAlreadySealed(cycle_id.to_string()));
        }

        cycle.end_time = Some(Utc::now());
        cycle.events_hash = Some(compute_events_hash(&events));
        cycle.events = events;
        cycle.memory_generated = memory;
        cycle.portfolio_after = snapshot;
        cycle.error = error;

        info!(
            cycle_id = %cycle_id,
            cycle_number = cycle.cycle_number,
            success = cycle.memory_generated.is_some(),
            "Cycle sealed"
        );
        Ok(cycle.clone())
    }

    async fn latest_memory(&self, session_id: Uuid) -> Result<Option<AgentMemory>> {
        let cycles = self.cycles.read().await;
        Ok(cycles
            .values()
            .filter(|c| c.session_id == session_id && c.memory_generated.is_some())
            .max_by_key(|c| c.cycle_number)
            .and_then(|c| c.memory_generated.clone()))
    }

    async fn update_session_balance(&self, session_id: Uuid, new_balance: f64) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(AgentError::SessionClosed(session_id.to_string()));
        }
        session.current_balance = new_balance;
        Ok(())
    }

    async fn close_session(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(AgentError::StoreError(
                "close_session requires a terminal status".to_string(),
            ));
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(AgentError::SessionClosed(session_id.to_string()));
        }
        session.status = status;
        info!(session_id = %session_id, status = %status, "Session closed");
        Ok(())
    }

    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CycleLog>> {
        let cycles = self.cycles.read().await;
        Ok(cycles.get(&cycle_id).cloned())
    }

    async fn list_cycles(&self, session_id: Uuid) -> Result<Vec<CycleLog>> {
        let cycles = self.cycles.read().await;
        let mut list: Vec<CycleLog> = cycles
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        list.sort_by_key(|c| c.cycle_number);
        Ok(list)
    }
}

//
// ================= Postgres Store =================
//

/// Postgres-backed store. Schema is bootstrapped lazily on first use;
/// cycle-number allocation takes a row lock on the session so concurrent
/// workers cannot mint duplicates.
pub struct PgSessionStore {
    pool: sqlx::PgPool,
    schema_ready: OnceCell<()>,
}

impl PgSessionStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| AgentError::StoreError(format!("Failed to build pg pool: {}", e)))?;
        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS trading_sessions (
                      id UUID PRIMARY KEY,
                      start_time TIMESTAMPTZ NOT NULL,
                      status TEXT NOT NULL,
                      config JSONB NOT NULL DEFAULT '{}'::jsonb,
                      initial_balance DOUBLE PRECISION NOT NULL,
                      current_balance DOUBLE PRECISION NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS cycle_logs (
                      id UUID PRIMARY KEY,
                      session_id UUID NOT NULL REFERENCES trading_sessions(id),
                      cycle_number INTEGER NOT NULL,
                      start_time TIMESTAMPTZ NOT NULL,
                      end_time TIMESTAMPTZ,
                      events JSONB NOT NULL DEFAULT '[]'::jsonb,
                      memory_generated JSONB,
                      portfolio_after JSONB,
                      error TEXT,
                      events_hash TEXT,
                      UNIQUE (session_id, cycle_number)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| AgentError::StoreError(format!("Failed to initialize schema: {}", e)))?;
        Ok(())
    }

    fn status_to_db(status: SessionStatus) -> &'static str {
        match status {
            SessionStatus::Active => "active",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
        }
    }

    fn status_from_db(status: &str) -> SessionStatus {
        match status {
            "stopped" => SessionStatus::Stopped,
            "completed" => SessionStatus::Completed,
            _ => SessionStatus::Active,
        }
    }

    fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<TradingSession> {
        use sqlx::Row;

        let status: String = row.try_get("status")?;
        let config: serde_json::Value = row.try_get("config")?;
        Ok(TradingSession {
            id: row.try_get("id")?,
            start_time: row.try_get("start_time")?,
            status: Self::status_from_db(&status),
            config: serde_json::from_value(config).unwrap_or_default(),
            initial_balance: row.try_get("initial_balance")?,
            current_balance: row.try_get("current_balance")?,
        })
    }

    fn cycle_from_row(row: &sqlx::postgres::PgRow) -> Result<CycleLog> {
        use sqlx::Row;

        let cycle_number: i32 = row.try_get("cycle_number")?;
        let events: serde_json::Value = row.try_get("events")?;
        let memory: Option<serde_json::Value> = row.try_get("memory_generated")?;
        let portfolio: Option<serde_json::Value> = row.try_get("portfolio_after")?;
        Ok(CycleLog {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            cycle_number: cycle_number.max(0) as u32,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            events: serde_json::from_value(events).unwrap_or_default(),
            memory_generated: memory.and_then(|v| serde_json::from_value(v).ok()),
            portfolio_after: portfolio.and_then(|v| serde_json::from_value(v).ok()),
            error: row.try_get("error")?,
            events_hash: row.try_get("events_hash")?,
        })
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn start_session(
        &self,
        config: BTreeMap<String, serde_json::Value>,
        initial_balance: f64,
    ) -> Result<TradingSession> {
        self.ensure_schema().await?;
        let session = TradingSession::new(config, initial_balance);

        sqlx::query(
            r#"
            INSERT INTO trading_sessions (id, start_time, status, config, initial_balance, current_balance)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(session.id)
        .bind(session.start_time)
        .bind(Self::status_to_db(session.status))
        .bind(serde_json::to_value(&session.config)?)
        .bind(session.initial_balance)
        .bind(session.current_balance)
        .execute(&self.pool)
        .await?;

        info!(session_id = %session.id, initial_balance, "Session started");
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<TradingSession>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM trading_sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn active_session(&self) -> Result<Option<TradingSession>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT * FROM trading_sessions WHERE status = 'active' ORDER BY start_time DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn start_cycle(&self, session_id: Uuid) -> Result<CycleLog> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;

        // Row lock serializes cycle-number allocation per session.
        let row = sqlx::query("SELECT status FROM trading_sessions WHERE id = $1 FOR UPDATE")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;

        let status: String = {
            use sqlx::Row;
            row.try_get("status")?
        };
        if Self::status_from_db(&status).is_terminal() {
            return Err(AgentError::SessionClosed(session_id.to_string()));
        }

        let next_number: i32 = {
            use sqlx::Row;
            sqlx::query(
                "SELECT COALESCE(MAX(cycle_number), 0) + 1 AS next FROM cycle_logs WHERE session_id = $1",
            )
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("next")?
        };

        let cycle = CycleLog::new(session_id, next_number.max(1) as u32);
        sqlx::query(
            r#"
            INSERT INTO cycle_logs (id, session_id, cycle_number, start_time)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(cycle.id)
        .bind(cycle.session_id)
        .bind(cycle.cycle_number as i32)
        .bind(cycle.start_time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(session_id = %session_id, cycle_number = cycle.cycle_number, "Cycle started");
        Ok(cycle)
    }

    async fn seal_cycle(
        &self,
        cycle_id: Uuid,
        events: Vec<AgentEvent>,
        memory: Option<AgentMemory>,
        snapshot: Option<PortfolioSnapshot>,
        error: Option<String>,
    ) -> Result<CycleLog> {
        self.ensure_schema().await?;
        let events_hash = compute_events_hash(&events);

        let updated = sqlx::query(
            r#"
            UPDATE cycle_logs
            SET end_time = $2, events = $3, memory_generated = $4,
                portfolio_after = $5, error = $6, events_hash = $7
            WHERE id = $1 AND end_time IS NULL
            "#,
        )
        .bind(cycle_id)
        .bind(Utc::now())
        .bind(serde_json::to_value(&events)?)
        .bind(memory.as_ref().map(serde_json::to_value).transpose()?)
        .bind(snapshot.as_ref().map(serde_json::to_value).transpose()?)
        .bind(error)
        .bind(events_hash)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Either never started or already sealed; sealed records stay
            // immutable either way.
            return match self.get_cycle(cycle_id).await? {
                Some(_) => Err(AgentError::CycleAlreadySealed(cycle_id.to_string())),
                None => Err(AgentError::CycleNotFound(cycle_id.to_string())),
            };
        }

        let sealed = self
            .get_cycle(cycle_id)
            .await?
            .ok_or_else(|| AgentError::CycleNotFound(cycle_id.to_string()))?;
        info!(
            cycle_id = %cycle_id,
            cycle_number = sealed.cycle_number,
            success = sealed.memory_generated.is_some(),
            "Cycle sealed"
        );
        Ok(sealed)
    }

    async fn latest_memory(&self, session_id: Uuid) -> Result<Option<AgentMemory>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            SELECT memory_generated FROM cycle_logs
            WHERE session_id = $1 AND memory_generated IS NOT NULL
            ORDER BY cycle_number DESC LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            use sqlx::Row;
            r.try_get::<serde_json::Value, _>("memory_generated")
                .ok()
                .and_then(|v| serde_json::from_value(v).ok())
        }))
    }

    async fn update_session_balance(&self, session_id: Uuid, new_balance: f64) -> Result<()> {
        self.ensure_schema().await?;
        let updated = sqlx::query(
            "UPDATE trading_sessions SET current_balance = $2 WHERE id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .bind(new_balance)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return match self.get_session(session_id).await? {
                Some(_) => Err(AgentError::SessionClosed(session_id.to_string())),
                None => Err(AgentError::SessionNotFound(session_id.to_string())),
            };
        }
        Ok(())
    }

    async fn close_session(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(AgentError::StoreError(
                "close_session requires a terminal status".to_string(),
            ));
        }
        self.ensure_schema().await?;

        let updated = sqlx::query(
            "UPDATE trading_sessions SET status = $2 WHERE id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .bind(Self::status_to_db(status))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return match self.get_session(session_id).await? {
                Some(_) => Err(AgentError::SessionClosed(session_id.to_string())),
                None => Err(AgentError::SessionNotFound(session_id.to_string())),
            };
        }
        info!(session_id = %session_id, status = %status, "Session closed");
        Ok(())
    }

    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CycleLog>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM cycle_logs WHERE id = $1")
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::cycle_from_row).transpose()
    }

    async fn list_cycles(&self, session_id: Uuid) -> Result<Vec<CycleLog>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM cycle_logs WHERE session_id = $1 ORDER BY cycle_number ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::cycle_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, EventSource};

    fn sample_memory(tag: &str) -> AgentMemory {
        AgentMemory {
            short_term_summary: format!("Cycle {} summary.", tag),
            active_hypotheses: vec![],
            pending_orders: vec![],
            next_steps: "Continue.".into(),
        }
    }

    fn sample_events(run_id: Uuid) -> Vec<AgentEvent> {
        vec![AgentEvent::new(
            run_id,
            "Plan",
            EventKind::StageEntered,
            EventSource::System,
            "Entering Plan (attempt 1)",
        )]
    }

    #[tokio::test]
    async fn cycle_numbers_are_monotonic_and_gap_free() {
        let store = InMemorySessionStore::new();
        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();

        for expected in 1..=3u32 {
            let cycle = store.start_cycle(session.id).await.unwrap();
            assert_eq!(cycle.cycle_number, expected);
            store
                .seal_cycle(cycle.id, vec![], Some(sample_memory("n")), None, None)
                .await
                .unwrap();
        }

        let numbers: Vec<u32> = store
            .list_cycles(session.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.cycle_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sealing_twice_is_rejected() {
        let store = InMemorySessionStore::new();
        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();
        let cycle = store.start_cycle(session.id).await.unwrap();

        let sealed = store
            .seal_cycle(
                cycle.id,
                sample_events(Uuid::new_v4()),
                Some(sample_memory("1")),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(sealed.is_sealed());
        assert!(sealed.events_hash.is_some());

        let second = store
            .seal_cycle(cycle.id, vec![], None, None, None)
            .await;
        assert!(matches!(second, Err(AgentError::CycleAlreadySealed(_))));

        // The sealed record kept its original contents.
        let stored = store.get_cycle(cycle.id).await.unwrap().unwrap();
        assert_eq!(stored.events.len(), 1);
        assert!(stored.memory_generated.is_some());
    }

    #[tokio::test]
    async fn session_round_trip_keeps_initial_balance() {
        let store = InMemorySessionStore::new();
        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();

        store
            .update_session_balance(session.id, 1234.5)
            .await
            .unwrap();

        let reloaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(reloaded.initial_balance, 1000.0);
        assert_eq!(reloaded.current_balance, 1234.5);
    }

    #[tokio::test]
    async fn terminal_sessions_refuse_further_mutation() {
        let store = InMemorySessionStore::new();
        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();

        store
            .close_session(session.id, SessionStatus::Stopped)
            .await
            .unwrap();

        assert!(matches!(
            store.close_session(session.id, SessionStatus::Completed).await,
            Err(AgentError::SessionClosed(_))
        ));
        assert!(matches!(
            store.update_session_balance(session.id, 5.0).await,
            Err(AgentError::SessionClosed(_))
        ));
        assert!(matches!(
            store.start_cycle(session.id).await,
            Err(AgentError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn close_session_requires_terminal_status() {
        let store = InMemorySessionStore::new();
        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();
        assert!(matches!(
            store.close_session(session.id, SessionStatus::Active).await,
            Err(AgentError::StoreError(_))
        ));
    }

    #[tokio::test]
    async fn latest_memory_skips_failed_cycles() {
        let store = InMemorySessionStore::new();
        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();

        let first = store.start_cycle(session.id).await.unwrap();
        store
            .seal_cycle(first.id, vec![], Some(sample_memory("one")), None, None)
            .await
            .unwrap();

        // A failed cycle seals with no memory.
        let second = store.start_cycle(session.id).await.unwrap();
        store
            .seal_cycle(
                second.id,
                vec![],
                None,
                None,
                Some("Planning failed: schema mismatch".into()),
            )
            .await
            .unwrap();

        let memory = store.latest_memory(session.id).await.unwrap().unwrap();
        assert_eq!(memory.short_term_summary, "Cycle one summary.");
    }

    #[tokio::test]
    async fn active_session_returns_most_recent_active() {
        let store = InMemorySessionStore::new();
        let first = store.start_session(BTreeMap::new(), 100.0).await.unwrap();
        store
            .close_session(first.id, SessionStatus::Completed)
            .await
            .unwrap();
        let second = store.start_session(BTreeMap::new(), 200.0).await.unwrap();

        let active = store.active_session().await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }

    #[test]
    fn events_hash_is_stable_and_content_sensitive() {
        let run_id = Uuid::new_v4();
        let events = sample_events(run_id);
        let h1 = compute_events_hash(&events);
        let h2 = compute_events_hash(&events);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, compute_events_hash(&[]));
    }
}
