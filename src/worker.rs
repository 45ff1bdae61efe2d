//! Session-level cycle driver
//!
//! Owns the start/stop surface, seeds each cycle from the previous
//! successful memory, and hands sealed records to the recorder. One cycle is
//! in flight per controller at any time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::executor::{CancelToken, GraphExecutor};
use crate::market::MarketDataProvider;
use crate::models::{CycleLog, SessionStatus, TradingSession};
use crate::recorder::SessionStore;
use crate::state::AgentState;
use crate::Result;

/// Sealed log plus the final state snapshot for observers.
pub struct CycleResult {
    pub log: CycleLog,
    pub state: AgentState,
}

/// Execute one full cycle for a session: load the inherited memory, open the
/// cycle record, run the state machine, seal, and fold the balance forward.
pub async fn run_single_cycle(
    store: &Arc<dyn SessionStore>,
    executor: &GraphExecutor,
    market: &Arc<dyn MarketDataProvider>,
    session: &TradingSession,
    config: &AgentConfig,
    cancel: &CancelToken,
) -> Result<CycleResult> {
    let previous_memory = store.latest_memory(session.id).await?;
    let cycle = store.start_cycle(session.id).await?;

    info!(
        session_id = %session.id,
        cycle_number = cycle.cycle_number,
        seeded = previous_memory.is_some(),
        "Starting cycle"
    );

    let instruction = match &previous_memory {
        Some(memory) => format!("{} Follow up on: {}", config.instruction, memory.next_steps),
        None => config.instruction.clone(),
    };

    // The next cycle's state is built fresh; memory crosses by value only.
    let state = AgentState::new(instruction, previous_memory)
        .with_session(session.id, cycle.id)
        .with_verbose(config.verbose);

    let run = executor.run(state, cancel).await;

    let log = if run.is_success() {
        let snapshot = match market.portfolio_snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Portfolio snapshot failed");
                None
            }
        };

        let log = store
            .seal_cycle(
                cycle.id,
                run.events,
                run.state.memory.clone(),
                snapshot.clone(),
                None,
            )
            .await?;

        if let Some(snapshot) = snapshot {
            match store
                .update_session_balance(session.id, snapshot.total_usdt)
                .await
            {
                Ok(()) => {}
                // The session may have been stopped while this cycle ran;
                // the sealed record stands either way.
                Err(AgentError::SessionClosed(_)) => {
                    warn!(session_id = %session.id, "Session closed before balance update")
                }
                Err(e) => return Err(e),
            }
        }
        log
    } else {
        store
            .seal_cycle(cycle.id, run.events, None, None, run.state.error.clone())
            .await?
    };

    info!(
        session_id = %session.id,
        cycle_number = log.cycle_number,
        success = log.memory_generated.is_some(),
        "Cycle sealed"
    );

    Ok(CycleResult {
        log,
        state: run.state,
    })
}

//
// ================= Agent Controller =================
//

/// Start/stop surface plus the autonomous loop. Stop requests are honored at
/// the next stage boundary of an in-flight cycle; the session transitions to
/// `stopped` only after that cycle seals.
pub struct AgentController {
    store: Arc<dyn SessionStore>,
    executor: Arc<GraphExecutor>,
    market: Arc<dyn MarketDataProvider>,
    config: AgentConfig,
    running: AtomicBool,
    in_flight: AtomicBool,
    cancel: CancelToken,
    cycles_run: AtomicU32,
    last_state: RwLock<Option<AgentState>>,
}

impl AgentController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        executor: Arc<GraphExecutor>,
        market: Arc<dyn MarketDataProvider>,
        config: AgentConfig,
    ) -> Self {
        Self {
            store,
            executor,
            market,
            config,
            running: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            cancel: CancelToken::new(),
            cycles_run: AtomicU32::new(0),
            last_state: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Final state of the most recent cycle, for dashboard consumers.
    pub async fn last_state(&self) -> Option<AgentState> {
        self.last_state.read().await.clone()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Idempotent: reuses the active session when one exists, otherwise
    /// starts a fresh one from the configured opening balance.
    pub async fn start(&self) -> Result<TradingSession> {
        let session = match self.store.active_session().await? {
            Some(session) => session,
            None => {
                let mut session_config = BTreeMap::new();
                session_config.insert(
                    "market_proxy".to_string(),
                    serde_json::Value::String(self.config.market_proxy.clone()),
                );
                session_config.insert(
                    "cycle_cadence_minutes".to_string(),
                    serde_json::json!(self.config.cycle_cadence_minutes),
                );
                session_config.insert(
                    "max_retries".to_string(),
                    serde_json::json!(self.executor.max_retries()),
                );
                self.store
                    .start_session(session_config, self.config.initial_balance)
                    .await?
            }
        };

        self.cancel.reset();
        self.cycles_run.store(0, Ordering::SeqCst);
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(session_id = %session.id, "Agent started");
        }
        Ok(session)
    }

    /// Idempotent: requests cancellation and, when no cycle is in flight,
    /// closes the active session immediately.
    pub async fn stop(&self) -> Result<()> {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.cancel.request();

        if was_running {
            info!("Agent stop requested");
        }

        if !self.in_flight.load(Ordering::SeqCst) {
            self.close_active_session(SessionStatus::Stopped).await;
        }
        Ok(())
    }

    /// Run exactly one cycle against the active session.
    pub async fn run_cycle_now(&self) -> Result<CycleResult> {
        let session = self
            .store
            .active_session()
            .await?
            .ok_or_else(|| AgentError::SessionNotFound("no active session".to_string()))?;

        self.in_flight.store(true, Ordering::SeqCst);
        let result = run_single_cycle(
            &self.store,
            &self.executor,
            &self.market,
            &session,
            &self.config,
            &self.cancel,
        )
        .await;
        self.in_flight.store(false, Ordering::SeqCst);

        if let Ok(result) = &result {
            *self.last_state.write().await = Some(result.state.clone());
        }

        // A stop that arrived mid-cycle takes effect now that the log sealed.
        if !self.is_running() {
            self.close_active_session(SessionStatus::Stopped).await;
        }

        result
    }

    async fn close_active_session(&self, status: SessionStatus) {
        match self.store.active_session().await {
            Ok(Some(session)) => match self.store.close_session(session.id, status).await {
                Ok(()) | Err(AgentError::SessionClosed(_)) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to close session"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to look up active session"),
        }
    }

    /// Autonomous loop: one cycle per cadence interval while running.
    pub async fn run_loop(self: Arc<Self>) {
        info!(
            cadence_minutes = self.config.cycle_cadence_minutes,
            run_limit = ?self.config.run_limit,
            "Worker loop started"
        );

        loop {
            if !self.is_running() {
                sleep(Duration::from_secs(2)).await;
                continue;
            }

            match self.run_cycle_now().await {
                Ok(_) => {
                    let count = self.cycles_run.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(limit) = self.config.run_limit {
                        if count >= limit {
                            info!(limit, "Run limit reached; stopping agent");
                            self.running.store(false, Ordering::SeqCst);
                            self.close_active_session(SessionStatus::Completed).await;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Cycle execution failed at the session level");
                    // Recorder-level failures back off rather than spin.
                    sleep(Duration::from_secs(60)).await;
                }
            }

            self.wait_cadence().await;
        }
    }

    async fn wait_cadence(&self) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.cycle_cadence_minutes * 60);
        while self.is_running() && tokio::time::Instant::now() < deadline {
            sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::SimulatedMarket;
    use crate::models::{AgentMemory, ChatMessage, MarketData, Plan, QuantReport};
    use crate::recorder::InMemorySessionStore;
    use crate::stages::{
        MockDecisionMaker, MockMemoryConsolidator, MockPlanner, MockQuantAnalyst, Planner,
        QuantAnalyst,
    };
    use async_trait::async_trait;

    fn store() -> Arc<dyn SessionStore> {
        Arc::new(InMemorySessionStore::new())
    }

    fn mock_executor(market: Arc<SimulatedMarket>) -> GraphExecutor {
        GraphExecutor::new(
            market,
            Arc::new(MockPlanner),
            Arc::new(MockQuantAnalyst),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        )
    }

    struct FlakyQuant {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl QuantAnalyst for FlakyQuant {
        async fn analyze(&self, plan: &Plan, market: &MarketData) -> Result<QuantReport> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AgentError::AnalysisFailed("simulated outage".into()));
            }
            MockQuantAnalyst.analyze(plan, market).await
        }
    }

    struct AlwaysFailingPlanner;

    #[async_trait]
    impl Planner for AlwaysFailingPlanner {
        async fn plan(
            &self,
            _instruction: &str,
            _messages: &[ChatMessage],
            _market: &MarketData,
            _memory: Option<&AgentMemory>,
        ) -> Result<Plan> {
            Err(AgentError::PlanningFailed("schema mismatch".into()))
        }
    }

    #[tokio::test]
    async fn memory_flows_from_cycle_one_to_cycle_two() {
        let store = store();
        let market = Arc::new(SimulatedMarket::new(10_000.0));
        let config = AgentConfig::default();
        let cancel = CancelToken::new();

        // Cycle 1 succeeds after one simulated analysis failure.
        let executor = GraphExecutor::new(
            Arc::clone(&market) as Arc<dyn MarketDataProvider>,
            Arc::new(MockPlanner),
            Arc::new(FlakyQuant {
                failures_left: AtomicU32::new(1),
            }),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        );

        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();
        let market_dyn: Arc<dyn MarketDataProvider> = market.clone();

        let first = run_single_cycle(&store, &executor, &market_dyn, &session, &config, &cancel)
            .await
            .unwrap();
        assert_eq!(first.log.cycle_number, 1);
        assert!(first.log.memory_generated.is_some());
        assert_eq!(first.state.retry_count, 0);

        let second = run_single_cycle(&store, &executor, &market_dyn, &session, &config, &cancel)
            .await
            .unwrap();
        assert_eq!(second.log.cycle_number, 2);
        // Cycle 2 saw cycle 1's memory, unchanged, by value.
        assert_eq!(second.state.prior_memory, first.log.memory_generated);
        assert!(second.state.instruction.contains("Follow up on:"));
    }

    #[tokio::test]
    async fn failed_cycle_seals_without_memory_and_leaves_balance() {
        let store = store();
        let market = Arc::new(SimulatedMarket::new(10_000.0));
        let executor = GraphExecutor::new(
            Arc::clone(&market) as Arc<dyn MarketDataProvider>,
            Arc::new(AlwaysFailingPlanner),
            Arc::new(MockQuantAnalyst),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        )
        .with_max_retries(3);

        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();
        let market_dyn: Arc<dyn MarketDataProvider> = market;

        let result = run_single_cycle(
            &store,
            &executor,
            &market_dyn,
            &session,
            &AgentConfig::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert!(result.log.is_sealed());
        assert!(result.log.memory_generated.is_none());
        assert!(result.log.portfolio_after.is_none());
        assert!(result
            .log
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Planning failed"));

        let session = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.current_balance, 1000.0);
        // And the failed cycle's partial memory is never forwarded.
        assert!(store.latest_memory(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn successful_cycle_folds_snapshot_into_balance() {
        let store = store();
        let market = Arc::new(SimulatedMarket::new(2500.0));
        let executor = mock_executor(Arc::clone(&market));
        let session = store.start_session(BTreeMap::new(), 1000.0).await.unwrap();
        let market_dyn: Arc<dyn MarketDataProvider> = market;

        run_single_cycle(
            &store,
            &executor,
            &market_dyn,
            &session,
            &AgentConfig::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        let session = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.current_balance, 2500.0);
        assert_eq!(session.initial_balance, 1000.0);
    }

    #[tokio::test]
    async fn controller_start_is_idempotent_and_stop_closes_idle_session() {
        let market = Arc::new(SimulatedMarket::default());
        let controller = AgentController::new(
            store(),
            Arc::new(mock_executor(Arc::clone(&market))),
            market,
            AgentConfig::default(),
        );

        let first = controller.start().await.unwrap();
        let second = controller.start().await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(controller.is_running());

        controller.stop().await.unwrap();
        controller.stop().await.unwrap();
        assert!(!controller.is_running());

        let session = controller
            .store()
            .get_session(first.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        // No new cycles once the session is terminal.
        assert!(controller.run_cycle_now().await.is_err());
    }

    #[tokio::test]
    async fn controller_records_last_state_for_observers() {
        let market = Arc::new(SimulatedMarket::default());
        let controller = AgentController::new(
            store(),
            Arc::new(mock_executor(Arc::clone(&market))),
            market,
            AgentConfig::default(),
        );

        assert!(controller.last_state().await.is_none());
        controller.start().await.unwrap();
        controller.run_cycle_now().await.unwrap();

        let state = controller.last_state().await.unwrap();
        assert!(state.memory.is_some());
    }
}
