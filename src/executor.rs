//! Graph executor: the agent cycle state machine
//!
//! Drives one `AgentState` through the fixed stage order, enforcing the
//! read-precondition table, the same-stage retry policy, and stage-boundary
//! cancellation. Stage reasoning is injected as capabilities; the executor
//! owns only ordering, transitions, and termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::market::MarketDataProvider;
use crate::models::{AgentEvent, ChatMessage, EventKind, EventSource};
use crate::stages::{DecisionMaker, MemoryConsolidator, Planner, QuantAnalyst};
use crate::state::{AgentState, Stage};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MARKET_PROXY: &str = "BTC/USDT";

//
// ================= Cancellation =================
//

/// Cooperative stop signal, honored at stage boundaries only: it prevents the
/// next stage invocation from starting but never aborts one in flight.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.inner.store(false, Ordering::SeqCst);
    }
}

//
// ================= Cycle Outcome =================
//

/// Final state plus the raw event stream observed while the cycle ran.
pub struct CycleRun {
    pub state: AgentState,
    pub events: Vec<AgentEvent>,
}

impl CycleRun {
    pub fn is_success(&self) -> bool {
        self.state.stage == Stage::Sealed
    }
}

//
// ================= Graph Executor =================
//

pub struct GraphExecutor {
    market: Arc<dyn MarketDataProvider>,
    planner: Arc<dyn Planner>,
    quant: Arc<dyn QuantAnalyst>,
    decider: Arc<dyn DecisionMaker>,
    consolidator: Arc<dyn MemoryConsolidator>,
    max_retries: u32,
    market_proxy: String,
}

impl GraphExecutor {
    pub fn new(
        market: Arc<dyn MarketDataProvider>,
        planner: Arc<dyn Planner>,
        quant: Arc<dyn QuantAnalyst>,
        decider: Arc<dyn DecisionMaker>,
        consolidator: Arc<dyn MemoryConsolidator>,
    ) -> Self {
        Self {
            market,
            planner,
            quant,
            decider,
            consolidator,
            max_retries: DEFAULT_MAX_RETRIES,
            market_proxy: DEFAULT_MARKET_PROXY.to_string(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_market_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.market_proxy = proxy.into();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run one cycle to a terminal stage. Never returns early: every exit
    /// path lands on `Sealed` or `Failed` so the caller can always seal.
    pub async fn run(&self, mut state: AgentState, cancel: &CancelToken) -> CycleRun {
        let mut events = Vec::new();

        info!(
            run_id = %state.run_id,
            instruction = %state.instruction,
            "Cycle starting"
        );

        while !state.stage.is_terminal() {
            let stage = state.stage;

            // Cancellation is a boundary check only; an in-flight stage
            // always completes before this is consulted again.
            if cancel.is_cancelled() {
                warn!(run_id = %state.run_id, stage = %stage, "Cycle cancelled at stage boundary");
                state.error = Some(AgentError::Cancelled.to_string());
                state.stage = Stage::Failed;
                events.push(AgentEvent::new(
                    state.run_id,
                    stage.name(),
                    EventKind::Cancelled,
                    EventSource::System,
                    "Stop requested; next stage blocked.",
                ));
                break;
            }

            if let Some(missing) = stage.missing_requirement(&state) {
                let violation = AgentError::PreconditionViolation {
                    stage: stage.name().to_string(),
                    missing: missing.to_string(),
                };
                error!(run_id = %state.run_id, stage = %stage, missing, "Precondition violated");
                state.error = Some(violation.to_string());
                state.stage = Stage::Failed;
                events.push(AgentEvent::new(
                    state.run_id,
                    stage.name(),
                    EventKind::StageFailed,
                    EventSource::System,
                    violation.to_string(),
                ));
                break;
            }

            events.push(AgentEvent::new(
                state.run_id,
                stage.name(),
                EventKind::StageEntered,
                EventSource::System,
                format!("Entering {} (attempt {})", stage, state.retry_count + 1),
            ));
            debug!(run_id = %state.run_id, stage = %stage, attempt = state.retry_count + 1, "Executing stage");

            match self.invoke(stage, &mut state).await {
                Ok(produced) => {
                    state.error = None;
                    state.retry_count = 0;
                    state.stage = stage.next();
                    if let Some(event) = produced {
                        events.push(event);
                    }
                    info!(run_id = %state.run_id, stage = %stage, next = %state.stage, "Stage complete");
                }
                Err(failure) if failure.is_stage_failure() => {
                    state.error = Some(failure.to_string());
                    events.push(AgentEvent::new(
                        state.run_id,
                        stage.name(),
                        EventKind::StageFailed,
                        EventSource::System,
                        failure.to_string(),
                    ));

                    if state.retry_count < self.max_retries {
                        state.retry_count += 1;
                        warn!(
                            run_id = %state.run_id,
                            stage = %stage,
                            retry = state.retry_count,
                            max_retries = self.max_retries,
                            error = %failure,
                            "Stage failed; retrying same stage"
                        );
                        events.push(AgentEvent::new(
                            state.run_id,
                            stage.name(),
                            EventKind::RetryScheduled,
                            EventSource::System,
                            format!("Retry {} of {}", state.retry_count, self.max_retries),
                        ));
                    } else {
                        let exhausted = AgentError::RetriesExhausted {
                            attempts: state.retry_count + 1,
                            last_error: failure.to_string(),
                        };
                        error!(run_id = %state.run_id, stage = %stage, error = %exhausted, "Retries exhausted");
                        state.stage = Stage::Failed;
                    }
                }
                Err(fatal) => {
                    // Non-stage errors never enter the retry loop.
                    error!(run_id = %state.run_id, stage = %stage, error = %fatal, "Fatal error; cycle failed");
                    state.error = Some(fatal.to_string());
                    state.stage = Stage::Failed;
                    events.push(AgentEvent::new(
                        state.run_id,
                        stage.name(),
                        EventKind::StageFailed,
                        EventSource::System,
                        fatal.to_string(),
                    ));
                }
            }
        }

        info!(
            run_id = %state.run_id,
            terminal = %state.stage,
            error = state.error.as_deref().unwrap_or("none"),
            "Cycle finished"
        );
        CycleRun { state, events }
    }

    /// Invoke one stage's capability, writing produced fields into the state
    /// and returning the artifact event.
    async fn invoke(&self, stage: Stage, state: &mut AgentState) -> crate::Result<Option<AgentEvent>> {
        match stage {
            Stage::Init => {
                let market = self
                    .market
                    .market_snapshot(&self.market_proxy)
                    .await
                    .map_err(|e| coerce(e, AgentError::ScanFailed))?;

                let event = AgentEvent::new(
                    state.run_id,
                    stage.name(),
                    EventKind::Info,
                    EventSource::System,
                    "Market snapshot captured.",
                )
                .with_payload(serde_json::to_value(&market).unwrap_or_default());

                state.market_data = Some(market);
                Ok(Some(event))
            }

            Stage::Plan => {
                let market = state
                    .market_data
                    .as_ref()
                    .ok_or_else(|| precondition(stage, "market_data"))?;
                let plan = self
                    .planner
                    .plan(
                        &state.instruction,
                        &state.messages,
                        market,
                        state.prior_memory.as_ref(),
                    )
                    .await
                    .map_err(|e| coerce(e, AgentError::PlanningFailed))?;

                let rendered = serde_json::to_string(&plan).unwrap_or_default();
                let event = AgentEvent::new(
                    state.run_id,
                    stage.name(),
                    EventKind::PlanProduced,
                    EventSource::Manager,
                    plan.objective.clone(),
                )
                .with_payload(serde_json::to_value(&plan).unwrap_or_default());

                state.messages.push(ChatMessage::assistant(rendered));
                state.plan = Some(plan);
                Ok(Some(event))
            }

            Stage::Analyze => {
                let plan = state
                    .plan
                    .as_ref()
                    .ok_or_else(|| precondition(stage, "plan"))?;
                let market = state
                    .market_data
                    .as_ref()
                    .ok_or_else(|| precondition(stage, "market_data"))?;
                let report = self
                    .quant
                    .analyze(plan, market)
                    .await
                    .map_err(|e| coerce(e, AgentError::AnalysisFailed))?;

                let rendered = serde_json::to_string(&report).unwrap_or_default();
                let event = AgentEvent::new(
                    state.run_id,
                    stage.name(),
                    EventKind::ReportProduced,
                    EventSource::Quant,
                    report.reasoning.clone(),
                )
                .with_payload(serde_json::to_value(&report).unwrap_or_default());

                state.messages.push(ChatMessage::tool(rendered));
                state.quant_report = Some(report);
                Ok(Some(event))
            }

            Stage::Decide => {
                let plan = state
                    .plan
                    .as_ref()
                    .ok_or_else(|| precondition(stage, "plan"))?;
                let report = state
                    .quant_report
                    .as_ref()
                    .ok_or_else(|| precondition(stage, "quant_report"))?;
                let decision = self
                    .decider
                    .decide(plan, report)
                    .await
                    .map_err(|e| coerce(e, AgentError::DecisionFailed))?;

                let rendered = serde_json::to_string(&decision).unwrap_or_default();
                let event = AgentEvent::new(
                    state.run_id,
                    stage.name(),
                    EventKind::DecisionProduced,
                    EventSource::Manager,
                    format!("{} {}", decision.action, decision.asset),
                )
                .with_payload(serde_json::to_value(&decision).unwrap_or_default());

                state.messages.push(ChatMessage::assistant(rendered));
                state.decision = Some(decision);
                Ok(Some(event))
            }

            Stage::Consolidate => {
                let decision = state
                    .decision
                    .as_ref()
                    .ok_or_else(|| precondition(stage, "decision"))?;
                let report = state
                    .quant_report
                    .as_ref()
                    .ok_or_else(|| precondition(stage, "quant_report"))?;
                let memory = self
                    .consolidator
                    .consolidate(decision, report, &state.messages)
                    .await
                    .map_err(|e| coerce(e, AgentError::ConsolidationFailed))?;

                let event = AgentEvent::new(
                    state.run_id,
                    stage.name(),
                    EventKind::MemoryProduced,
                    EventSource::System,
                    memory.short_term_summary.clone(),
                )
                .with_payload(serde_json::to_value(&memory).unwrap_or_default());

                state.memory = Some(memory);
                Ok(Some(event))
            }

            Stage::Sealed | Stage::Failed => Ok(None),
        }
    }
}

fn precondition(stage: Stage, missing: &str) -> AgentError {
    AgentError::PreconditionViolation {
        stage: stage.name().to_string(),
        missing: missing.to_string(),
    }
}

/// Fold a capability's foreign error into the owning stage's failure signal;
/// an error that already is a stage failure passes through untouched.
fn coerce(error: AgentError, signal: fn(String) -> AgentError) -> AgentError {
    if error.is_stage_failure() || matches!(error, AgentError::PreconditionViolation { .. }) {
        error
    } else {
        signal(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::SimulatedMarket;
    use crate::models::{MarketData, Plan, QuantReport};
    use crate::stages::{
        MockDecisionMaker, MockMemoryConsolidator, MockPlanner, MockQuantAnalyst,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn mock_executor() -> GraphExecutor {
        GraphExecutor::new(
            Arc::new(SimulatedMarket::default()),
            Arc::new(MockPlanner),
            Arc::new(MockQuantAnalyst),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        )
    }

    /// Fails the first `failures` calls, then defers to the mock.
    struct FlakyQuant {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyQuant {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl QuantAnalyst for FlakyQuant {
        async fn analyze(&self, plan: &Plan, market: &MarketData) -> crate::Result<QuantReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(AgentError::AnalysisFailed("simulated outage".into()))
            } else {
                MockQuantAnalyst.analyze(plan, market).await
            }
        }
    }

    struct AlwaysFailingPlanner {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Planner for AlwaysFailingPlanner {
        async fn plan(
            &self,
            _instruction: &str,
            _messages: &[ChatMessage],
            _market: &MarketData,
            _memory: Option<&crate::models::AgentMemory>,
        ) -> crate::Result<Plan> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::PlanningFailed("schema mismatch".into()))
        }
    }

    /// Requests cancellation while its own invocation is in flight.
    struct CancellingQuant {
        token: CancelToken,
    }

    #[async_trait]
    impl QuantAnalyst for CancellingQuant {
        async fn analyze(&self, plan: &Plan, market: &MarketData) -> crate::Result<QuantReport> {
            self.token.request();
            MockQuantAnalyst.analyze(plan, market).await
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_sealed_with_all_artifacts() {
        let executor = mock_executor();
        let run = executor
            .run(AgentState::new("Check BTC status.", None), &CancelToken::new())
            .await;

        assert!(run.is_success());
        assert_eq!(run.state.stage, Stage::Sealed);
        assert_eq!(run.state.retry_count, 0);
        assert!(run.state.error.is_none());
        assert!(run.state.plan.is_some());
        assert!(run.state.quant_report.is_some());
        assert!(run.state.decision.is_some());
        assert!(run.state.memory.is_some());

        let kinds: Vec<EventKind> = run.events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::PlanProduced));
        assert!(kinds.contains(&EventKind::ReportProduced));
        assert!(kinds.contains(&EventKind::DecisionProduced));
        assert!(kinds.contains(&EventKind::MemoryProduced));
    }

    #[tokio::test]
    async fn single_analysis_failure_retries_same_stage_and_succeeds() {
        let executor = GraphExecutor::new(
            Arc::new(SimulatedMarket::default()),
            Arc::new(MockPlanner),
            Arc::new(FlakyQuant::new(1)),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        );

        let run = executor
            .run(AgentState::new("Check BTC status.", None), &CancelToken::new())
            .await;

        assert!(run.is_success());
        // Success resets the counter even though one retry happened.
        assert_eq!(run.state.retry_count, 0);
        assert!(run.state.error.is_none());
        assert!(run
            .events
            .iter()
            .any(|e| e.kind == EventKind::RetryScheduled));
    }

    #[tokio::test]
    async fn retries_exhausted_terminates_in_failed() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = GraphExecutor::new(
            Arc::new(SimulatedMarket::default()),
            Arc::new(AlwaysFailingPlanner {
                calls: Arc::clone(&calls),
            }),
            Arc::new(MockQuantAnalyst),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        )
        .with_max_retries(3);

        let run = executor
            .run(AgentState::new("Check BTC status.", None), &CancelToken::new())
            .await;

        assert!(!run.is_success());
        assert_eq!(run.state.stage, Stage::Failed);
        // 1 initial attempt + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(run.state.retry_count, 3);
        assert!(run
            .state
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Planning failed"));
        // No downstream artifacts, no memory to forward.
        assert!(run.state.plan.is_none());
        assert!(run.state.memory.is_none());
    }

    #[tokio::test]
    async fn retry_count_never_exceeds_max_retries() {
        let executor = GraphExecutor::new(
            Arc::new(SimulatedMarket::default()),
            Arc::new(AlwaysFailingPlanner {
                calls: Arc::new(AtomicU32::new(0)),
            }),
            Arc::new(MockQuantAnalyst),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        )
        .with_max_retries(2);

        let run = executor
            .run(AgentState::new("Check BTC status.", None), &CancelToken::new())
            .await;

        assert_eq!(run.state.stage, Stage::Failed);
        assert!(run.state.retry_count <= 2);
    }

    #[tokio::test]
    async fn precondition_violation_is_fatal_without_retry() {
        let executor = mock_executor();
        let mut state = AgentState::new("Check BTC status.", None);
        // Force the machine past Init/Plan with nothing produced.
        state.stage = Stage::Analyze;

        let run = executor.run(state, &CancelToken::new()).await;

        assert_eq!(run.state.stage, Stage::Failed);
        assert_eq!(run.state.retry_count, 0);
        assert!(run
            .state
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Precondition violated"));
    }

    #[tokio::test]
    async fn pending_cancellation_blocks_the_first_stage() {
        let executor = mock_executor();
        let cancel = CancelToken::new();
        cancel.request();

        let run = executor
            .run(AgentState::new("Check BTC status.", None), &cancel)
            .await;

        assert_eq!(run.state.stage, Stage::Failed);
        assert_eq!(
            run.state.error.as_deref(),
            Some(AgentError::Cancelled.to_string().as_str())
        );
        assert!(run.state.market_data.is_none());
    }

    #[tokio::test]
    async fn in_flight_stage_completes_before_cancellation_applies() {
        let cancel = CancelToken::new();
        let executor = GraphExecutor::new(
            Arc::new(SimulatedMarket::default()),
            Arc::new(MockPlanner),
            Arc::new(CancellingQuant {
                token: cancel.clone(),
            }),
            Arc::new(MockDecisionMaker),
            Arc::new(MockMemoryConsolidator),
        );

        let run = executor
            .run(AgentState::new("Check BTC status.", None), &cancel)
            .await;

        // Analyze ran to completion; Decide never started.
        assert_eq!(run.state.stage, Stage::Failed);
        assert!(run.state.quant_report.is_some());
        assert!(run.state.decision.is_none());
        assert!(run.events.iter().any(|e| e.kind == EventKind::Cancelled));
    }
}
