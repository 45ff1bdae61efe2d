//! Per-cycle state envelope and the stage enumeration
//!
//! `AgentState` is exclusively owned by the graph executor for the duration
//! of one cycle and discarded once the cycle's log is sealed. Memory crosses
//! the cycle boundary by value only.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::{
    AgentMemory, ChatMessage, MarketData, Plan, PortfolioDecision, QuantReport,
};

//
// ================= Stage =================
//

/// Machine state for one cycle.
///
/// The forward order is fixed: Init → Plan → Analyze → Decide → Consolidate
/// → Sealed. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Plan,
    Analyze,
    Decide,
    Consolidate,
    Sealed,
    Failed,
}

impl Stage {
    /// The next stage in the fixed forward order. Terminal stages map to
    /// themselves.
    pub fn next(self) -> Stage {
        match self {
            Stage::Init => Stage::Plan,
            Stage::Plan => Stage::Analyze,
            Stage::Analyze => Stage::Decide,
            Stage::Decide => Stage::Consolidate,
            Stage::Consolidate => Stage::Sealed,
            Stage::Sealed => Stage::Sealed,
            Stage::Failed => Stage::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Sealed | Stage::Failed)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Init => "Init",
            Stage::Plan => "Plan",
            Stage::Analyze => "Analyze",
            Stage::Decide => "Decide",
            Stage::Consolidate => "Consolidate",
            Stage::Sealed => "Sealed",
            Stage::Failed => "Failed",
        }
    }

    /// Read-precondition table: the field a stage requires but the state does
    /// not hold. A hole here is an invariant break, not a retryable condition.
    pub fn missing_requirement(self, state: &AgentState) -> Option<&'static str> {
        match self {
            Stage::Init => {
                if state.instruction.trim().is_empty() {
                    Some("instruction")
                } else {
                    None
                }
            }
            Stage::Plan => {
                if state.market_data.is_none() {
                    Some("market_data")
                } else {
                    None
                }
            }
            Stage::Analyze => {
                if state.plan.is_none() {
                    Some("plan")
                } else if state.market_data.is_none() {
                    Some("market_data")
                } else {
                    None
                }
            }
            Stage::Decide => {
                if state.plan.is_none() {
                    Some("plan")
                } else if state.quant_report.is_none() {
                    Some("quant_report")
                } else {
                    None
                }
            }
            Stage::Consolidate => {
                if state.decision.is_none() {
                    Some("decision")
                } else if state.quant_report.is_none() {
                    Some("quant_report")
                } else {
                    None
                }
            }
            Stage::Sealed | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

//
// ================= Agent State =================
//

/// Mutable envelope threaded through the state machine for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub instruction: String,
    pub messages: Vec<ChatMessage>,
    pub market_data: Option<MarketData>,
    pub plan: Option<Plan>,
    pub quant_report: Option<QuantReport>,
    pub decision: Option<PortfolioDecision>,
    /// Memory produced by this cycle's Consolidate stage.
    pub memory: Option<AgentMemory>,
    /// Memory inherited from the previous successful cycle, by value.
    pub prior_memory: Option<AgentMemory>,
    pub stage: Stage,
    pub error: Option<String>,
    pub retry_count: u32,
    pub verbose: bool,
    pub run_id: Uuid,
    pub session_id: Option<Uuid>,
    pub cycle_id: Option<Uuid>,
}

impl AgentState {
    /// Fresh cycle state: instruction plus an optional inherited memory.
    /// Everything else starts empty.
    pub fn new(instruction: impl Into<String>, prior_memory: Option<AgentMemory>) -> Self {
        let instruction = instruction.into();
        Self {
            messages: vec![ChatMessage::user(instruction.clone())],
            instruction,
            market_data: None,
            plan: None,
            quant_report: None,
            decision: None,
            memory: None,
            prior_memory,
            stage: Stage::Init,
            error: None,
            retry_count: 0,
            verbose: false,
            run_id: Uuid::new_v4(),
            session_id: None,
            cycle_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid, cycle_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self.cycle_id = Some(cycle_id);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}
