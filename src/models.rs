//! Core data models for the trading cycle agent
//!
//! Pure records: everything the state machine threads through a cycle and
//! everything the recorder persists at cycle boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stopped,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuantSignal {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

//
// ================= Conversation =================
//

/// One turn of the Manager's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
        }
    }
}

//
// ================= Market Data =================
//

/// Last-trade quote for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub last: f64,
    pub change_24h_pct: f64,
}

/// Market context gathered at the start of a cycle.
///
/// The scan only fetches a market proxy (e.g. BTC/USDT); the Manager is
/// responsible for requesting anything else through its planning question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub portfolio: PortfolioSnapshot,
    pub prices: BTreeMap<String, PriceQuote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

//
// ================= Plan =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk_pct: Option<f64>,
}

/// Structured output of the Manager's planning step.
///
/// Immutable once produced; consumed by the Analyze and Decide stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub objective: String,
    pub assets: Vec<String>,
    pub quant_question: String,
    pub timeframes: Vec<String>,
    #[serde(default)]
    pub constraints: PlanConstraints,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

//
// ================= Quant Report =================
//

/// Analytical output keyed to the Plan; immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantReport {
    pub signal: QuantSignal,
    pub indicators: BTreeMap<String, f64>,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

//
// ================= Portfolio Decision =================
//

/// Terminal artifact of the Decide stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioDecision {
    pub action: TradeAction,
    pub asset: String,
    pub quantity: f64,
    pub confidence: f64,
    pub reasoning: String,
    pub strategy_used: String,
}

//
// ================= Agent Memory =================
//

/// The structured memory handed from one cycle to the next.
///
/// Created once at consolidation and never mutated; the following cycle
/// receives it by value, never by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMemory {
    pub short_term_summary: String,
    pub active_hypotheses: Vec<String>,
    #[serde(default)]
    pub pending_orders: Vec<String>,
    pub next_steps: String,
}

//
// ================= Portfolio Snapshot =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub total_usdt: f64,
    pub positions: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn new(total_usdt: f64, positions: BTreeMap<String, f64>) -> Self {
        Self {
            total_usdt,
            positions,
            timestamp: Utc::now(),
        }
    }
}

//
// ================= Cycle Events =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StageEntered,
    PlanProduced,
    ReportProduced,
    DecisionProduced,
    MemoryProduced,
    StageFailed,
    RetryScheduled,
    Cancelled,
    Info,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Manager,
    Quant,
    System,
}

/// One raw event emitted while a cycle runs.
///
/// `payload` is the only open-ended field: the stage's raw structured output,
/// retained verbatim for audit and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage: String,
    pub kind: EventKind,
    pub source: EventSource,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(
        run_id: Uuid,
        stage: impl Into<String>,
        kind: EventKind,
        source: EventSource,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage: stage.into(),
            kind,
            source,
            content: content.into(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

//
// ================= Cycle Log =================
//

/// Durable record of one cycle.
///
/// Created at cycle start with `start_time` set; sealed exactly once at cycle
/// end with `end_time`, the full event sequence, and (on success) the memory
/// and snapshot. Sealed records are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleLog {
    pub id: Uuid,
    pub session_id: Uuid,
    pub cycle_number: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<AgentEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_generated: Option<AgentMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_after: Option<PortfolioSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 over the serialized event sequence, computed at seal time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_hash: Option<String>,
}

impl CycleLog {
    pub fn new(session_id: Uuid, cycle_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            cycle_number,
            start_time: Utc::now(),
            end_time: None,
            events: Vec::new(),
            memory_generated: None,
            portfolio_after: None,
            error: None,
            events_hash: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.end_time.is_some()
    }
}

//
// ================= Trading Session =================
//

/// A continuous run spanning many cycles.
///
/// `status` and `current_balance` are the only fields mutated after creation,
/// and only by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSession {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    pub initial_balance: f64,
    pub current_balance: f64,
}

impl TradingSession {
    pub fn new(config: BTreeMap<String, serde_json::Value>, initial_balance: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: Utc::now(),
            status: SessionStatus::Active,
            config,
            initial_balance,
            current_balance: initial_balance,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Hold => "hold",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_starts_active_with_matching_balances() {
        let session = TradingSession::new(BTreeMap::new(), 1000.0);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.initial_balance, 1000.0);
        assert_eq!(session.current_balance, 1000.0);
        assert!(!session.status.is_terminal());
    }

    #[test]
    fn cycle_log_is_unsealed_until_end_time_set() {
        let mut cycle = CycleLog::new(Uuid::new_v4(), 1);
        assert!(!cycle.is_sealed());
        cycle.end_time = Some(Utc::now());
        assert!(cycle.is_sealed());
    }

    #[test]
    fn trade_action_serializes_lowercase() {
        let json = serde_json::to_string(&TradeAction::Buy).unwrap();
        assert_eq!(json, "\"buy\"");
        let back: TradeAction = serde_json::from_str("\"hold\"").unwrap();
        assert_eq!(back, TradeAction::Hold);
    }

    #[test]
    fn memory_defaults_pending_orders_to_empty() {
        let json = r#"{
            "short_term_summary": "Watched BTC momentum.",
            "active_hypotheses": ["BTC trending up on 4h"],
            "next_steps": "Re-check RSI next cycle."
        }"#;
        let memory: AgentMemory = serde_json::from_str(json).unwrap();
        assert!(memory.pending_orders.is_empty());
    }
}
