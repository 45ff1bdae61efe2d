//! Stage capabilities consumed by the graph executor
//!
//! Each stage is a function of a declared subset of the cycle state. The
//! reasoning behind a capability is opaque to the core; only the input/output
//! contract and the failure signal are specified here. Implementations must
//! be safely retryable: the executor re-invokes a failed stage as-is.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::models::{
    AgentMemory, ChatMessage, MarketData, Plan, PortfolioDecision, QuantReport, QuantSignal,
    TradeAction,
};
use crate::Result;

pub mod openrouter;
pub use openrouter::OpenRouterStages;

/// Manager planning step. Failure signal: `PlanningFailed`.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        instruction: &str,
        messages: &[ChatMessage],
        market: &MarketData,
        prior_memory: Option<&AgentMemory>,
    ) -> Result<Plan>;
}

/// Quant analysis step. Failure signal: `AnalysisFailed`.
#[async_trait]
pub trait QuantAnalyst: Send + Sync {
    async fn analyze(&self, plan: &Plan, market: &MarketData) -> Result<QuantReport>;
}

/// Manager decision step. Failure signal: `DecisionFailed`.
#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, plan: &Plan, report: &QuantReport) -> Result<PortfolioDecision>;
}

/// End-of-cycle memory consolidation. Failure signal: `ConsolidationFailed`.
#[async_trait]
pub trait MemoryConsolidator: Send + Sync {
    async fn consolidate(
        &self,
        decision: &PortfolioDecision,
        report: &QuantReport,
        messages: &[ChatMessage],
    ) -> Result<AgentMemory>;
}

//
// ================= Mock Capabilities =================
//
// Keep the state machine runnable and testable without an LLM or exchange.
//

pub struct MockPlanner;

#[async_trait]
impl Planner for MockPlanner {
    async fn plan(
        &self,
        instruction: &str,
        _messages: &[ChatMessage],
        market: &MarketData,
        prior_memory: Option<&AgentMemory>,
    ) -> Result<Plan> {
        let asset = market
            .prices
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "BTC/USDT".to_string());

        let objective = match prior_memory {
            Some(memory) => format!("{} (follow up: {})", instruction, memory.next_steps),
            None => instruction.to_string(),
        };

        Ok(Plan {
            objective,
            assets: vec![asset.clone()],
            quant_question: format!("Analyze {} 4h trend; compute RSI and MACD.", asset),
            timeframes: vec!["4h".to_string()],
            constraints: Default::default(),
            expected_outputs: vec!["RSI".to_string(), "MACD".to_string()],
        })
    }
}

pub struct MockQuantAnalyst;

#[async_trait]
impl QuantAnalyst for MockQuantAnalyst {
    async fn analyze(&self, plan: &Plan, _market: &MarketData) -> Result<QuantReport> {
        let mut indicators = BTreeMap::new();
        indicators.insert("RSI_14".to_string(), 52.3);
        indicators.insert("MACD".to_string(), -0.4);

        Ok(QuantReport {
            signal: QuantSignal::Neutral,
            indicators,
            reasoning: format!("No clear edge for: {}", plan.quant_question),
            confidence: Some(0.55),
        })
    }
}

pub struct MockDecisionMaker;

#[async_trait]
impl DecisionMaker for MockDecisionMaker {
    async fn decide(&self, plan: &Plan, report: &QuantReport) -> Result<PortfolioDecision> {
        let asset = plan
            .assets
            .first()
            .cloned()
            .unwrap_or_else(|| "BTC/USDT".to_string());

        let action = match report.signal {
            QuantSignal::Bullish => TradeAction::Buy,
            QuantSignal::Bearish => TradeAction::Sell,
            QuantSignal::Neutral => TradeAction::Hold,
        };

        Ok(PortfolioDecision {
            action,
            asset,
            quantity: 0.0,
            confidence: report.confidence.unwrap_or(0.5),
            reasoning: report.reasoning.clone(),
            strategy_used: "Momentum Check".to_string(),
        })
    }
}

pub struct MockMemoryConsolidator;

#[async_trait]
impl MemoryConsolidator for MockMemoryConsolidator {
    async fn consolidate(
        &self,
        decision: &PortfolioDecision,
        report: &QuantReport,
        messages: &[ChatMessage],
    ) -> Result<AgentMemory> {
        Ok(AgentMemory {
            short_term_summary: format!(
                "Cycle closed with {} on {} after {} message turns.",
                decision.action,
                decision.asset,
                messages.len()
            ),
            active_hypotheses: vec![report.reasoning.clone()],
            pending_orders: vec![],
            next_steps: format!("Re-evaluate {} next cycle.", decision.asset),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PortfolioSnapshot, PriceQuote};

    fn sample_market() -> MarketData {
        let mut prices = BTreeMap::new();
        prices.insert(
            "ETH/USDT".to_string(),
            PriceQuote {
                last: 3200.0,
                change_24h_pct: -0.7,
            },
        );
        MarketData {
            portfolio: PortfolioSnapshot::new(5000.0, BTreeMap::new()),
            prices,
            note: None,
        }
    }

    #[tokio::test]
    async fn mock_pipeline_produces_consistent_artifacts() {
        let market = sample_market();
        let messages = vec![ChatMessage::user("Check ETH status.")];

        let plan = MockPlanner
            .plan("Check ETH status.", &messages, &market, None)
            .await
            .unwrap();
        assert_eq!(plan.assets, vec!["ETH/USDT".to_string()]);

        let report = MockQuantAnalyst.analyze(&plan, &market).await.unwrap();
        assert_eq!(report.signal, QuantSignal::Neutral);

        let decision = MockDecisionMaker.decide(&plan, &report).await.unwrap();
        assert_eq!(decision.action, TradeAction::Hold);
        assert_eq!(decision.asset, "ETH/USDT");

        let memory = MockMemoryConsolidator
            .consolidate(&decision, &report, &messages)
            .await
            .unwrap();
        assert!(memory.short_term_summary.contains("hold"));
        assert!(memory.pending_orders.is_empty());
    }

    #[tokio::test]
    async fn mock_planner_folds_prior_memory_into_objective() {
        let market = sample_market();
        let memory = AgentMemory {
            short_term_summary: "Held.".into(),
            active_hypotheses: vec![],
            pending_orders: vec![],
            next_steps: "Check funding rates.".into(),
        };

        let plan = MockPlanner
            .plan("Scan the market.", &[], &market, Some(&memory))
            .await
            .unwrap();
        assert!(plan.objective.contains("Check funding rates."));
    }
}
