//! OpenRouter-backed stage capabilities
//!
//! One client, four contracts. Each stage forces a single JSON object out of
//! the model and parses it into the typed artifact; a parse miss is that
//! stage's failure signal, which the executor may retry.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::AgentError;
use crate::llm::{strip_code_fence, OpenRouterClient};
use crate::models::{
    AgentMemory, ChatMessage, MarketData, Plan, PortfolioDecision, QuantReport,
};
use crate::stages::{DecisionMaker, MemoryConsolidator, Planner, QuantAnalyst};
use crate::Result;

const PLAN_SYSTEM_PROMPT: &str = r#"You are the Portfolio Manager in the PLANNING state.
Produce ONLY a single JSON object with these fields:
{"objective": string, "assets": [string], "quant_question": string, "timeframes": [string], "constraints": {"max_risk_pct": number|null}, "expected_outputs": [string]}

Rules:
- Use only valid symbols for assets (e.g. "BTC/USDT").
- quant_question must be explicit and actionable for a quant researcher.

Example:
{"objective":"Assess ETH/USDT trend on 1h","assets":["ETH/USDT"],"quant_question":"Analyze ETH/USDT 1h trend and compute RSI and MACD. Return signal and indicators.","timeframes":["1h"],"constraints":{"max_risk_pct":50},"expected_outputs":["RSI","MACD"]}"#;

const QUANT_SYSTEM_PROMPT: &str = r#"You are the Quant Researcher in the ANALYZING state.
Answer the manager's question from the provided market data.
Produce ONLY a single JSON object with these fields:
{"signal": "bullish"|"bearish"|"neutral", "indicators": {string: number}, "reasoning": string, "confidence": number|null}

Rules:
- indicators holds the computed values you relied on (e.g. {"RSI_14": 62.1}).
- Do not invent data you were not given."#;

const DECISION_SYSTEM_PROMPT: &str = r#"You are the Portfolio Manager in the DECIDING state.
Use the provided Plan and QuantReport.
Produce ONLY a single JSON object with these fields:
{"action": "buy"|"sell"|"hold", "asset": string, "quantity": number, "confidence": number, "reasoning": string, "strategy_used": string}

Example:
{"action":"hold","asset":"ETH/USDT","quantity":0.0,"confidence":0.62,"reasoning":"RSI/MACD mixed; no clear edge.","strategy_used":"Momentum Check"}"#;

const MEMORY_SYSTEM_PROMPT: &str = r#"You are the Memory Manager for an investment agent.
Read the cycle's conversation history and compress it.
Produce ONLY a single JSON object with these fields:
{"short_term_summary": string, "active_hypotheses": [string], "pending_orders": [string], "next_steps": string}

Constraints:
- Be highly concise.
- Focus on the delta: decisions made and new data discovered."#;

/// LLM-backed implementation of all four reasoning stages.
pub struct OpenRouterStages {
    client: Arc<OpenRouterClient>,
}

impl OpenRouterStages {
    pub fn new(client: Arc<OpenRouterClient>) -> Self {
        Self { client }
    }

    async fn complete_json(&self, messages: &[ChatMessage]) -> Result<String> {
        let content = self.client.complete(messages, true).await?;
        debug!(len = content.len(), "LLM JSON response received");
        Ok(strip_code_fence(&content).to_string())
    }
}

fn render_history(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        let content = if msg.content.chars().count() > 400 {
            // Tool output can be huge; the consolidator only needs the gist.
            format!("{}...", msg.content.chars().take(400).collect::<String>())
        } else {
            msg.content.clone()
        };
        out.push_str(&format!("[{:?}]: {}\n", msg.role, content));
    }
    out
}

#[async_trait]
impl Planner for OpenRouterStages {
    async fn plan(
        &self,
        instruction: &str,
        _messages: &[ChatMessage],
        market: &MarketData,
        prior_memory: Option<&AgentMemory>,
    ) -> Result<Plan> {
        let memory_context = match prior_memory {
            Some(memory) => format!(
                "\n### PREVIOUS CYCLE MEMORY:\n{}\nFollow up on: {}",
                memory.short_term_summary, memory.next_steps
            ),
            None => String::new(),
        };

        let context = format!(
            "### MARKET UPDATE:\nPortfolio: {}\nPrices: {}\nNote: {}{}\n\n**INSTRUCTION:**\n{}",
            serde_json::to_string(&market.portfolio)?,
            serde_json::to_string(&market.prices)?,
            market.note.as_deref().unwrap_or(""),
            memory_context,
            instruction
        );

        let prompt = vec![
            ChatMessage::system(PLAN_SYSTEM_PROMPT),
            ChatMessage::user(context),
        ];

        let content = self
            .complete_json(&prompt)
            .await
            .map_err(|e| AgentError::PlanningFailed(e.to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| AgentError::PlanningFailed(format!("Plan parsing failed: {}", e)))
    }
}

#[async_trait]
impl QuantAnalyst for OpenRouterStages {
    async fn analyze(&self, plan: &Plan, market: &MarketData) -> Result<QuantReport> {
        let context = format!(
            "### QUESTION:\n{}\n\n### MARKET DATA:\n{}",
            plan.quant_question,
            serde_json::to_string(market)?
        );

        let prompt = vec![
            ChatMessage::system(QUANT_SYSTEM_PROMPT),
            ChatMessage::user(context),
        ];

        let content = self
            .complete_json(&prompt)
            .await
            .map_err(|e| AgentError::AnalysisFailed(e.to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| AgentError::AnalysisFailed(format!("Quant output invalid: {}", e)))
    }
}

#[async_trait]
impl DecisionMaker for OpenRouterStages {
    async fn decide(&self, plan: &Plan, report: &QuantReport) -> Result<PortfolioDecision> {
        let context = format!(
            "**DECISION TIME.**\n\n**PLAN:**\n{}\n\n**QUANT REPORT:**\n{}",
            serde_json::to_string(plan)?,
            serde_json::to_string(report)?
        );

        let prompt = vec![
            ChatMessage::system(DECISION_SYSTEM_PROMPT),
            ChatMessage::user(context),
        ];

        let content = self
            .complete_json(&prompt)
            .await
            .map_err(|e| AgentError::DecisionFailed(e.to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| AgentError::DecisionFailed(format!("Decision parsing failed: {}", e)))
    }
}

#[async_trait]
impl MemoryConsolidator for OpenRouterStages {
    async fn consolidate(
        &self,
        decision: &PortfolioDecision,
        report: &QuantReport,
        messages: &[ChatMessage],
    ) -> Result<AgentMemory> {
        let context = format!(
            "### CONVERSATION HISTORY:\n{}\n### FINAL DECISION:\n{}\n### QUANT REPORT:\n{}",
            render_history(messages),
            serde_json::to_string(decision)?,
            serde_json::to_string(report)?
        );

        let prompt = vec![
            ChatMessage::system(MEMORY_SYSTEM_PROMPT),
            ChatMessage::user(context),
        ];

        let content = self
            .complete_json(&prompt)
            .await
            .map_err(|e| AgentError::ConsolidationFailed(e.to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| AgentError::ConsolidationFailed(format!("Memory parsing failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_rendering_truncates_long_turns() {
        let long = "x".repeat(900);
        let rendered = render_history(&[
            ChatMessage::user("short"),
            ChatMessage::tool(long),
        ]);
        assert!(rendered.contains("[User]: short"));
        assert!(rendered.contains("..."));
        assert!(rendered.len() < 600);
    }
}
