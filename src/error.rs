//! Error types for the trading cycle agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Stage Failures (retryable)
    // =============================

    #[error("Market scan failed: {0}")]
    ScanFailed(String),

    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Quant analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Decision failed: {0}")]
    DecisionFailed(String),

    #[error("Memory consolidation failed: {0}")]
    ConsolidationFailed(String),

    // =============================
    // Cycle-Fatal Conditions
    // =============================

    #[error("Precondition violated entering {stage}: missing {missing}")]
    PreconditionViolation { stage: String, missing: String },

    #[error("Cycle cancelled")]
    Cancelled,

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // =============================
    // Recorder / Session Errors
    // =============================

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is closed: {0}")]
    SessionClosed(String),

    #[error("Cycle not found: {0}")]
    CycleNotFound(String),

    #[error("Cycle already sealed: {0}")]
    CycleAlreadySealed(String),

    // =============================
    // Capability Plumbing
    // =============================

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AgentError {
    /// Stage failures may be re-invoked on the same stage up to the retry
    /// bound. Everything else terminates the cycle outright.
    pub fn is_stage_failure(&self) -> bool {
        matches!(
            self,
            AgentError::ScanFailed(_)
                | AgentError::PlanningFailed(_)
                | AgentError::AnalysisFailed(_)
                | AgentError::DecisionFailed(_)
                | AgentError::ConsolidationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failures_are_retryable() {
        assert!(AgentError::PlanningFailed("parse".into()).is_stage_failure());
        assert!(AgentError::AnalysisFailed("timeout".into()).is_stage_failure());
        assert!(AgentError::ScanFailed("exchange down".into()).is_stage_failure());
    }

    #[test]
    fn fatal_conditions_are_not_retryable() {
        let violation = AgentError::PreconditionViolation {
            stage: "Analyze".into(),
            missing: "plan".into(),
        };
        assert!(!violation.is_stage_failure());
        assert!(!AgentError::Cancelled.is_stage_failure());
        assert!(!AgentError::StoreError("down".into()).is_stage_failure());
    }
}
