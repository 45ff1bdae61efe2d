//! Trading Cycle Agent
//!
//! A recurring automated decision cycle for a trading agent:
//! - Threads a typed state envelope through a fixed stage sequence
//! - Injects Manager/Quant reasoning as opaque capabilities
//! - Bounds failures with a same-stage retry policy
//! - Seals durable session, cycle, memory, and snapshot records per cycle
//!
//! CYCLE: Init → Plan → Analyze → Decide → Consolidate → Sealed

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod llm;
pub mod market;
pub mod models;
pub mod recorder;
pub mod stages;
pub mod state;
pub mod worker;

pub use error::{AgentError, Result};

// Re-export common types
pub use models::*;
pub use state::{AgentState, Stage};
