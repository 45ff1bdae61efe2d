//! Runtime configuration
//!
//! Retry bound, cadence, and run limits are explicit parameters, not hidden
//! constants. The bins load `.env` first, then read from the process env.

use std::env;

use crate::executor::{DEFAULT_MARKET_PROXY, DEFAULT_MAX_RETRIES};

pub const DEFAULT_CYCLE_CADENCE_MINUTES: u64 = 10;
pub const DEFAULT_INITIAL_BALANCE: f64 = 10_000.0;

const DEFAULT_INSTRUCTION: &str = "Analyze the market using your quant researcher. \
Formulate and test high-level strategies (trend following, mean reversion, correlations) \
and decide whether opportunities exist.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Same-stage retries allowed before a cycle fails.
    pub max_retries: u32,
    /// Minutes between autonomous cycles.
    pub cycle_cadence_minutes: u64,
    /// Stop the session automatically after this many cycles.
    pub run_limit: Option<u32>,
    /// Symbol pre-fetched at cycle start as the market index proxy.
    pub market_proxy: String,
    /// Opening balance for sessions this process creates.
    pub initial_balance: f64,
    /// Instruction seeded into each autonomous cycle.
    pub instruction: String,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            cycle_cadence_minutes: DEFAULT_CYCLE_CADENCE_MINUTES,
            run_limit: None,
            market_proxy: DEFAULT_MARKET_PROXY.to_string(),
            initial_balance: DEFAULT_INITIAL_BALANCE,
            instruction: DEFAULT_INSTRUCTION.to_string(),
            verbose: false,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: parse_env("MAX_RETRIES", defaults.max_retries),
            cycle_cadence_minutes: parse_env("CYCLE_CADENCE", defaults.cycle_cadence_minutes),
            run_limit: env::var("RUN_LIMIT").ok().and_then(|v| v.parse().ok()),
            market_proxy: env::var("MARKET_PROXY").unwrap_or(defaults.market_proxy),
            initial_balance: parse_env("INITIAL_BALANCE", defaults.initial_balance),
            instruction: env::var("AGENT_INSTRUCTION").unwrap_or(defaults.instruction),
            verbose: env::var("VERBOSE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.verbose),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_explicit() {
        let config = AgentConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.cycle_cadence_minutes, 10);
        assert_eq!(config.run_limit, None);
        assert_eq!(config.market_proxy, "BTC/USDT");
    }
}
