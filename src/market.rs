//! Market data capability
//!
//! The executor's Init stage gathers portfolio and price context through
//! this interface. Sourcing is external; the core only sees the contract.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::models::{MarketData, PortfolioSnapshot, PriceQuote};
use crate::Result;

/// Capability: fetch the market snapshot at cycle start and the portfolio
/// snapshot at cycle end. Failures surface as `ScanFailed`.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Portfolio plus a price quote for the market proxy symbol. The agent
    /// must request any further symbols through its plan.
    async fn market_snapshot(&self, proxy_symbol: &str) -> Result<MarketData>;

    /// Portfolio as it stands right now; captured after a successful cycle.
    async fn portfolio_snapshot(&self) -> Result<PortfolioSnapshot>;
}

/// Deterministic in-process market for development and tests.
pub struct SimulatedMarket {
    balance_usdt: Mutex<f64>,
    positions: Mutex<BTreeMap<String, f64>>,
}

impl SimulatedMarket {
    pub fn new(balance_usdt: f64) -> Self {
        Self {
            balance_usdt: Mutex::new(balance_usdt),
            positions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_position(self, asset: impl Into<String>, quantity: f64) -> Self {
        self.positions
            .lock()
            .expect("positions lock poisoned")
            .insert(asset.into(), quantity);
        self
    }
}

impl Default for SimulatedMarket {
    fn default() -> Self {
        Self::new(10_000.0)
    }
}

#[async_trait]
impl MarketDataProvider for SimulatedMarket {
    async fn market_snapshot(&self, proxy_symbol: &str) -> Result<MarketData> {
        let portfolio = self.portfolio_snapshot().await?;

        let mut prices = BTreeMap::new();
        prices.insert(
            proxy_symbol.to_string(),
            PriceQuote {
                last: 64_250.0,
                change_24h_pct: 1.8,
            },
        );

        Ok(MarketData {
            portfolio,
            prices,
            note: Some(
                "Only the market proxy is pre-fetched; request other assets via the plan."
                    .to_string(),
            ),
        })
    }

    async fn portfolio_snapshot(&self) -> Result<PortfolioSnapshot> {
        let total_usdt = *self.balance_usdt.lock().expect("balance lock poisoned");
        let positions = self
            .positions
            .lock()
            .expect("positions lock poisoned")
            .clone();
        Ok(PortfolioSnapshot::new(total_usdt, positions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_market_quotes_the_proxy_symbol() {
        let market = SimulatedMarket::new(1000.0).with_position("ETH", 0.5);
        let data = market.market_snapshot("BTC/USDT").await.unwrap();

        assert!(data.prices.contains_key("BTC/USDT"));
        assert_eq!(data.portfolio.total_usdt, 1000.0);
        assert_eq!(data.portfolio.positions.get("ETH"), Some(&0.5));
    }
}
