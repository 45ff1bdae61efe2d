use std::sync::Arc;
use trading_cycle_agent::{
    config::AgentConfig,
    executor::{CancelToken, GraphExecutor},
    market::{MarketDataProvider, SimulatedMarket},
    recorder::{InMemorySessionStore, SessionStore},
    stages::{MockDecisionMaker, MockMemoryConsolidator, MockPlanner, MockQuantAnalyst},
    worker::run_single_cycle,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    dotenv::dotenv().ok();
    let config = AgentConfig::from_env();

    info!("Trading cycle agent starting (mock capabilities)");

    let market: Arc<dyn MarketDataProvider> =
        Arc::new(SimulatedMarket::new(config.initial_balance));
    let executor = GraphExecutor::new(
        Arc::clone(&market),
        Arc::new(MockPlanner),
        Arc::new(MockQuantAnalyst),
        Arc::new(MockDecisionMaker),
        Arc::new(MockMemoryConsolidator),
    )
    .with_max_retries(config.max_retries)
    .with_market_proxy(config.market_proxy.clone());

    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let session = store
        .start_session(Default::default(), config.initial_balance)
        .await?;

    let instruction = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let config = if instruction.is_empty() {
        config
    } else {
        AgentConfig {
            instruction,
            ..config
        }
    };

    let result = run_single_cycle(
        &store,
        &executor,
        &market,
        &session,
        &config,
        &CancelToken::new(),
    )
    .await?;

    println!("\n=== CYCLE RESULT ===");
    println!("Cycle:      #{} ({})", result.log.cycle_number, result.log.id);
    println!("Terminal:   {}", result.state.stage);
    if let Some(error) = &result.state.error {
        println!("Error:      {}", error);
    }
    if let Some(decision) = &result.state.decision {
        println!(
            "Decision:   {} {} (confidence {:.2})",
            decision.action, decision.asset, decision.confidence
        );
    }
    if let Some(memory) = &result.log.memory_generated {
        println!("Memory:     {}", memory.short_term_summary);
        println!("Next steps: {}", memory.next_steps);
    }
    if let Some(snapshot) = &result.log.portfolio_after {
        println!("Balance:    {} USDT", snapshot.total_usdt);
    }
    println!("Events:     {}", result.log.events.len());

    Ok(())
}
