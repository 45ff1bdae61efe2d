use std::sync::Arc;
use trading_cycle_agent::{
    api::start_server,
    config::AgentConfig,
    executor::GraphExecutor,
    llm::OpenRouterClient,
    market::{MarketDataProvider, SimulatedMarket},
    recorder::{InMemorySessionStore, PgSessionStore, SessionStore},
    stages::{
        MockDecisionMaker, MockMemoryConsolidator, MockPlanner, MockQuantAnalyst,
        OpenRouterStages,
    },
    worker::AgentController,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load environment variables
    dotenv::dotenv().ok();
    let config = AgentConfig::from_env();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8000".to_string())
        .parse()?;

    info!("Trading cycle agent - API server");
    info!("Port: {}", api_port);

    // Store: Postgres when configured, in-memory otherwise
    let store: Arc<dyn SessionStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            info!("Session store backend: postgres");
            Arc::new(PgSessionStore::connect_lazy(&url)?)
        }
        Err(_) => {
            info!("Session store backend: in-memory");
            Arc::new(InMemorySessionStore::new())
        }
    };

    let market: Arc<dyn MarketDataProvider> =
        Arc::new(SimulatedMarket::new(config.initial_balance));

    // Reasoning capabilities: OpenRouter when a key is present, mocks otherwise
    let executor = match std::env::var("OPENROUTER_API_KEY") {
        Ok(api_key) if !api_key.trim().is_empty() => {
            info!("Reasoning backend: openrouter");
            let client = Arc::new(OpenRouterClient::new(api_key));
            let stages: Arc<OpenRouterStages> = Arc::new(OpenRouterStages::new(client));
            GraphExecutor::new(
                Arc::clone(&market),
                Arc::clone(&stages) as Arc<dyn trading_cycle_agent::stages::Planner>,
                Arc::clone(&stages) as Arc<dyn trading_cycle_agent::stages::QuantAnalyst>,
                Arc::clone(&stages) as Arc<dyn trading_cycle_agent::stages::DecisionMaker>,
                stages as Arc<dyn trading_cycle_agent::stages::MemoryConsolidator>,
            )
        }
        _ => {
            warn!("OPENROUTER_API_KEY not set; using mock reasoning capabilities");
            GraphExecutor::new(
                Arc::clone(&market),
                Arc::new(MockPlanner),
                Arc::new(MockQuantAnalyst),
                Arc::new(MockDecisionMaker),
                Arc::new(MockMemoryConsolidator),
            )
        }
    }
    .with_max_retries(config.max_retries)
    .with_market_proxy(config.market_proxy.clone());

    let controller = Arc::new(AgentController::new(
        store,
        Arc::new(executor),
        market,
        config,
    ));

    // Autonomous loop runs alongside the API; it idles until /agent/start.
    tokio::spawn(Arc::clone(&controller).run_loop());

    info!("Controller initialized; starting API server");
    start_server(controller, api_port).await?;

    Ok(())
}
