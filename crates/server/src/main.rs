use std::net::SocketAddr;

use anyhow::Context;
use orchestrator::{Orchestrator, OrchestratorConfig};
use server::state::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_ADDR: &str = "127.0.0.1:3001";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into()),
        )
        .init();

    let mut config = match std::env::var("DOCFLOW_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path))?;
            OrchestratorConfig::from_toml(&raw).with_context(|| format!("Invalid config {}", path))?
        }
        Err(_) => OrchestratorConfig::default(),
    };
    if let Ok(key) = std::env::var("DOCFLOW_API_KEY") {
        config.generation.api_key = Some(key);
    }

    let addr: SocketAddr = std::env::var("DOCFLOW_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .context("DOCFLOW_ADDR is not a socket address")?;

    let orchestrator = Orchestrator::builder(config)
        .build()
        .context("Failed to start orchestrator")?;
    server::serve(AppState::new(orchestrator), addr).await
}
