mod config;
mod core;
mod interfaces;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::core::llm::openrouter::OpenRouterClient;
use crate::core::selector::ModelSelector;
use crate::core::store::StoryStore;
use crate::interfaces::web::ApiServer;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fabula failed to start: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(500);
    logging::init(log_tx.clone());

    info!(
        "Starting fabula (pool of {} story models)...",
        config.story_models.len()
    );

    let store = Arc::new(StoryStore::open(&config.db_path).with_context(|| {
        format!("failed to open story store at {}", config.db_path.display())
    })?);
    let selector = Arc::new(ModelSelector::new(config.story_models.clone())?);
    let client = Arc::new(OpenRouterClient::new(&config));

    ApiServer::new(&config, store, client.clone(), client, selector, log_tx)
        .serve()
        .await
}
