mod handlers;
mod router;

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::config::Config;
use crate::core::llm::{CompletionBackend, TitleBackend};
use crate::core::pipeline::Pacer;
use crate::core::selector::ModelSelector;
use crate::core::store::StoryStore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<StoryStore>,
    pub(crate) completions: Arc<dyn CompletionBackend>,
    pub(crate) titles: Arc<dyn TitleBackend>,
    pub(crate) selector: Arc<ModelSelector>,
    pub(crate) pacer: Pacer,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
}

pub struct ApiServer {
    host: String,
    port: u16,
    state: AppState,
}

impl ApiServer {
    pub fn new(
        config: &Config,
        store: Arc<StoryStore>,
        completions: Arc<dyn CompletionBackend>,
        titles: Arc<dyn TitleBackend>,
        selector: Arc<ModelSelector>,
        log_tx: tokio::sync::broadcast::Sender<String>,
    ) -> Self {
        Self {
            host: config.api_host.clone(),
            port: config.api_port,
            state: AppState {
                store,
                completions,
                titles,
                selector,
                pacer: config.pacer(),
                log_tx,
            },
        }
    }

    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let app = router::build_api_router(self.state);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("fabula API running at http://{addr}");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| {
        match msg {
            Ok(line) => Ok(Event::default().data(line)), // SSE properly encodes this
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        }
    });

    Sse::new(stream)
}
