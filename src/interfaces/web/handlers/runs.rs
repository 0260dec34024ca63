use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::super::AppState;
use crate::core::pipeline::{PipelinePhase, RunView, StoryPipeline};

#[derive(Deserialize)]
pub(crate) struct RunRequest {
    prompt: String,
}

/// Drives a full pipeline run server-side and forwards every view change as
/// an SSE event stream: `phase`, `delta`, `title`, then a terminal `story` or
/// `error`, and finally `done`. One pipeline instance per request; the
/// store's number sequence is the only state shared between concurrent runs.
pub(crate) async fn run_stream_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> Response {
    let prompt = payload.prompt.trim().to_string();
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Prompt must not be empty"})),
        )
            .into_response();
    }

    let pipeline = Arc::new(StoryPipeline::new(
        state.selector.clone(),
        state.completions.clone(),
        state.titles.clone(),
        state.store.clone(),
        state.pacer,
    ));
    let mut view_rx = pipeline.subscribe();
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(32);

    tokio::spawn(async move {
        {
            let pipeline = pipeline.clone();
            let prompt = prompt.clone();
            // Failures surface through the Failed phase below
            tokio::spawn(async move {
                let _ = pipeline.generate(&prompt).await;
            });
        }

        let mut last = RunView::default();
        loop {
            if view_rx.changed().await.is_err() {
                break;
            }
            let view = view_rx.borrow_and_update().clone();

            if view.phase != last.phase {
                let _ = tx
                    .send(json!({"type": "phase", "phase": view.phase.name()}).to_string())
                    .await;
                match &view.phase {
                    PipelinePhase::Persisted(story) => {
                        let _ = tx
                            .send(json!({"type": "story", "story": story}).to_string())
                            .await;
                    }
                    PipelinePhase::Failed(failure) => {
                        let _ = tx
                            .send(
                                json!({
                                    "type": "error",
                                    "stage": failure.stage.as_str(),
                                    "message": failure.message,
                                })
                                .to_string(),
                            )
                            .await;
                    }
                    _ => {}
                }
            }
            if view.story.len() > last.story.len() {
                let delta = view.story[last.story.len()..].to_string();
                let _ = tx.send(json!({"type": "delta", "text": delta}).to_string()).await;
            }
            if view.title != last.title {
                let _ = tx
                    .send(json!({"type": "title", "text": view.title}).to_string())
                    .await;
            }

            let terminal = view.phase.is_terminal();
            last = view;
            if terminal {
                break;
            }
        }
        let _ = tx.send(json!({"type": "done"}).to_string()).await;
    });

    let sse = ReceiverStream::new(rx).map(|msg| Ok::<_, Infallible>(Event::default().data(msg)));
    Sse::new(sse).into_response()
}
