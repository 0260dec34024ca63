use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use super::super::AppState;
use crate::core::pipeline::{story_excerpt, strip_title_quotes};
use crate::core::store::NewStory;

#[derive(Deserialize)]
pub(crate) struct GenerateRequest {
    prompt: String,
}

#[derive(Deserialize)]
pub(crate) struct TitleRequest {
    story: String,
}

/// Streaming completion endpoint: picks a model, opens the upstream stream
/// and re-emits it as `data:` blocks ending with `[DONE]`. The model actually
/// used is reported in the `x-model` response header.
pub(crate) async fn generate_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Response {
    let prompt = payload.prompt.trim().to_string();
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Prompt must not be empty"})),
        )
            .into_response();
    }

    let model = state.selector.draw().to_string();
    let mut stream = match state.completions.open_story_stream(&prompt, &model).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to open story stream: {:#}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to generate story"})),
            )
                .into_response();
        }
    };
    let served_model = stream.model.clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(32);
    tokio::spawn(async move {
        loop {
            match stream.deltas.next_delta().await {
                Ok(Some(delta)) => {
                    let frame = json!({"choices": [{"delta": {"content": delta}}]}).to_string();
                    if tx.send(frame).await.is_err() {
                        return; // client went away
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Story stream died mid-run: {:#}", e);
                    break;
                }
            }
        }
        let _ = tx.send("[DONE]".to_string()).await;
    });

    let sse = ReceiverStream::new(rx).map(|msg| Ok::<_, Infallible>(Event::default().data(msg)));
    let mut response = Sse::new(sse).into_response();
    if let Ok(value) = HeaderValue::from_str(&served_model) {
        response.headers_mut().insert("x-model", value);
    }
    response
}

pub(crate) async fn title_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<TitleRequest>,
) -> Response {
    match state
        .titles
        .generate_title(story_excerpt(&payload.story))
        .await
    {
        Ok(raw) => Json(json!({"title": strip_title_quotes(&raw)})).into_response(),
        Err(e) => {
            error!("Failed to generate title: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to generate title"})),
            )
                .into_response()
        }
    }
}

pub(crate) async fn save_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<NewStory>,
) -> Response {
    match state.store.create(payload).await {
        Ok(story) => Json(json!({
            "id": story.id,
            "number": story.number,
            "createdAt": story.created_at,
            "model": story.model,
        }))
        .into_response(),
        Err(e) => {
            error!("Failed to save story: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to save story"})),
            )
                .into_response()
        }
    }
}

pub(crate) async fn get_endpoint(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> Response {
    let Ok(number) = number.parse::<i64>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid story number"})),
        )
            .into_response();
    };

    match state.store.get_by_number(number).await {
        Ok(Some(story)) => Json(story).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Story not found"})),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to fetch story #{}: {:#}", number, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to fetch story"})),
            )
                .into_response()
        }
    }
}
