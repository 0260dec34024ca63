use std::convert::Infallible;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::oneshot;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const STORY_FRAGMENTS: [&str; 3] = ["Once ", "upon a time, ", "a robot baked bread."];

// --- Mock OpenRouter-compatible provider ---

#[derive(Clone)]
struct MockProviderState {
    completion_calls: Arc<AtomicUsize>,
    title_calls: Arc<AtomicUsize>,
    fail_completions: bool,
}

async fn mock_chat_completions(
    State(state): State<MockProviderState>,
    Json(payload): Json<Value>,
) -> Response {
    let streaming = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if streaming {
        state.completion_calls.fetch_add(1, Ordering::SeqCst);
        if state.fail_completions {
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "model exploded",
            )
                .into_response();
        }

        let mut body = String::new();
        for fragment in STORY_FRAGMENTS {
            body.push_str(&format!(
                "data: {}\n\n",
                json!({"choices": [{"delta": {"content": fragment}}]})
            ));
        }
        body.push_str("data: [DONE]\n\n");

        // Deliver in tiny frames so data blocks straddle network reads
        let frames: Vec<Result<Bytes, Infallible>> = body
            .into_bytes()
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(tokio_stream::iter(frames)))
            .unwrap()
    } else {
        state.title_calls.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "choices": [{"message": {"role": "assistant", "content": "\"The Baking Bot\""}}]
        }))
        .into_response()
    }
}

struct MockProvider {
    port: u16,
    completion_calls: Arc<AtomicUsize>,
    title_calls: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockProvider {
    async fn start(fail_completions: bool) -> TestResult<Self> {
        let port = find_free_port()?;
        let completion_calls = Arc::new(AtomicUsize::new(0));
        let title_calls = Arc::new(AtomicUsize::new(0));
        let state = MockProviderState {
            completion_calls: completion_calls.clone(),
            title_calls: title_calls.clone(),
            fail_completions,
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(mock_chat_completions))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            port,
            completion_calls,
            title_calls,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    fn completions_url(&self) -> String {
        format!("http://127.0.0.1:{}/v1/chat/completions", self.port)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// --- Daemon under test ---

struct DaemonHarness {
    child: Child,
    api_base: String,
    _data_dir: tempfile::TempDir,
}

impl DaemonHarness {
    async fn spawn(completions_url: &str) -> TestResult<Self> {
        let api_port = find_free_port()?;
        let data_dir = tempfile::tempdir()?;

        let child = Command::new(env!("CARGO_BIN_EXE_fabula"))
            .env("OPENROUTER_API_KEY", "test-key")
            .env("COMPLETIONS_URL", completions_url)
            .env("STORY_MODELS", "test/model-a")
            .env("TITLE_MODEL", "test/title-model")
            .env("SITE_URL", "http://127.0.0.1")
            .env("SITE_NAME", "fabula-e2e")
            .env("FABULA_API_HOST", "127.0.0.1")
            .env("FABULA_API_PORT", api_port.to_string())
            .env("FABULA_DB", data_dir.path().join("stories.db"))
            .env("FABULA_ERASE_DELAY_MS", "0")
            .env("FABULA_TYPE_DELAY_MS", "0")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let mut harness = Self {
            child,
            api_base: format!("http://127.0.0.1:{}", api_port),
            _data_dir: data_dir,
        };
        harness.wait_until_ready().await?;
        Ok(harness)
    }

    async fn wait_until_ready(&mut self) -> TestResult<()> {
        for _ in 0..80 {
            if let Some(status) = self.child.try_wait()? {
                return Err(format!("fabula daemon exited early with status: {}", status).into());
            }

            let res = reqwest::Client::new()
                .get(format!("{}/api/stories/1", self.api_base))
                .timeout(Duration::from_millis(700))
                .send()
                .await;
            if res.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err("Timed out waiting for fabula API readiness".into())
    }

    async fn run_pipeline(&self, prompt: &str) -> TestResult<Vec<Value>> {
        let resp = reqwest::Client::new()
            .post(format!("{}/api/stories/run", self.api_base))
            .json(&json!({"prompt": prompt}))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let text = resp.text().await?;
        Ok(sse_events(&text))
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn find_free_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter_map(|d| serde_json::from_str(d).ok())
        .collect()
}

fn event_of_type<'a>(events: &'a [Value], kind: &str) -> Option<&'a Value> {
    events.iter().find(|e| e["type"] == kind)
}

// --- Scenarios ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_run_persists_a_numbered_story() -> TestResult<()> {
    let provider = MockProvider::start(false).await?;
    let daemon = DaemonHarness::spawn(&provider.completions_url()).await?;

    let events = daemon.run_pipeline("a robot learns to bake").await?;

    let story_event = event_of_type(&events, "story").expect("run should end with a story event");
    let story = &story_event["story"];
    assert_eq!(story["title"], "The Baking Bot");
    assert_eq!(story["content"], "Once upon a time, a robot baked bread.");
    assert_eq!(story["prompt"], "a robot learns to bake");
    assert_eq!(story["model"], "test/model-a");
    assert_eq!(story["number"], 1);
    assert!(event_of_type(&events, "done").is_some());
    assert!(event_of_type(&events, "error").is_none());

    assert_eq!(provider.completion_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.title_calls.load(Ordering::SeqCst), 1);

    // The permalink lookup returns exactly what was persisted
    let fetched: Value = reqwest::Client::new()
        .get(format!("{}/api/stories/1", daemon.api_base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(fetched["title"], story["title"]);
    assert_eq!(fetched["content"], story["content"]);
    assert_eq!(fetched["prompt"], story["prompt"]);
    assert_eq!(fetched["model"], story["model"]);
    assert_eq!(fetched["id"], story["id"]);
    assert!(fetched["createdAt"].as_str().is_some());

    // Unknown numbers are a 404
    let missing = reqwest::Client::new()
        .get(format!("{}/api/stories/999", daemon.api_base))
        .send()
        .await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    provider.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generate_endpoint_streams_raw_frames() -> TestResult<()> {
    let provider = MockProvider::start(false).await?;
    let daemon = DaemonHarness::spawn(&provider.completions_url()).await?;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/stories/generate", daemon.api_base))
        .json(&json!({"prompt": "greetings"}))
        .timeout(Duration::from_secs(30))
        .send()
        .await?;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers().get("x-model").and_then(|v| v.to_str().ok()),
        Some("test/model-a")
    );

    let body = resp.text().await?;
    let deltas: String = sse_events(&body)
        .iter()
        .filter_map(|e| e["choices"][0]["delta"]["content"].as_str().map(String::from))
        .collect();
    assert_eq!(deltas, "Once upon a time, a robot baked bread.");
    assert!(body.contains("[DONE]"));

    provider.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completion_failure_never_titles_or_persists() -> TestResult<()> {
    let provider = MockProvider::start(true).await?;
    let daemon = DaemonHarness::spawn(&provider.completions_url()).await?;

    let events = daemon.run_pipeline("a doomed story").await?;

    let error_event = event_of_type(&events, "error").expect("run should fail");
    assert_eq!(error_event["stage"], "completion");
    assert!(event_of_type(&events, "story").is_none());
    assert!(event_of_type(&events, "done").is_some());

    assert_eq!(provider.completion_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.title_calls.load(Ordering::SeqCst), 0);

    let missing = reqwest::Client::new()
        .get(format!("{}/api/stories/1", daemon.api_base))
        .send()
        .await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    provider.shutdown().await;
    Ok(())
}
