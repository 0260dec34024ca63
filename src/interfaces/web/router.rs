use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{runs, stories};

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub(crate) fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/stories/generate", post(stories::generate_endpoint))
        .route("/api/stories/title", post(stories::title_endpoint))
        .route("/api/stories/run", post(runs::run_stream_endpoint))
        .route("/api/stories", post(stories::save_endpoint))
        .route("/api/stories/{number}", get(stories::get_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_cors())
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
