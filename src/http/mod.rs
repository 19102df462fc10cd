//! Operational HTTP endpoints: liveness, health and metrics.

use axum::{
    Json, Router,
    extract::Extension,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{metrics::Metrics, replay::ReplayState};

#[derive(Clone)]
struct AppState {
    metrics: Metrics,
    replay: watch::Receiver<ReplayState>,
}

pub fn build_router(metrics: Metrics, replay: watch::Receiver<ReplayState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/hc", get(health))
        .route("/metrics", get(metrics_text))
        .layer(Extension(AppState { metrics, replay }))
        .layer(TraceLayer::new_for_http())
}

async fn ping() -> &'static str {
    "OK"
}

async fn health(Extension(state): Extension<AppState>) -> Json<serde_json::Value> {
    let replay = *state.replay.borrow();
    Json(json!({
        "status": "success",
        "substatus": {
            "replay": replay.as_str(),
        }
    }))
}

async fn metrics_text(Extension(state): Extension<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok((content_type, body)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {err}"),
            )
                .into_response()
        }
    }
}
