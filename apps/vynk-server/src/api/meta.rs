use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::AppState;

/// Liveness probe; also reports whether the gateway is ready.
pub async fn healthz(State(state): State<AppState>) -> Response {
    crate::responses::json_ok(json!({
        "ok": true,
        "gateway_ready": state.bridge().is_ready(),
    }))
}

/// Prometheus text exposition of the process recorder.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let Some(handle) = state.metrics() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed\n").into_response();
    };
    let mut response = Response::new(handle.render().into());
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
