use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

use vynk_core::bridge::BridgeError;
use vynk_core::session::SessionError;
use vynk_protocol::{CommandResult, FailureKind};

const INTERNAL_MESSAGE: &str = "Internal error";

/// HTTP status for a failure class. Domain outcomes (unknown guild, missing role, ...)
/// travel as 200 with `success:false`.
pub(crate) fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::Validation => StatusCode::BAD_REQUEST,
        FailureKind::SessionNotFound => StatusCode::NOT_FOUND,
        FailureKind::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        FailureKind::GuildNotFound
        | FailureKind::MemberNotFound
        | FailureKind::NotConfigured
        | FailureKind::RoleNotFound
        | FailureKind::GrantFailed => StatusCode::OK,
    }
}

/// Wraps an object payload in the success envelope.
pub(crate) fn json_ok(mut payload: Value) -> Response {
    match payload.as_object_mut() {
        Some(map) => {
            map.insert("success".into(), Value::Bool(true));
        }
        None => payload = json!({ "success": true, "data": payload }),
    }
    (StatusCode::OK, Json(payload)).into_response()
}

/// A dispatcher outcome, already shaped as an envelope.
pub(crate) fn command_result(result: CommandResult) -> Response {
    let status = result.kind().map(status_for).unwrap_or(StatusCode::OK);
    (status, Json(result)).into_response()
}

#[derive(Debug)]
pub(crate) struct ApiError {
    kind: FailureKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// Logs the detail and hides it from the client.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        error!(error = %detail, "request failed");
        Self::new(FailureKind::Internal, INTERNAL_MESSAGE)
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            status_for(self.kind),
            Json(json!({
                "success": false,
                "error": self.message,
                "code": self.kind.as_str(),
            })),
        )
            .into_response()
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Join(detail) => Self::internal(detail),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Bridge(inner) => inner.into(),
            SessionError::Store(inner) => Self::internal(inner),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rej: JsonRejection) -> Self {
        Self::validation(format!("Invalid JSON body: {}", rej.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn internal_errors_hide_detail() {
        let resp = ApiError::from(anyhow::anyhow!("disk I/O error at page 42")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Internal error");
        assert_eq!(body["code"], "internal");
    }

    #[tokio::test]
    async fn bridge_errors_map_to_status() {
        let resp = ApiError::from(BridgeError::Timeout).into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(resp).await["error"], "Operation timeout");

        let resp = ApiError::from(BridgeError::NotReady).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn domain_failures_stay_200() {
        let resp = command_result(CommandResult::failure(
            FailureKind::NotConfigured,
            "Server not configured. Please run /setup-web-verification first.",
        ));
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "not_configured");
    }
}
