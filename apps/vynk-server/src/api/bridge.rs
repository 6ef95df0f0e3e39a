use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use vynk_protocol::VerificationMethod;

use super::snowflake_field;
use crate::responses::{self, ApiError};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AssignRoleRequest {
    #[serde(default)]
    guild_id: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
}

fn present(v: &Option<Value>) -> Option<&Value> {
    v.as_ref().filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

/// Enqueues a grant for the gateway and waits for its result up to the bridge deadline.
pub async fn assign_role(
    State(state): State<AppState>,
    body: Result<Json<AssignRoleRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    let (Some(guild), Some(user)) = (present(&req.guild_id), present(&req.user_id)) else {
        return Err(ApiError::validation("Missing guild_id or user_id"));
    };
    let guild_id = snowflake_field("guild_id", guild)?;
    let user_id = snowflake_field("user_id", user)?;
    let method = match req.method.as_deref() {
        Some(raw) => raw.parse::<VerificationMethod>().map_err(ApiError::validation)?,
        None => VerificationMethod::Web,
    };
    tracing::info!(guild_id = %guild_id, user_id = %user_id, "assign-role requested");
    let result = state.bridge().assign_role(guild_id, user_id, method).await?;
    Ok(responses::command_result(result))
}

/// Gateway readiness as last published by the gateway runtime.
pub async fn bot_status(State(state): State<AppState>) -> Response {
    let status = state.bridge().status();
    if !status.ready {
        return responses::json_ok(json!({ "status": "offline" }));
    }
    let latency = status.latency_ms.map(|ms| (ms * 100.0).round() / 100.0);
    responses::json_ok(json!({
        "status": "online",
        "guilds": status.guilds,
        "user": status.user,
        "latency": latency,
    }))
}
