use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Extensions, HeaderMap};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{client_ip, snowflake_field, snowflake_path};
use crate::responses::{self, ApiError};
use crate::AppState;

/// Portal open: records a pending session for the visitor.
pub async fn open_portal(
    State(state): State<AppState>,
    Path((guild_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Response, ApiError> {
    let guild_id = snowflake_path("guild_id", &guild_id)?;
    let user_id = snowflake_path("user_id", &user_id)?;
    let ip = client_ip(&headers, &extensions);
    let geo = state.geolocator().lookup(&ip).await;
    let session = state
        .sessions()
        .open(guild_id, user_id, &ip, Some(&geo))
        .await?;
    Ok(responses::json_ok(json!({
        "session_id": session.session_id,
        "guild_id": guild_id,
        "user_id": user_id,
        "geolocation_data": geo,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    guild_id: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
}

/// Completes the session; the grant itself runs on the dispatcher and is recorded on
/// the session.
pub async fn complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    let session_id = req
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let (Some(session_id), Some(guild), Some(user)) = (
        session_id,
        req.guild_id.as_ref().filter(|v| !v.is_null()),
        req.user_id.as_ref().filter(|v| !v.is_null()),
    ) else {
        return Err(ApiError::validation("Missing required fields"));
    };
    let guild_id = snowflake_field("guild_id", guild)?;
    let user_id = snowflake_field("user_id", user)?;

    let ip = client_ip(&headers, &extensions);
    let geo = state.geolocator().lookup(&ip).await;
    let completion = state
        .sessions()
        .complete(session_id, guild_id, user_id, Some(&geo))
        .await?;
    let geolocation_data = completion.session.geolocation_data.clone().unwrap_or(geo);
    Ok(responses::json_ok(json!({
        "message": "Verification completed successfully!",
        "session_id": completion.session.session_id,
        "status": completion.session.status,
        "newly_completed": completion.newly_completed,
        "geolocation_data": geolocation_data,
    })))
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.sessions().get(&session_id).await?;
    Ok(responses::json_ok(json!({ "session": session })))
}
