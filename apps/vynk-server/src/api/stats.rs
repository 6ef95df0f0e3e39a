use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;

use super::snowflake_path;
use crate::responses::{self, ApiError};
use crate::AppState;

const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 100;

pub async fn guild_stats(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
) -> Result<Response, ApiError> {
    let guild_id = snowflake_path("guild_id", &guild_id)?;
    let stats = state.kernel().get_session_stats_async(guild_id).await?;
    Ok(responses::json_ok(json!({
        "guild_id": guild_id,
        "total": stats.total,
        "success_count": stats.success,
        "failed": stats.failed,
        "recent_24h": stats.recent_24h,
        "success_rate": stats.success_rate(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    limit: Option<i64>,
}

pub async fn recent_verifications(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    query: Result<Query<RecentQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let guild_id = snowflake_path("guild_id", &guild_id)?;
    let Query(q) = query.map_err(|_| ApiError::validation("Invalid limit"))?;
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let entries = state
        .kernel()
        .recent_verifications_async(guild_id, limit)
        .await?;
    let items: Vec<_> = entries
        .iter()
        .map(|e| {
            json!({
                "user_id": e.user_id,
                "user_name": e.user_name,
                "method": e.method,
                "status": e.status,
                "timestamp": e.timestamp,
            })
        })
        .collect();
    Ok(responses::json_ok(json!({
        "guild_id": guild_id,
        "count": items.len(),
        "verifications": items,
    })))
}
