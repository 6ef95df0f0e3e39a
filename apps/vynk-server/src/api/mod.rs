use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};
use serde_json::Value;

use vynk_protocol::Snowflake;

use crate::responses::ApiError;

pub mod bridge;
pub mod meta;
pub mod stats;
pub mod verify;

/// Accepts snowflakes sent either as JSON strings or numbers.
pub(crate) fn snowflake_field(field: &str, value: &Value) -> Result<Snowflake, ApiError> {
    serde_json::from_value::<Snowflake>(value.clone())
        .map_err(|_| ApiError::validation(format!("Invalid {field}")))
}

pub(crate) fn snowflake_path(field: &str, raw: &str) -> Result<Snowflake, ApiError> {
    raw.parse::<Snowflake>()
        .map_err(|_| ApiError::validation(format!("Invalid {field}")))
}

/// First `X-Forwarded-For` entry, else the socket peer address.
pub(crate) fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(ip) = crate::access_log::first_forwarded_ip(headers) {
        return ip;
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
