use axum::{
    routing::{get, post},
    Router,
};

use crate::{api, AppState};

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const METRICS: &str = "/metrics";
    pub const ASSIGN_ROLE: &str = "/api/assign-role";
    pub const BOT_STATUS: &str = "/api/bot-status";
    pub const VERIFY: &str = "/api/verify";
    pub const VERIFY_PORTAL: &str = "/verify/{guild_id}/{user_id}";
    pub const SESSION: &str = "/api/session/{session_id}";
    pub const STATS: &str = "/api/stats/{guild_id}";
    pub const VERIFICATIONS: &str = "/api/verifications/{guild_id}";
}

pub(crate) fn build_router() -> Router<AppState> {
    Router::new()
        .route(paths::HEALTHZ, get(api::meta::healthz))
        .route(paths::METRICS, get(api::meta::metrics))
        .route(paths::ASSIGN_ROLE, post(api::bridge::assign_role))
        .route(paths::BOT_STATUS, get(api::bridge::bot_status))
        .route(paths::VERIFY_PORTAL, get(api::verify::open_portal))
        .route(paths::VERIFY, post(api::verify::complete))
        .route(paths::SESSION, get(api::verify::session_status))
        .route(paths::STATS, get(api::stats::guild_stats))
        .route(paths::VERIFICATIONS, get(api::stats::recent_verifications))
}
