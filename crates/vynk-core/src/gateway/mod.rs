//! Gateway collaborator: the only handle allowed to mutate roles.

mod memory;

pub use memory::MemoryGateway;

use vynk_protocol::{GatewayStatus, Snowflake};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guild {
    pub id: Snowflake,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: Snowflake,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    /// `name#discriminator` or the bare username.
    pub tag: String,
    pub display_name: String,
    pub roles: Vec<Snowflake>,
}

impl Member {
    pub fn has_role(&self, role_id: Snowflake) -> bool {
        self.roles.contains(&role_id)
    }
}

/// Embed-style message posted to a guild's log channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub color: u32,
}

impl Notification {
    pub const SUCCESS_COLOR: u32 = 0x10B981;
    pub const FAILURE_COLOR: u32 = 0xEF4444;
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing permissions: {0}")]
    Forbidden(String),
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Cause shown to HTTP callers. Transport detail (URLs, ids) stays in the logs.
    pub fn public_cause(&self) -> String {
        match self {
            Self::Forbidden(reason) => reason.clone(),
            Self::RateLimited { .. } => "Rate limited by Discord, try again later".to_string(),
            Self::Unavailable(_) => "Discord unavailable".to_string(),
            Self::Other(_) => "Discord request failed".to_string(),
        }
    }
}

/// Lookups return `Ok(None)` for entities that do not exist; errors are reserved for
/// transport and permission failures.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn resolve_guild(&self, guild_id: Snowflake) -> Result<Option<Guild>, GatewayError>;

    async fn resolve_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<Option<Member>, GatewayError>;

    async fn resolve_role(
        &self,
        guild_id: Snowflake,
        role_id: Snowflake,
    ) -> Result<Option<Role>, GatewayError>;

    async fn grant_role(&self, member: &Member, role: &Role) -> Result<(), GatewayError>;

    async fn send_notification(
        &self,
        channel_id: Snowflake,
        notification: &Notification,
    ) -> Result<(), GatewayError>;

    /// Current connection snapshot; polled by the gateway runtime.
    async fn status(&self) -> GatewayStatus;
}
