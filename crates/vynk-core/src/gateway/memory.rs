use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use vynk_protocol::{GatewayStatus, Snowflake};

use super::{Gateway, GatewayError, Guild, Member, Notification, Role};

#[derive(Default)]
struct GuildState {
    name: String,
    roles: HashMap<Snowflake, Role>,
    members: HashMap<Snowflake, Member>,
}

/// In-process gateway used by tests and the `memory` driver.
///
/// Mirrors the real collaborator closely enough to exercise the grant protocol:
/// grants mutate member roles, and delays or failures can be injected.
#[derive(Default)]
pub struct MemoryGateway {
    guilds: Mutex<HashMap<Snowflake, GuildState>>,
    notifications: Mutex<Vec<(Snowflake, Notification)>>,
    grant_calls: AtomicUsize,
    grant_delay: Mutex<Option<Duration>>,
    grant_failure: Mutex<Option<String>>,
    offline: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_guild(&self, guild_id: Snowflake, name: &str) {
        self.guilds.lock().entry(guild_id).or_default().name = name.to_string();
    }

    pub fn add_role(&self, guild_id: Snowflake, role_id: Snowflake, name: &str) {
        let mut guilds = self.guilds.lock();
        let guild = guilds.entry(guild_id).or_default();
        guild.roles.insert(
            role_id,
            Role {
                id: role_id,
                name: name.to_string(),
            },
        );
    }

    pub fn add_member(&self, guild_id: Snowflake, user_id: Snowflake, display_name: &str) {
        let mut guilds = self.guilds.lock();
        let guild = guilds.entry(guild_id).or_default();
        guild.members.insert(
            user_id,
            Member {
                guild_id,
                user_id,
                tag: display_name.to_ascii_lowercase(),
                display_name: display_name.to_string(),
                roles: Vec::new(),
            },
        );
    }

    pub fn member_roles(&self, guild_id: Snowflake, user_id: Snowflake) -> Vec<Snowflake> {
        self.guilds
            .lock()
            .get(&guild_id)
            .and_then(|g| g.members.get(&user_id))
            .map(|m| m.roles.clone())
            .unwrap_or_default()
    }

    pub fn grant_calls(&self) -> usize {
        self.grant_calls.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> Vec<(Snowflake, Notification)> {
        self.notifications.lock().clone()
    }

    /// Every subsequent grant sleeps this long before applying.
    pub fn set_grant_delay(&self, delay: Option<Duration>) {
        *self.grant_delay.lock() = delay;
    }

    /// Every subsequent grant fails with this cause.
    pub fn set_grant_failure(&self, cause: Option<&str>) {
        *self.grant_failure.lock() = cause.map(str::to_string);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Gateway for MemoryGateway {
    async fn resolve_guild(&self, guild_id: Snowflake) -> Result<Option<Guild>, GatewayError> {
        Ok(self.guilds.lock().get(&guild_id).map(|g| Guild {
            id: guild_id,
            name: g.name.clone(),
        }))
    }

    async fn resolve_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<Option<Member>, GatewayError> {
        Ok(self
            .guilds
            .lock()
            .get(&guild_id)
            .and_then(|g| g.members.get(&user_id).cloned()))
    }

    async fn resolve_role(
        &self,
        guild_id: Snowflake,
        role_id: Snowflake,
    ) -> Result<Option<Role>, GatewayError> {
        Ok(self
            .guilds
            .lock()
            .get(&guild_id)
            .and_then(|g| g.roles.get(&role_id).cloned()))
    }

    async fn grant_role(&self, member: &Member, role: &Role) -> Result<(), GatewayError> {
        self.grant_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.grant_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(cause) = self.grant_failure.lock().clone() {
            return Err(GatewayError::Forbidden(cause));
        }
        let mut guilds = self.guilds.lock();
        let stored = guilds
            .get_mut(&member.guild_id)
            .and_then(|g| g.members.get_mut(&member.user_id))
            .ok_or_else(|| GatewayError::Other("member left the guild".into()))?;
        if !stored.has_role(role.id) {
            stored.roles.push(role.id);
        }
        Ok(())
    }

    async fn send_notification(
        &self,
        channel_id: Snowflake,
        notification: &Notification,
    ) -> Result<(), GatewayError> {
        self.notifications
            .lock()
            .push((channel_id, notification.clone()));
        Ok(())
    }

    async fn status(&self) -> GatewayStatus {
        if self.offline.load(Ordering::SeqCst) {
            return GatewayStatus::offline();
        }
        GatewayStatus {
            ready: true,
            guilds: self.guilds.lock().len(),
            latency_ms: Some(0.0),
            user: Some("vynk-memory".to_string()),
        }
    }
}
