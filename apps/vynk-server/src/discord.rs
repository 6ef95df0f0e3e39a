//! Discord REST (API v10) implementation of the gateway collaborator.

use std::time::{Duration, Instant};

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use vynk_core::gateway::{Gateway, GatewayError, Guild, Member, Notification, Role};
use vynk_core::GatewaySettings;
use vynk_protocol::{GatewayStatus, Snowflake};

const AUDIT_REASON: &str = "Web verification";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct GuildDto {
    id: Snowflake,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RoleDto {
    id: Snowflake,
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserDto {
    id: Snowflake,
    username: String,
    #[serde(default)]
    discriminator: Option<String>,
    #[serde(default)]
    global_name: Option<String>,
}

impl UserDto {
    fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some(d) if !d.is_empty() && d != "0" => format!("{}#{}", self.username, d),
            _ => self.username.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MemberDto {
    user: UserDto,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    roles: Vec<Snowflake>,
}

#[derive(Debug, Deserialize)]
struct RateLimitDto {
    #[serde(default)]
    retry_after: f64,
}

pub(crate) struct RestGateway {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl RestGateway {
    pub(crate) fn new(settings: &GatewaySettings) -> anyhow::Result<Self> {
        if settings.token.is_none() {
            warn!("DISCORD_TOKEN not set; gateway stays offline");
        }
        Ok(Self {
            client: crate::http_client::client_with_timeout(REQUEST_TIMEOUT)?,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, GatewayError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| GatewayError::Unavailable("bot token not configured".into()))?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.api_base, path))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {token}")))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, GatewayError> {
        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(resp),
            StatusCode::FORBIDDEN => Err(GatewayError::Forbidden(
                "Missing permissions (check bot role position)".into(),
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let body: RateLimitDto = resp.json().await.unwrap_or(RateLimitDto { retry_after: 1.0 });
                Err(GatewayError::RateLimited {
                    retry_after_ms: (body.retry_after * 1000.0).ceil() as u64,
                })
            }
            s if s.is_server_error() || s == StatusCode::UNAUTHORIZED => {
                Err(GatewayError::Unavailable(format!("discord returned {s}")))
            }
            s => Err(GatewayError::Other(format!("discord returned {s}"))),
        }
    }

    /// GET that maps 404 to `None`.
    async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, GatewayError> {
        let resp = self.send(self.request(Method::GET, path)?).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(path, "discord entity not found");
            return Ok(None);
        }
        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| GatewayError::Other(format!("decode {path}: {e}")))
    }

    async fn probe(&self) -> Result<GatewayStatus, GatewayError> {
        let started = Instant::now();
        let me: UserDto = self
            .get_opt("/users/@me")
            .await?
            .ok_or_else(|| GatewayError::Unavailable("bot user not found".into()))?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let guilds: Vec<GuildDto> = self
            .get_opt("/users/@me/guilds?limit=200")
            .await?
            .unwrap_or_default();
        Ok(GatewayStatus {
            ready: true,
            guilds: guilds.len(),
            latency_ms: Some(latency_ms),
            user: Some(me.tag()),
        })
    }
}

#[async_trait::async_trait]
impl Gateway for RestGateway {
    async fn resolve_guild(&self, guild_id: Snowflake) -> Result<Option<Guild>, GatewayError> {
        let guild: Option<GuildDto> = self.get_opt(&format!("/guilds/{guild_id}")).await?;
        Ok(guild.map(|g| Guild {
            id: g.id,
            name: g.name,
        }))
    }

    async fn resolve_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<Option<Member>, GatewayError> {
        let member: Option<MemberDto> = self
            .get_opt(&format!("/guilds/{guild_id}/members/{user_id}"))
            .await?;
        Ok(member.map(|m| {
            let tag = m.user.tag();
            let display_name = m
                .nick
                .or_else(|| m.user.global_name.clone())
                .unwrap_or_else(|| m.user.username.clone());
            Member {
                guild_id,
                user_id: m.user.id,
                tag,
                display_name,
                roles: m.roles,
            }
        }))
    }

    async fn resolve_role(
        &self,
        guild_id: Snowflake,
        role_id: Snowflake,
    ) -> Result<Option<Role>, GatewayError> {
        let roles: Vec<RoleDto> = self
            .get_opt(&format!("/guilds/{guild_id}/roles"))
            .await?
            .unwrap_or_default();
        Ok(roles.into_iter().find(|r| r.id == role_id).map(|r| Role {
            id: r.id,
            name: r.name,
        }))
    }

    async fn grant_role(&self, member: &Member, role: &Role) -> Result<(), GatewayError> {
        let path = format!(
            "/guilds/{}/members/{}/roles/{}",
            member.guild_id, member.user_id, role.id
        );
        let resp = self
            .send(
                self.request(Method::PUT, &path)?
                    .header("X-Audit-Log-Reason", AUDIT_REASON),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::Other("member or role disappeared".into()));
        }
        Ok(())
    }

    async fn send_notification(
        &self,
        channel_id: Snowflake,
        notification: &Notification,
    ) -> Result<(), GatewayError> {
        let body = json!({
            "embeds": [{
                "title": notification.title,
                "description": notification.description,
                "color": notification.color,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }]
        });
        let resp = self
            .send(
                self.request(Method::POST, &format!("/channels/{channel_id}/messages"))?
                    .json(&body),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::Other(format!("channel {channel_id} not found")));
        }
        Ok(())
    }

    async fn status(&self) -> GatewayStatus {
        if self.token.is_none() {
            return GatewayStatus::offline();
        }
        match self.probe().await {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "gateway status probe failed");
                GatewayStatus::offline()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_tags_follow_discriminator_rules() {
        let legacy: MemberDto = serde_json::from_value(json!({
            "user": {"id": "42", "username": "alice", "discriminator": "1234"},
            "roles": ["7"]
        }))
        .unwrap();
        assert_eq!(legacy.user.tag(), "alice#1234");
        assert_eq!(legacy.roles, vec![Snowflake::new(7).unwrap()]);

        let modern: UserDto = serde_json::from_value(json!({
            "id": "43", "username": "bob", "discriminator": "0", "global_name": "Bob"
        }))
        .unwrap();
        assert_eq!(modern.tag(), "bob");
    }

    #[tokio::test]
    async fn missing_token_reports_offline_without_network() {
        let gw = RestGateway::new(&GatewaySettings::default()).unwrap();
        assert!(!gw.status().await.ready);
        let err = gw
            .resolve_guild(Snowflake::new(1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }
}
