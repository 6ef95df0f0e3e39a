//! Idempotent role-grant protocol.
//!
//! Runs only on the dispatcher, so the membership check in step 5 and the grant in
//! step 6 can never interleave with another command for the same member.

use vynk_kernel::Kernel;
use vynk_protocol::{CommandResult, FailureKind, LogRecord, LogStatus, Snowflake, VerificationMethod};

use crate::gateway::{Gateway, GatewayError, Member, Notification};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted {
        role_name: String,
        member_name: String,
    },
    AlreadyVerified {
        role_name: String,
    },
}

impl GrantOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Granted {
                role_name,
                member_name,
            } => format!("Role {role_name} assigned successfully to {member_name}"),
            Self::AlreadyVerified { role_name } => format!("User already has {role_name} role"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GrantError {
    #[error("Guild not found")]
    GuildNotFound,
    #[error("User not found in guild")]
    MemberNotFound,
    #[error("Server not configured. Please run /setup-web-verification first.")]
    NotConfigured,
    #[error("Verified role (ID: {role_id}) not found in server")]
    RoleNotFound { role_id: Snowflake },
    #[error("Failed to assign role: {0}")]
    GrantFailed(String),
    #[error("Gateway lookup failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl GrantError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::GuildNotFound => FailureKind::GuildNotFound,
            Self::MemberNotFound => FailureKind::MemberNotFound,
            Self::NotConfigured => FailureKind::NotConfigured,
            Self::RoleNotFound { .. } => FailureKind::RoleNotFound,
            Self::GrantFailed(_) => FailureKind::GrantFailed,
            Self::Gateway(_) | Self::Store(_) => FailureKind::Internal,
        }
    }

    /// Text safe to hand to an external caller.
    pub fn public_message(&self) -> String {
        match self {
            Self::Gateway(_) | Self::Store(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub fn into_command_result(outcome: Result<GrantOutcome, GrantError>) -> CommandResult {
    match outcome {
        Ok(ok) => CommandResult::success(ok.message()),
        Err(err) => CommandResult::failure(err.kind(), err.public_message()),
    }
}

fn notification_for(member: &Member, method: VerificationMethod, success: bool) -> Notification {
    let (title, color) = if success {
        ("✅ Verification Success", Notification::SUCCESS_COLOR)
    } else {
        ("❌ Verification Failed", Notification::FAILURE_COLOR)
    };
    Notification {
        title: title.to_string(),
        description: format!(
            "**User:** <@{}>\n**Method:** {}\n**ID:** {}",
            member.user_id,
            method.as_str(),
            member.user_id
        ),
        color,
    }
}

async fn notify(
    gateway: &dyn Gateway,
    channel: Option<Snowflake>,
    member: &Member,
    method: VerificationMethod,
    success: bool,
) {
    let Some(channel) = channel else {
        return;
    };
    let note = notification_for(member, method, success);
    if let Err(err) = gateway.send_notification(channel, &note).await {
        tracing::warn!(
            guild_id = %member.guild_id,
            channel_id = %channel,
            error = %err,
            "log channel notification failed"
        );
    }
}

/// Grants the guild's verified role to a member at most once.
pub async fn grant_verified_role(
    gateway: &dyn Gateway,
    kernel: &Kernel,
    guild_id: Snowflake,
    user_id: Snowflake,
    method: VerificationMethod,
) -> Result<GrantOutcome, GrantError> {
    gateway
        .resolve_guild(guild_id)
        .await?
        .ok_or(GrantError::GuildNotFound)?;
    let member = gateway
        .resolve_member(guild_id, user_id)
        .await?
        .ok_or(GrantError::MemberNotFound)?;
    let config = kernel
        .get_guild_config_async(guild_id)
        .await?
        .ok_or(GrantError::NotConfigured)?;
    let role_id = config.verified_role_id;
    let role = gateway
        .resolve_role(guild_id, role_id)
        .await?
        .ok_or(GrantError::RoleNotFound { role_id })?;

    if member.has_role(role.id) {
        tracing::debug!(guild_id = %guild_id, user_id = %user_id, role = %role.name, "member already verified");
        return Ok(GrantOutcome::AlreadyVerified {
            role_name: role.name,
        });
    }

    tracing::info!(
        guild_id = %guild_id,
        user_id = %user_id,
        role = %role.name,
        member = %member.display_name,
        "assigning verified role"
    );
    if let Err(err) = gateway.grant_role(&member, &role).await {
        tracing::warn!(
            guild_id = %guild_id,
            user_id = %user_id,
            role = %role.name,
            error = %err,
            "role grant rejected"
        );
        notify(gateway, config.log_channel_id, &member, method, false).await;
        return Err(GrantError::GrantFailed(err.public_cause()));
    }

    kernel
        .append_verification_log_async(&LogRecord {
            guild_id,
            user_id,
            user_name: member.tag.clone(),
            method,
            status: LogStatus::Success,
        })
        .await?;
    notify(gateway, config.log_channel_id, &member, method, true).await;

    Ok(GrantOutcome::Granted {
        role_name: role.name,
        member_name: member.display_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use vynk_protocol::GuildConfig;

    fn sf(n: u64) -> Snowflake {
        Snowflake::new(n).unwrap()
    }

    const GUILD: u64 = 100;
    const USER: u64 = 200;
    const ROLE: u64 = 300;
    const LOGS: u64 = 400;

    fn fixture(configured: bool) -> (tempfile::TempDir, Kernel, MemoryGateway) {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let gw = MemoryGateway::new();
        gw.add_guild(sf(GUILD), "Test Guild");
        gw.add_role(sf(GUILD), sf(ROLE), "Verified");
        gw.add_member(sf(GUILD), sf(USER), "Alice");
        if configured {
            kernel
                .put_guild_config(&GuildConfig {
                    guild_id: sf(GUILD),
                    verification_channel_id: sf(1),
                    verified_role_id: sf(ROLE),
                    log_channel_id: Some(sf(LOGS)),
                    method: VerificationMethod::Web,
                })
                .unwrap();
        }
        (dir, kernel, gw)
    }

    #[tokio::test]
    async fn grants_once_then_reports_already_verified() {
        let (_dir, kernel, gw) = fixture(true);
        let first = grant_verified_role(&gw, &kernel, sf(GUILD), sf(USER), VerificationMethod::Web)
            .await
            .unwrap();
        assert_eq!(first.message(), "Role Verified assigned successfully to Alice");
        let second = grant_verified_role(&gw, &kernel, sf(GUILD), sf(USER), VerificationMethod::Web)
            .await
            .unwrap();
        assert_eq!(second.message(), "User already has Verified role");

        assert_eq!(gw.grant_calls(), 1);
        assert_eq!(kernel.count_verification_logs(sf(GUILD), Some(sf(USER))).unwrap(), 1);
        let notes = gw.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, sf(LOGS));
        assert_eq!(notes[0].1.color, Notification::SUCCESS_COLOR);
    }

    #[tokio::test]
    async fn lookups_short_circuit_in_order() {
        let (_dir, kernel, gw) = fixture(false);
        let err = grant_verified_role(&gw, &kernel, sf(999), sf(USER), VerificationMethod::Web)
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::GuildNotFound));
        let err = grant_verified_role(&gw, &kernel, sf(GUILD), sf(999), VerificationMethod::Web)
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::MemberNotFound));
        let err = grant_verified_role(&gw, &kernel, sf(GUILD), sf(USER), VerificationMethod::Web)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Server not configured. Please run /setup-web-verification first."
        );
        assert_eq!(gw.grant_calls(), 0);
    }

    #[tokio::test]
    async fn missing_role_names_the_configured_id() {
        let (_dir, kernel, gw) = fixture(true);
        kernel
            .put_guild_config(&GuildConfig {
                guild_id: sf(GUILD),
                verification_channel_id: sf(1),
                verified_role_id: sf(777),
                log_channel_id: None,
                method: VerificationMethod::Web,
            })
            .unwrap();
        let err = grant_verified_role(&gw, &kernel, sf(GUILD), sf(USER), VerificationMethod::Web)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Verified role (ID: 777) not found in server");
        assert_eq!(err.kind(), FailureKind::RoleNotFound);
    }

    #[tokio::test]
    async fn provider_failure_writes_no_log_but_notifies() {
        let (_dir, kernel, gw) = fixture(true);
        gw.set_grant_failure(Some("Missing Permissions"));
        let res = into_command_result(
            grant_verified_role(&gw, &kernel, sf(GUILD), sf(USER), VerificationMethod::Button)
                .await,
        );
        assert_eq!(res.kind(), Some(FailureKind::GrantFailed));
        assert!(res.text().contains("Missing Permissions"));
        assert_eq!(kernel.count_verification_logs(sf(GUILD), None).unwrap(), 0);
        let notes = gw.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].1.color, Notification::FAILURE_COLOR);
    }

    struct UnreachableGrant(MemoryGateway);

    #[async_trait::async_trait]
    impl Gateway for UnreachableGrant {
        async fn resolve_guild(
            &self,
            guild_id: Snowflake,
        ) -> Result<Option<crate::gateway::Guild>, GatewayError> {
            self.0.resolve_guild(guild_id).await
        }

        async fn resolve_member(
            &self,
            guild_id: Snowflake,
            user_id: Snowflake,
        ) -> Result<Option<Member>, GatewayError> {
            self.0.resolve_member(guild_id, user_id).await
        }

        async fn resolve_role(
            &self,
            guild_id: Snowflake,
            role_id: Snowflake,
        ) -> Result<Option<crate::gateway::Role>, GatewayError> {
            self.0.resolve_role(guild_id, role_id).await
        }

        async fn grant_role(
            &self,
            member: &Member,
            role: &crate::gateway::Role,
        ) -> Result<(), GatewayError> {
            Err(GatewayError::Unavailable(format!(
                "error sending request for url (https://discord.com/api/v10/guilds/{}/members/{}/roles/{})",
                member.guild_id, member.user_id, role.id
            )))
        }

        async fn send_notification(
            &self,
            channel_id: Snowflake,
            notification: &Notification,
        ) -> Result<(), GatewayError> {
            self.0.send_notification(channel_id, notification).await
        }

        async fn status(&self) -> vynk_protocol::GatewayStatus {
            self.0.status().await
        }
    }

    #[tokio::test]
    async fn transport_detail_stays_out_of_the_result() {
        let (_dir, kernel, gw) = fixture(true);
        let gw = UnreachableGrant(gw);
        let res = into_command_result(
            grant_verified_role(&gw, &kernel, sf(GUILD), sf(USER), VerificationMethod::Web).await,
        );
        assert_eq!(res.kind(), Some(FailureKind::GrantFailed));
        assert_eq!(res.text(), "Failed to assign role: Discord unavailable");
        assert!(!res.text().contains(&GUILD.to_string()));
        assert!(!res.text().contains("discord.com"));
    }
}
