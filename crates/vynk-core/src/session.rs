//! Verification session state machine: `pending` → `completed`, exactly once.

use vynk_kernel::Kernel;
use vynk_protocol::{
    FailureKind, GeoData, SessionStatus, Snowflake, VerificationSession,
};

use crate::bridge::{Bridge, BridgeError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,
    #[error("Session does not match guild or user")]
    Mismatch,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("session store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotFound => FailureKind::SessionNotFound,
            Self::Mismatch => FailureKind::Validation,
            Self::Bridge(err) => err.kind(),
            Self::Store(_) => FailureKind::Internal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub session: VerificationSession,
    /// False when the call replayed an already-completed session.
    pub newly_completed: bool,
}

#[derive(Clone)]
pub struct SessionService {
    kernel: Kernel,
    bridge: Bridge,
}

impl SessionService {
    pub fn new(kernel: Kernel, bridge: Bridge) -> Self {
        Self { kernel, bridge }
    }

    pub async fn open(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        ip_address: &str,
        geo: Option<&GeoData>,
    ) -> Result<VerificationSession, SessionError> {
        let session = self
            .kernel
            .create_session_async(user_id, guild_id, ip_address, geo)
            .await?;
        tracing::info!(
            session_id = %session.session_id,
            guild_id = %guild_id,
            user_id = %user_id,
            "verification session opened"
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<VerificationSession, SessionError> {
        self.kernel
            .get_session_async(session_id)
            .await?
            .ok_or(SessionError::NotFound)
    }

    /// Completes a pending session and enqueues its grant.
    ///
    /// Replaying the call for a completed session returns the stored session without
    /// enqueuing anything.
    pub async fn complete(
        &self,
        session_id: &str,
        guild_id: Snowflake,
        user_id: Snowflake,
        geo: Option<&GeoData>,
    ) -> Result<Completion, SessionError> {
        let existing = self.get(session_id).await?;
        if existing.discord_guild_id != guild_id || existing.discord_user_id != user_id {
            return Err(SessionError::Mismatch);
        }
        let newly_completed = self
            .kernel
            .update_session_async(session_id, SessionStatus::Completed, geo)
            .await?;
        if newly_completed {
            let task_id = self.bridge.submit_for_session(guild_id, user_id, session_id)?;
            metrics::counter!("vynk_sessions_completed_total").increment(1);
            tracing::info!(
                session_id,
                task_id = %task_id,
                "session completed, grant enqueued"
            );
        } else {
            tracing::debug!(session_id, "completion replayed for finished session");
        }
        let session = self.get(session_id).await?;
        Ok(Completion {
            session,
            newly_completed,
        })
    }

    /// Re-enqueues completed sessions whose grant result was never recorded.
    pub async fn recover(&self, batch: u32) -> Result<usize, SessionError> {
        let waiting = self
            .kernel
            .sessions_awaiting_grant_async(i64::from(batch))
            .await?;
        let mut enqueued = 0usize;
        for session in &waiting {
            self.bridge.submit_for_session(
                session.discord_guild_id,
                session.discord_user_id,
                &session.session_id,
            )?;
            enqueued += 1;
        }
        if enqueued > 0 {
            tracing::info!(enqueued, "re-enqueued grants for completed sessions");
        }
        Ok(enqueued)
    }
}
