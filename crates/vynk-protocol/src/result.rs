use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Machine-readable failure class carried alongside the human-readable error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    NotReady,
    GuildNotFound,
    MemberNotFound,
    NotConfigured,
    RoleNotFound,
    GrantFailed,
    Timeout,
    SessionNotFound,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotReady => "not_ready",
            Self::GuildNotFound => "guild_not_found",
            Self::MemberNotFound => "member_not_found",
            Self::NotConfigured => "not_configured",
            Self::RoleNotFound => "role_not_found",
            Self::GrantFailed => "grant_failed",
            Self::Timeout => "timeout",
            Self::SessionNotFound => "session_not_found",
            Self::Internal => "internal",
        }
    }
}

/// Outcome of one privileged command, written once by the dispatcher and read once by
/// whoever issued it.
///
/// On the wire this is `{"success":true,"message":..}` or
/// `{"success":false,"error":..,"code":..}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Success { message: String },
    Failure { kind: FailureKind, error: String },
}

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            message: message.into(),
        }
    }

    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// The message on success or the error text on failure.
    pub fn text(&self) -> &str {
        match self {
            Self::Success { message } => message,
            Self::Failure { error, .. } => error,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<FailureKind>,
}

impl Serialize for CommandResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let env = match self {
            Self::Success { message } => Envelope {
                success: true,
                message: Some(message.clone()),
                error: None,
                code: None,
            },
            Self::Failure { kind, error } => Envelope {
                success: false,
                message: None,
                error: Some(error.clone()),
                code: Some(*kind),
            },
        };
        env.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CommandResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let env = Envelope::deserialize(deserializer)?;
        if env.success {
            Ok(Self::Success {
                message: env.message.unwrap_or_default(),
            })
        } else {
            Ok(Self::Failure {
                kind: env.code.unwrap_or(FailureKind::Internal),
                error: env.error.unwrap_or_default(),
            })
        }
    }
}
