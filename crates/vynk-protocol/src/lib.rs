use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod result;

pub use result::{CommandResult, FailureKind};

/// Discord snowflake id. Accepts JSON strings or numbers, always serializes as a string
/// (JavaScript clients lose precision on 64-bit numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snowflake(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid snowflake id: {0:?}")]
pub struct InvalidSnowflake(pub String);

impl Snowflake {
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = InvalidSnowflake;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidSnowflake(s.to_string()));
        }
        trimmed
            .parse::<u64>()
            .ok()
            .and_then(Snowflake::new)
            .ok_or_else(|| InvalidSnowflake(s.to_string()))
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnowflakeVisitor;

        impl Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-zero snowflake id as string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Snowflake, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Snowflake, E> {
                Snowflake::new(v).ok_or_else(|| E::custom(InvalidSnowflake(v.to_string())))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Snowflake, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(Snowflake::new)
                    .ok_or_else(|| E::custom(InvalidSnowflake(v.to_string())))
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

/// How a guild runs verification. Only `web` flows through the portal, but grants
/// from every surface share the same protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    #[default]
    Button,
    Captcha,
    Web,
}

impl VerificationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Captcha => "captcha",
            Self::Web => "web",
        }
    }
}

impl FromStr for VerificationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "button" => Ok(Self::Button),
            "captcha" => Ok(Self::Captcha),
            "web" => Ok(Self::Web),
            other => Err(format!("unknown verification method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfig {
    pub guild_id: Snowflake,
    pub verification_channel_id: Snowflake,
    pub verified_role_id: Snowflake,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_channel_id: Option<Snowflake>,
    #[serde(default)]
    pub method: VerificationMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown log status: {other}")),
        }
    }
}

/// Row to append to the verification log; the store assigns `id` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub user_name: String,
    pub method: VerificationMethod,
    pub status: LogStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationLogEntry {
    pub id: i64,
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub user_name: String,
    pub method: VerificationMethod,
    pub status: LogStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSession {
    pub session_id: String,
    pub discord_user_id: Snowflake,
    pub discord_guild_id: Snowflake,
    pub status: SessionStatus,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation_data: Option<GeoData>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_result: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_recorded_at: Option<DateTime<Utc>>,
}

/// Best-effort enrichment for a verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoData {
    pub ip_address: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub vpn_detected: bool,
    pub connection_type: String,
}

impl GeoData {
    pub const UNKNOWN: &'static str = "Unknown";

    /// Degraded record returned whenever the provider is unavailable.
    pub fn unknown(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            country: Self::UNKNOWN.into(),
            region: Self::UNKNOWN.into(),
            city: Self::UNKNOWN.into(),
            isp: Self::UNKNOWN.into(),
            vpn_detected: false,
            connection_type: Self::UNKNOWN.into(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.country == Self::UNKNOWN
            && self.region == Self::UNKNOWN
            && self.city == Self::UNKNOWN
            && self.isp == Self::UNKNOWN
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub recent_24h: u64,
}

impl GuildStats {
    /// Percentage of successful entries, rounded to one decimal.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pct = self.success as f64 / self.total as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }
}

/// Snapshot of the gateway connection published by the gateway runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub ready: bool,
    pub guilds: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl GatewayStatus {
    pub fn offline() -> Self {
        Self::default()
    }
}
