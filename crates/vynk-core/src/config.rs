use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "configs/vynk.toml";
pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_ABSTRACT_API_URL: &str = "https://ipgeolocation.abstractapi.com/v1/";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("config {path} failed schema validation: {message}")]
    Schema { path: String, message: String },
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Interface to bind the HTTP surface on.
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Directory holding the SQLite store.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Upper bound on concurrently served HTTP requests.
    #[serde(default)]
    pub http_max_conc: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BridgeSection {
    /// "result_store" (default) or "reply".
    #[serde(default)]
    pub transport: Option<String>,
    /// How long an HTTP caller waits for a command result.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Execution budget for a single command on the dispatcher.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    /// Unclaimed results are dropped after this long (defaults to twice the deadline).
    #[serde(default)]
    pub result_ttl_secs: Option<u64>,
    /// Maximum sessions re-enqueued by startup recovery.
    #[serde(default)]
    pub recovery_batch: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    /// "rest" (default) or "memory".
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Interval between gateway status refreshes.
    #[serde(default)]
    pub status_poll_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GeolocationSection {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub cache_capacity: Option<u64>,
}

/// On-disk configuration (`configs/vynk.toml`).
#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub geolocation: GeolocationSection,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_config(content: &str, origin: &str) -> Result<Config, ConfigError> {
    let parse_err = |e: &dyn std::fmt::Display| ConfigError::Parse {
        path: origin.to_string(),
        message: e.to_string(),
    };
    let raw: toml::Value = toml::from_str(content).map_err(|e| parse_err(&e))?;
    let json_value = serde_json::to_value(&raw).map_err(|e| parse_err(&e))?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigError::Schema {
            path: origin.to_string(),
            message: validation_errors.join(", "),
        });
    }
    toml::from_str(content).map_err(|e| parse_err(&e))
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    parse_config(&content, &display)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Waiters block on the shared result store.
    ResultStore,
    /// Each command carries its own reply channel.
    Reply,
}

impl Transport {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "result_store" | "result-store" | "store" => Some(Self::ResultStore),
            "reply" => Some(Self::Reply),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResultStore => "result_store",
            Self::Reply => "reply",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayDriver {
    Rest,
    Memory,
}

impl GatewayDriver {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rest" | "discord" => Some(Self::Rest),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub transport: Transport,
    pub deadline: Duration,
    pub command_timeout: Duration,
    pub result_ttl: Duration,
    pub recovery_batch: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let deadline = Duration::from_secs(15);
        Self {
            transport: Transport::ResultStore,
            deadline,
            command_timeout: Duration::from_secs(10),
            result_ttl: deadline * 2,
            recovery_batch: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub driver: GatewayDriver,
    pub api_base: String,
    pub token: Option<String>,
    pub status_poll: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            driver: GatewayDriver::Rest,
            api_base: DEFAULT_DISCORD_API_BASE.to_string(),
            token: None,
            status_poll: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeolocationSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
}

impl Default for GeolocationSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_ABSTRACT_API_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 10_000,
        }
    }
}

/// Effective runtime settings: file values with environment overrides applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub state_dir: PathBuf,
    pub http_max_conc: usize,
    pub bridge: BridgeSettings,
    pub gateway: GatewaySettings,
    pub geolocation: GeolocationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5000,
            state_dir: PathBuf::from("state"),
            http_max_conc: 1024,
            bridge: BridgeSettings::default(),
            gateway: GatewaySettings::default(),
            geolocation: GeolocationSettings::default(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: "expected a number",
    })
}

fn positive_secs(key: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: secs.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(Duration::from_secs(secs))
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Settings {
    /// Loads `VYNK_CONFIG` (or `configs/vynk.toml` when present) and applies the
    /// process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = match std::env::var("VYNK_CONFIG").ok().and_then(non_empty) {
            Some(path) => load_config(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                load_config(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Config::default(),
        };
        Self::resolve(&cfg, |key| std::env::var(key).ok())
    }

    /// Resolves file values, then overrides from `lookup` (an environment reader).
    pub fn resolve(
        cfg: &Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = |key: &str| lookup(key).and_then(non_empty);
        let mut out = Settings::default();

        if let Some(bind) = cfg.server.bind.clone() {
            out.bind = bind;
        }
        if let Some(port) = cfg.server.port {
            out.port = port;
        }
        if let Some(dir) = cfg.server.state_dir.as_ref() {
            out.state_dir = PathBuf::from(dir);
        }
        if let Some(n) = cfg.server.http_max_conc {
            out.http_max_conc = n.max(1);
        }
        if let Some(raw) = env("VYNK_BIND") {
            out.bind = raw;
        }
        if let Some(raw) = env("VYNK_PORT") {
            out.port = parse_num("VYNK_PORT", &raw)?;
        }
        if let Some(raw) = env("VYNK_STATE_DIR") {
            out.state_dir = PathBuf::from(raw);
        }
        if let Some(raw) = env("VYNK_HTTP_MAX_CONC") {
            out.http_max_conc = parse_num::<usize>("VYNK_HTTP_MAX_CONC", &raw)?.max(1);
        }

        // bridge
        let transport_raw = env("VYNK_BRIDGE_TRANSPORT").or_else(|| cfg.bridge.transport.clone());
        if let Some(raw) = transport_raw {
            out.bridge.transport =
                Transport::parse(&raw).ok_or(ConfigError::InvalidValue {
                    key: "bridge.transport",
                    value: raw.clone(),
                    reason: "expected result_store or reply",
                })?;
        }
        let deadline_secs = match env("VYNK_BRIDGE_DEADLINE_SECS") {
            Some(raw) => Some(parse_num("VYNK_BRIDGE_DEADLINE_SECS", &raw)?),
            None => cfg.bridge.deadline_secs,
        };
        if let Some(secs) = deadline_secs {
            out.bridge.deadline = positive_secs("bridge.deadline_secs", secs)?;
        }
        let command_secs = match env("VYNK_COMMAND_TIMEOUT_SECS") {
            Some(raw) => Some(parse_num("VYNK_COMMAND_TIMEOUT_SECS", &raw)?),
            None => cfg.bridge.command_timeout_secs,
        };
        if let Some(secs) = command_secs {
            out.bridge.command_timeout = positive_secs("bridge.command_timeout_secs", secs)?;
        }
        let ttl_secs = match env("VYNK_RESULT_TTL_SECS") {
            Some(raw) => Some(parse_num("VYNK_RESULT_TTL_SECS", &raw)?),
            None => cfg.bridge.result_ttl_secs,
        };
        out.bridge.result_ttl = match ttl_secs {
            Some(secs) => positive_secs("bridge.result_ttl_secs", secs)?,
            None => out.bridge.deadline * 2,
        };
        if out.bridge.result_ttl < out.bridge.deadline {
            return Err(ConfigError::InvalidValue {
                key: "bridge.result_ttl_secs",
                value: out.bridge.result_ttl.as_secs().to_string(),
                reason: "must not be shorter than the bridge deadline",
            });
        }
        if let Some(n) = cfg.bridge.recovery_batch {
            out.bridge.recovery_batch = n;
        }

        // gateway
        let driver_raw = env("VYNK_GATEWAY_DRIVER").or_else(|| cfg.gateway.driver.clone());
        if let Some(raw) = driver_raw {
            out.gateway.driver = GatewayDriver::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "gateway.driver",
                value: raw.clone(),
                reason: "expected rest or memory",
            })?;
        }
        if let Some(base) = env("DISCORD_API_BASE").or_else(|| cfg.gateway.api_base.clone()) {
            out.gateway.api_base = base.trim_end_matches('/').to_string();
        }
        out.gateway.token = env("DISCORD_TOKEN");
        if let Some(secs) = cfg.gateway.status_poll_secs {
            out.gateway.status_poll = positive_secs("gateway.status_poll_secs", secs)?;
        }

        // geolocation
        if let Some(url) = env("ABSTRACT_API_URL").or_else(|| cfg.geolocation.api_url.clone()) {
            out.geolocation.api_url = url;
        }
        out.geolocation.api_key = env("ABSTRACT_API_KEY");
        if let Some(secs) = cfg.geolocation.timeout_secs {
            out.geolocation.timeout = positive_secs("geolocation.timeout_secs", secs)?;
        }
        if let Some(secs) = cfg.geolocation.cache_ttl_secs {
            out.geolocation.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(cap) = cfg.geolocation.cache_capacity {
            out.geolocation.cache_capacity = cap;
        }

        Ok(out)
    }
}
