pub mod bridge;
mod config;
pub mod dispatcher;
pub mod gateway;
pub mod geolocation;
pub mod grant;
pub mod session;

pub use config::{
    config_schema_json, load_config, parse_config, BridgeSettings, Config, ConfigError,
    GatewayDriver, GatewaySettings, GeolocationSettings, Settings, Transport,
    DEFAULT_CONFIG_PATH,
};
