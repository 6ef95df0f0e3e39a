use moka::future::Cache;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use vynk_core::geolocation::Geolocator;
use vynk_core::GeolocationSettings;
use vynk_protocol::GeoData;

#[derive(Debug, Default, Deserialize)]
struct AbstractSecurity {
    #[serde(default)]
    is_vpn: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct AbstractConnection {
    #[serde(default)]
    connection_type: Option<String>,
    #[serde(default)]
    isp_name: Option<String>,
}

/// Subset of the Abstract API IP geolocation response we consume.
#[derive(Debug, Default, Deserialize)]
struct AbstractResponse {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    security: Option<AbstractSecurity>,
    #[serde(default)]
    connection: Option<AbstractConnection>,
}

fn or_unknown(v: Option<String>) -> String {
    v.filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| GeoData::UNKNOWN.to_string())
}

impl AbstractResponse {
    fn into_geo(self, ip: &str) -> GeoData {
        let connection = self.connection.unwrap_or_default();
        GeoData {
            ip_address: ip.to_string(),
            country: or_unknown(self.country),
            region: or_unknown(self.region),
            city: or_unknown(self.city),
            isp: or_unknown(self.isp.or(connection.isp_name)),
            vpn_detected: self.security.and_then(|s| s.is_vpn).unwrap_or(false),
            connection_type: or_unknown(connection.connection_type),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum LookupError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Abstract API client with a TTL cache in front; never surfaces errors.
pub struct AbstractApiGeolocator {
    client: Option<reqwest::Client>,
    api_url: String,
    api_key: Option<String>,
    cache: Cache<String, GeoData>,
}

impl AbstractApiGeolocator {
    pub fn new(settings: &GeolocationSettings) -> Self {
        let client = match crate::http_client::client_with_timeout(settings.timeout) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(error = %err, "failed to build geolocation http client; lookups degrade");
                None
            }
        };
        let cache = Cache::builder()
            .max_capacity(settings.cache_capacity)
            .time_to_live(settings.cache_ttl.max(Duration::from_secs(1)))
            .build();
        Self {
            client,
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
            cache,
        }
    }

    async fn fetch(&self, client: &reqwest::Client, key: &str, ip: &str) -> Result<GeoData, LookupError> {
        let resp = client
            .get(&self.api_url)
            .query(&[
                ("api_key", key),
                ("ip_address", ip),
                ("fields", "country,region,city,isp,security,connection"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(LookupError::Status(resp.status()));
        }
        let body: AbstractResponse = resp.json().await?;
        Ok(body.into_geo(ip))
    }
}

#[async_trait::async_trait]
impl Geolocator for AbstractApiGeolocator {
    async fn lookup(&self, ip: &str) -> GeoData {
        let (Some(client), Some(key)) = (self.client.as_ref(), self.api_key.as_deref()) else {
            debug!("geolocation key not set; returning unknown");
            return GeoData::unknown(ip);
        };
        if let Some(hit) = self.cache.get(ip).await {
            metrics::counter!("vynk_geolocation_cache_hits_total").increment(1);
            return hit;
        }
        match self.fetch(client, key, ip).await {
            Ok(geo) => {
                self.cache.insert(ip.to_string(), geo.clone()).await;
                geo
            }
            Err(err) => {
                metrics::counter!("vynk_geolocation_failures_total").increment(1);
                warn!(error = %err, "geolocation lookup failed; degrading");
                GeoData::unknown(ip)
            }
        }
    }
}
