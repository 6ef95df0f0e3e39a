use vynk_protocol::GeoData;

/// Best-effort IP enrichment. Implementations never fail: when the provider is
/// unavailable they return [`GeoData::unknown`].
#[async_trait::async_trait]
pub trait Geolocator: Send + Sync {
    async fn lookup(&self, ip: &str) -> GeoData;
}

/// Used when no provider key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGeolocator;

#[async_trait::async_trait]
impl Geolocator for NoopGeolocator {
    async fn lookup(&self, ip: &str) -> GeoData {
        GeoData::unknown(ip)
    }
}
