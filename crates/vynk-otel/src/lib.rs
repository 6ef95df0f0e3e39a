//! Process-wide tracing and metrics setup shared by the server and the CLI.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used by the HTTP access-log middleware.
pub const ACCESS_TARGET: &str = "http.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static METRICS: OnceCell<PrometheusHandle> = OnceCell::new();

pub use metrics_exporter_prometheus::PrometheusHandle;

/// Latency buckets (seconds) for every `*_seconds` histogram.
const SECONDS_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

/// Rolling file sink for access-log events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogFile {
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl AccessLogFile {
    /// Reads `VYNK_ACCESS_LOG_ROLL`, `VYNK_ACCESS_LOG_DIR` (else `VYNK_LOGS_DIR`, else
    /// `logs`), `VYNK_ACCESS_LOG_PREFIX` and `VYNK_ACCESS_LOG_ROTATION`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if lookup("VYNK_ACCESS_LOG_ROLL").as_deref() != Some("1") {
            return None;
        }
        let dir = lookup("VYNK_ACCESS_LOG_DIR")
            .or_else(|| lookup("VYNK_LOGS_DIR"))
            .unwrap_or_else(|| "logs".to_string());
        let prefix = lookup("VYNK_ACCESS_LOG_PREFIX").unwrap_or_else(|| "http-access".into());
        let rotation = match lookup("VYNK_ACCESS_LOG_ROTATION")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        };
        Some(Self {
            dir,
            prefix,
            rotation,
        })
    }

    fn appender(&self) -> tracing_appender::rolling::RollingFileAppender {
        match self.rotation {
            Rotation::Hourly => tracing_appender::rolling::hourly(&self.dir, &self.prefix),
            Rotation::Minutely => tracing_appender::rolling::minutely(&self.dir, &self.prefix),
            Rotation::Daily => tracing_appender::rolling::daily(&self.dir, &self.prefix),
        }
    }
}

/// Installs the global subscriber: console output filtered by `RUST_LOG` (default
/// `info`), plus the rolling access log when enabled. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));

    let Some(file) = AccessLogFile::from_lookup(|k| std::env::var(k).ok()) else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&file.dir).is_err() {
        eprintln!("failed to create access log directory {}", file.dir);
    }
    let (nb, guard) = tracing_appender::non_blocking(file.appender());
    let _ = ACCESS_GUARD.set(guard);
    let targets = Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO);
    let access_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(access_layer).try_init();
}

/// Installs the global Prometheus recorder on first call and returns its handle.
/// Later calls return the same handle; `None` means another recorder owns the slot.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    METRICS
        .get_or_try_init(build_recorder)
        .map_err(|err| tracing::warn!(error = %err, "metrics recorder not installed"))
        .ok()
}

fn build_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".into()), SECONDS_BUCKETS)?
        .install_recorder()
}
