use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use vynk_core::bridge::{command_queue, Bridge, ResultStore};
use vynk_core::dispatcher::Dispatcher;
use vynk_core::gateway::{Gateway, MemoryGateway};
use vynk_core::geolocation::{Geolocator, NoopGeolocator};
use vynk_core::session::SessionService;
use vynk_core::{GatewayDriver, Settings};
use vynk_kernel::Kernel;
use vynk_otel::PrometheusHandle;
use vynk_protocol::GatewayStatus;

use crate::discord::RestGateway;
use crate::gateway_runtime::GatewayRuntime;
use crate::geolocation::AbstractApiGeolocator;
use crate::tasks::{spawn_supervised, TaskHandle, TaskManager};
use crate::{access_log, router, AppState};

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<()>,
    pub state: AppState,
    pub gateway: GatewayRuntime,
    pub background_tasks: TaskManager,
}

pub(crate) async fn build(settings: &Settings) -> anyhow::Result<BootstrapOutput> {
    let gateway: Arc<dyn Gateway> = match settings.gateway.driver {
        GatewayDriver::Rest => Arc::new(RestGateway::new(&settings.gateway)?),
        GatewayDriver::Memory => {
            warn!("memory gateway driver selected; no Discord connection");
            Arc::new(MemoryGateway::new())
        }
    };
    build_with_gateway(settings, gateway).await
}

pub(crate) async fn build_with_gateway(
    settings: &Settings,
    gateway: Arc<dyn Gateway>,
) -> anyhow::Result<BootstrapOutput> {
    let state_dir = settings.state_dir.clone();
    let kernel = tokio::task::spawn_blocking(move || Kernel::open(&state_dir))
        .await
        .context("kernel open task")??;

    let geolocator: Arc<dyn Geolocator> = if settings.geolocation.api_key.is_some() {
        Arc::new(AbstractApiGeolocator::new(&settings.geolocation))
    } else {
        info!("ABSTRACT_API_KEY not set; geolocation degrades to Unknown");
        Arc::new(NoopGeolocator)
    };

    let bridge_cfg = &settings.bridge;
    let store = Arc::new(ResultStore::new(bridge_cfg.result_ttl));
    let (queue, rx) = command_queue();
    let (status_tx, status_rx) = watch::channel(GatewayStatus::offline());
    let dispatcher = Dispatcher::new(
        rx,
        gateway.clone(),
        kernel.clone(),
        store.clone(),
        bridge_cfg.command_timeout,
    );
    let runtime = GatewayRuntime::spawn(
        dispatcher,
        gateway,
        status_tx,
        settings.gateway.status_poll,
    )?;
    let bridge = Bridge::new(queue, store.clone(), status_rx, bridge_cfg);
    info!(
        transport = bridge.transport().as_str(),
        deadline_ms = bridge.deadline().as_millis() as u64,
        ttl_ms = bridge_cfg.result_ttl.as_millis() as u64,
        "bridge ready"
    );

    let metrics = vynk_otel::init_metrics().cloned();
    let state = AppState::new(kernel, bridge, geolocator).with_metrics(metrics.clone());
    let mut background_tasks = TaskManager::new();
    if let Some(handle) = metrics {
        background_tasks.push(spawn_metrics_upkeep(handle));
    }
    background_tasks.push(spawn_result_sweeper(store));
    background_tasks.push(spawn_session_recovery(
        state.sessions().clone(),
        bridge_cfg.recovery_batch,
    ));

    let router = router::build_router().with_state::<()>(state.clone());
    Ok(BootstrapOutput {
        router,
        state,
        gateway: runtime,
        background_tasks,
    })
}

fn spawn_result_sweeper(store: Arc<ResultStore>) -> TaskHandle {
    let every = (store.ttl() / 4).max(Duration::from_secs(1));
    spawn_supervised("bridge.result_sweeper", move || {
        let store = store.clone();
        async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let reclaimed = store.reclaim_expired();
                if reclaimed > 0 {
                    metrics::counter!("vynk_result_store_reclaimed_total")
                        .increment(reclaimed as u64);
                    info!(reclaimed, "reclaimed orphaned results");
                }
                metrics::gauge!("vynk_result_store_entries").set(store.len() as f64);
            }
        }
    })
}

/// Histogram samples accumulate until upkeep drains them into the buckets.
fn spawn_metrics_upkeep(handle: PrometheusHandle) -> TaskHandle {
    spawn_supervised("metrics.upkeep", move || {
        let handle = handle.clone();
        async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                handle.run_upkeep();
            }
        }
    })
}

/// One pass at startup: completed sessions that never recorded a grant result.
fn spawn_session_recovery(sessions: SessionService, batch: u32) -> TaskHandle {
    TaskHandle::new(
        "sessions.recovery",
        tokio::spawn(async move {
            match sessions.recover(batch).await {
                Ok(0) => {}
                Ok(n) => info!(requeued = n, "session recovery complete"),
                Err(err) => warn!(error = %err, "session recovery failed"),
            }
        }),
    )
}

pub(crate) fn attach_http_layers(
    router: axum::Router<()>,
    concurrency_limit: usize,
) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
}

pub(crate) fn attach_global_layers(router: axum::Router<()>) -> axum::Router<()> {
    router.layer(axum::middleware::from_fn(access_log::access_log_mw))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpConfigError {
    #[error("invalid VYNK_HTTP_MAX_CONC: must be at least 1")]
    InvalidConcurrency,
    #[error("invalid bind address: {0}")]
    InvalidBind(String),
}

pub(crate) struct HttpConfig {
    pub addr: std::net::SocketAddr,
    pub concurrency_limit: usize,
}

pub(crate) fn http_config(settings: &Settings) -> Result<HttpConfig, HttpConfigError> {
    if settings.http_max_conc == 0 {
        return Err(HttpConfigError::InvalidConcurrency);
    }
    let raw = if settings.bind.contains(':') && !settings.bind.starts_with('[') {
        format!("[{}]:{}", settings.bind, settings.port)
    } else {
        format!("{}:{}", settings.bind, settings.port)
    };
    let addr = raw
        .parse()
        .map_err(|_| HttpConfigError::InvalidBind(raw.clone()))?;
    Ok(HttpConfig {
        addr,
        concurrency_limit: settings.http_max_conc,
    })
}
