use std::sync::Arc;

use vynk_core::bridge::Bridge;
use vynk_core::geolocation::Geolocator;
use vynk_core::session::SessionService;
use vynk_kernel::Kernel;
use vynk_otel::PrometheusHandle;

#[derive(Clone)]
pub(crate) struct AppState {
    kernel: Kernel,
    bridge: Bridge,
    sessions: SessionService,
    geolocator: Arc<dyn Geolocator>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(kernel: Kernel, bridge: Bridge, geolocator: Arc<dyn Geolocator>) -> Self {
        let sessions = SessionService::new(kernel.clone(), bridge.clone());
        Self {
            kernel,
            bridge,
            sessions,
            geolocator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    pub fn geolocator(&self) -> &Arc<dyn Geolocator> {
        &self.geolocator
    }

    pub fn metrics(&self) -> Option<&PrometheusHandle> {
        self.metrics.as_ref()
    }
}
