//! Dedicated OS thread hosting the gateway scheduler.
//!
//! Every privileged mutation runs on this thread's current-thread runtime. The HTTP side
//! only reaches it through the command queue and the published `GatewayStatus`.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vynk_core::dispatcher::Dispatcher;
use vynk_core::gateway::Gateway;
use vynk_protocol::GatewayStatus;

pub(crate) struct GatewayRuntime {
    shutdown: watch::Sender<bool>,
    status: Arc<watch::Sender<GatewayStatus>>,
    thread: Option<JoinHandle<()>>,
}

impl GatewayRuntime {
    pub(crate) fn spawn(
        dispatcher: Dispatcher,
        gateway: Arc<dyn Gateway>,
        status: watch::Sender<GatewayStatus>,
        poll_every: Duration,
    ) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = Arc::new(status);
        let status_for_thread = status.clone();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build gateway runtime")?;
        let thread = std::thread::Builder::new()
            .name("vynk-gateway".into())
            .spawn(move || {
                rt.block_on(async move {
                    let poller = poll_status(
                        gateway,
                        status_for_thread,
                        poll_every,
                        shutdown_rx.clone(),
                    );
                    tokio::join!(dispatcher.run(shutdown_rx), poller);
                });
                debug!("gateway runtime exited");
            })
            .map_err(|e| anyhow!("spawn gateway thread: {e}"))?;
        info!(poll_ms = poll_every.as_millis() as u64, "gateway runtime started");
        Ok(Self {
            shutdown: shutdown_tx,
            status,
            thread: Some(thread),
        })
    }

    /// Stops the dispatcher, joins the thread and publishes an offline status.
    pub(crate) async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("gateway thread did not exit cleanly");
            }
        }
        self.status.send_replace(GatewayStatus::offline());
        info!("gateway runtime stopped");
    }
}

async fn poll_status(
    gateway: Arc<dyn Gateway>,
    status: Arc<watch::Sender<GatewayStatus>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let next = gateway.status().await;
        let was_ready = status.borrow().ready;
        if next.ready != was_ready {
            info!(ready = next.ready, guilds = next.guilds, "gateway readiness changed");
        }
        metrics::gauge!("vynk_gateway_ready").set(if next.ready { 1.0 } else { 0.0 });
        status.send_replace(next);
    }
}
