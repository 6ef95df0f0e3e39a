use std::{net::SocketAddr, time::Duration};
use tracing::{error, info, warn};

mod access_log;
mod api;
mod app_state;
mod bootstrap;
mod discord;
mod gateway_runtime;
mod geolocation;
mod http_client;
mod responses;
mod router;
mod tasks;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    vynk_otel::init();

    let settings = match vynk_core::Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let http_cfg = match bootstrap::http_config(&settings) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let bootstrap::BootstrapOutput {
        router,
        state: _,
        gateway,
        background_tasks,
    } = match bootstrap::build(&settings).await {
        Ok(out) => out,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    let app = bootstrap::attach_global_layers(bootstrap::attach_http_layers(
        router,
        http_cfg.concurrency_limit,
    ));

    let listener = match tokio::net::TcpListener::bind(http_cfg.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %http_cfg.addr, "bind server socket: {err}");
            std::process::exit(1);
        }
    };
    info!(addr = %http_cfg.addr, "vynk-server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("stopping gateway runtime");
    gateway.shutdown().await;
    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::router::paths;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Instant;
    use tower::ServiceExt;

    use vynk_core::gateway::MemoryGateway;
    use vynk_core::Settings;
    use vynk_kernel::Kernel;
    use vynk_protocol::{GuildConfig, Snowflake, VerificationMethod};

    const GUILD: u64 = 111;
    const ROLE: u64 = 222;
    const LOGS: u64 = 333;
    const ALICE: u64 = 1001;
    const BOB: u64 = 1002;

    fn sf(n: u64) -> Snowflake {
        Snowflake::new(n).unwrap()
    }

    struct TestApp {
        _dir: tempfile::TempDir,
        app: axum::Router,
        state: AppState,
        gateway: Arc<MemoryGateway>,
        runtime: gateway_runtime::GatewayRuntime,
        tasks: tasks::TaskManager,
    }

    impl TestApp {
        fn kernel(&self) -> &Kernel {
            self.state.kernel()
        }

        fn configure(&self) {
            self.kernel()
                .put_guild_config(&GuildConfig {
                    guild_id: sf(GUILD),
                    verification_channel_id: sf(1),
                    verified_role_id: sf(ROLE),
                    log_channel_id: Some(sf(LOGS)),
                    method: VerificationMethod::Web,
                })
                .unwrap();
        }

        async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
            let resp = self.app.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        async fn get(&self, uri: &str) -> (StatusCode, Value) {
            self.call(Request::get(uri).body(Body::empty()).unwrap())
                .await
        }

        async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            self.call(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        async fn wait_ready(&self, ready: bool) {
            let deadline = Instant::now() + Duration::from_secs(3);
            while self.state.bridge().is_ready() != ready {
                assert!(Instant::now() < deadline, "gateway readiness never became {ready}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        async fn shutdown(self) {
            self.runtime.shutdown().await;
            self.tasks.shutdown_with_grace(Duration::ZERO).await;
        }
    }

    async fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.state_dir = dir.path().to_path_buf();
        settings.gateway.status_poll = Duration::from_millis(20);
        settings.bridge.deadline = Duration::from_secs(5);
        settings.bridge.result_ttl = Duration::from_secs(10);
        // unreachable provider: every lookup degrades
        settings.geolocation.api_key = Some("test-key".into());
        settings.geolocation.api_url = "http://127.0.0.1:9/v1/".into();
        settings.geolocation.timeout = Duration::from_millis(500);

        let gateway = Arc::new(MemoryGateway::new());
        gateway.add_guild(sf(GUILD), "Guild");
        gateway.add_role(sf(GUILD), sf(ROLE), "Verified");
        gateway.add_member(sf(GUILD), sf(ALICE), "Alice");
        gateway.add_member(sf(GUILD), sf(BOB), "Bob");

        let out = bootstrap::build_with_gateway(&settings, gateway.clone())
            .await
            .unwrap();
        let app = bootstrap::attach_global_layers(bootstrap::attach_http_layers(out.router, 64));
        let h = TestApp {
            _dir: dir,
            app,
            state: out.state,
            gateway,
            runtime: out.gateway,
            tasks: out.background_tasks,
        };
        h.wait_ready(true).await;
        h
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assign_role_grants_once_then_reports_already_verified() {
        let h = test_app().await;
        h.configure();

        let (status, body) = h
            .post(paths::ASSIGN_ROLE, json!({"guild_id": "111", "user_id": "1001"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Role Verified assigned successfully to Alice");

        let (status, body) = h
            .post(paths::ASSIGN_ROLE, json!({"guild_id": 111, "user_id": 1001}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "User already has Verified role");

        assert_eq!(h.gateway.grant_calls(), 1);
        assert_eq!(
            h.kernel()
                .count_verification_logs(sf(GUILD), Some(sf(ALICE)))
                .unwrap(),
            1
        );
        let notes = h.gateway.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, sf(LOGS));

        let (_, stats) = h.get("/api/stats/111").await;
        assert_eq!(stats["success"], true);
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["success_count"], 1);
        assert_eq!(stats["success_rate"], 100.0);

        let (_, recent) = h.get("/api/verifications/111?limit=500").await;
        assert_eq!(recent["count"], 1);
        assert_eq!(recent["verifications"][0]["user_name"], "alice");
        assert_eq!(recent["verifications"][0]["status"], "success");
        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metrics_expose_dispatcher_and_bridge_counters() {
        let h = test_app().await;
        h.configure();
        let (status, _) = h
            .post(paths::ASSIGN_ROLE, json!({"guild_id": "111", "user_id": "1002"}))
            .await;
        assert_eq!(status, StatusCode::OK);

        let resp = h
            .app
            .clone()
            .oneshot(Request::get(paths::METRICS).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"],
            "text/plain; version=0.0.4"
        );
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("vynk_commands_enqueued_total"));
        assert!(text.contains("vynk_dispatcher_commands_total{outcome=\"success\"}"));
        assert!(text.contains("vynk_bridge_wait_seconds_bucket"));
        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unconfigured_guild_reports_and_leaves_nothing_behind() {
        let h = test_app().await;
        let (status, body) = h
            .post(paths::ASSIGN_ROLE, json!({"guild_id": "111", "user_id": "1001"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(
            body["error"],
            "Server not configured. Please run /setup-web-verification first."
        );
        assert_eq!(body["code"], "not_configured");
        assert_eq!(h.gateway.grant_calls(), 0);
        assert_eq!(h.kernel().count_verification_logs(sf(GUILD), None).unwrap(), 0);
        assert!(h.state.bridge().store().is_empty());
        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_input_is_rejected_with_400() {
        let h = test_app().await;
        let (status, body) = h.post(paths::ASSIGN_ROLE, json!({"guild_id": "111"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing guild_id or user_id");

        let (status, body) = h
            .post(paths::ASSIGN_ROLE, json!({"guild_id": "abc", "user_id": "1"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid guild_id");

        let (status, body) = h
            .call(
                Request::post(paths::ASSIGN_ROLE)
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = h.get("/api/stats/not-a-snowflake").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bot_status_tracks_gateway_readiness() {
        let h = test_app().await;
        h.configure();
        let (status, body) = h.get(paths::BOT_STATUS).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");
        assert_eq!(body["guilds"], 1);
        assert_eq!(body["user"], "vynk-memory");

        h.gateway.set_offline(true);
        h.wait_ready(false).await;
        let (_, body) = h.get(paths::BOT_STATUS).await;
        assert_eq!(body, json!({"success": true, "status": "offline"}));

        let (status, body) = h
            .post(paths::ASSIGN_ROLE, json!({"guild_id": "111", "user_id": "1001"}))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Bot not ready");
        assert_eq!(h.gateway.grant_calls(), 0);

        let (_, health) = h.get(paths::HEALTHZ).await;
        assert_eq!(health["ok"], true);
        assert_eq!(health["gateway_ready"], false);
        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn verify_flow_degrades_geolocation_and_grants_once() {
        let h = test_app().await;
        h.configure();

        let (status, opened) = h
            .call(
                Request::get("/verify/111/1001")
                    .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let session_id = opened["session_id"].as_str().unwrap().to_string();
        assert_eq!(opened["geolocation_data"]["ip_address"], "203.0.113.7");
        assert_eq!(opened["geolocation_data"]["country"], "Unknown");

        let payload = json!({"session_id": session_id, "guild_id": "111", "user_id": "1001"});
        let (status, body) = h.post(paths::VERIFY, payload.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Verification completed successfully!");
        assert_eq!(body["newly_completed"], true);
        assert_eq!(body["geolocation_data"]["city"], "Unknown");
        assert_eq!(body["geolocation_data"]["vpn_detected"], false);

        let deadline = Instant::now() + Duration::from_secs(5);
        let session = loop {
            let (_, body) = h.get(&format!("/api/session/{session_id}")).await;
            if !body["session"]["grant_result"].is_null() {
                break body["session"].clone();
            }
            assert!(Instant::now() < deadline, "grant result never recorded");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(session["status"], "completed");
        assert_eq!(session["grant_result"]["success"], true);

        let (status, replay) = h.post(paths::VERIFY, payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replay["newly_completed"], false);
        assert_eq!(h.gateway.grant_calls(), 1);
        h.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn verify_rejects_unknown_and_mismatched_sessions() {
        let h = test_app().await;
        let (status, body) = h
            .post(
                paths::VERIFY,
                json!({"session_id": "missing", "guild_id": "111", "user_id": "1001"}),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Session not found");

        let (status, body) = h.post(paths::VERIFY, json!({"session_id": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields");

        let (_, opened) = h.get("/verify/111/1001").await;
        let (status, _) = h
            .post(
                paths::VERIFY,
                json!({"session_id": opened["session_id"], "guild_id": "111", "user_id": "1002"}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h.get("/api/session/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        h.shutdown().await;
    }
}
