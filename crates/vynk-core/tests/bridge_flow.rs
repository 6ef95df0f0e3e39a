use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::timeout;
use vynk_core::bridge::{command_queue, Bridge, BridgeError, ResultStore};
use vynk_core::dispatcher::{Dispatcher, COMMAND_TIMEOUT_MESSAGE};
use vynk_core::gateway::MemoryGateway;
use vynk_core::session::SessionService;
use vynk_core::{BridgeSettings, Transport};
use vynk_kernel::Kernel;
use vynk_protocol::{
    FailureKind, GatewayStatus, GuildConfig, SessionStatus, Snowflake, VerificationMethod,
};

const GUILD: u64 = 111;
const ROLE: u64 = 222;
const LOGS: u64 = 333;
const ALICE: u64 = 1001;
const BOB: u64 = 1002;

fn sf(n: u64) -> Snowflake {
    Snowflake::new(n).unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    kernel: Kernel,
    gateway: Arc<MemoryGateway>,
    bridge: Bridge,
    sessions: SessionService,
    _status: watch::Sender<GatewayStatus>,
    _shutdown: watch::Sender<bool>,
}

fn harness(settings: BridgeSettings, configured: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::open(dir.path()).unwrap();
    if configured {
        kernel
            .put_guild_config(&GuildConfig {
                guild_id: sf(GUILD),
                verification_channel_id: sf(1),
                verified_role_id: sf(ROLE),
                log_channel_id: Some(sf(LOGS)),
                method: VerificationMethod::Web,
            })
            .unwrap();
    }
    let gateway = Arc::new(MemoryGateway::new());
    gateway.add_guild(sf(GUILD), "Guild");
    gateway.add_role(sf(GUILD), sf(ROLE), "Verified");
    gateway.add_member(sf(GUILD), sf(ALICE), "Alice");
    gateway.add_member(sf(GUILD), sf(BOB), "Bob");

    let store = Arc::new(ResultStore::new(settings.result_ttl));
    let (queue, rx) = command_queue();
    let (status_tx, status_rx) = watch::channel(GatewayStatus {
        ready: true,
        guilds: 1,
        latency_ms: Some(1.0),
        user: Some("test".into()),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Dispatcher::new(
        rx,
        gateway.clone(),
        kernel.clone(),
        store.clone(),
        settings.command_timeout,
    );
    tokio::spawn(dispatcher.run(shutdown_rx));

    let bridge = Bridge::new(queue, store, status_rx, &settings);
    let sessions = SessionService::new(kernel.clone(), bridge.clone());
    Harness {
        _dir: dir,
        kernel,
        gateway,
        bridge,
        sessions,
        _status: status_tx,
        _shutdown: shutdown_tx,
    }
}

fn settings(transport: Transport) -> BridgeSettings {
    BridgeSettings {
        transport,
        deadline: Duration::from_secs(5),
        command_timeout: Duration::from_secs(2),
        result_ttl: Duration::from_secs(10),
        recovery_batch: 50,
    }
}

async fn wait_for_grant_result(kernel: &Kernel, session_id: &str) -> vynk_protocol::CommandResult {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let s = kernel.get_session_async(session_id).await.unwrap().unwrap();
        if let Some(res) = s.grant_result {
            return res;
        }
        assert!(Instant::now() < deadline, "grant result never recorded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn concurrent_grants_apply_once(transport: Transport) {
    let h = harness(settings(transport), true);
    let mut joins = Vec::new();
    for _ in 0..8 {
        let bridge = h.bridge.clone();
        joins.push(tokio::spawn(async move {
            bridge
                .assign_role(sf(GUILD), sf(ALICE), VerificationMethod::Web)
                .await
        }));
    }
    let mut granted = 0;
    for j in joins {
        let res = timeout(Duration::from_secs(10), j)
            .await
            .expect("join timeout")
            .unwrap()
            .expect("bridge result");
        assert!(res.is_success(), "{res:?}");
        if res.text().starts_with("Role Verified assigned successfully") {
            granted += 1;
        } else {
            assert_eq!(res.text(), "User already has Verified role");
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(h.gateway.grant_calls(), 1);
    assert_eq!(
        h.kernel
            .count_verification_logs(sf(GUILD), Some(sf(ALICE)))
            .unwrap(),
        1
    );
    assert!(h.bridge.store().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assign_via_result_store() {
    concurrent_grants_apply_once(Transport::ResultStore).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assign_via_reply() {
    concurrent_grants_apply_once(Transport::Reply).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_command_times_out_and_dispatcher_moves_on() {
    let mut s = settings(Transport::ResultStore);
    s.command_timeout = Duration::from_millis(100);
    let h = harness(s, true);
    h.gateway.set_grant_delay(Some(Duration::from_millis(500)));

    let res = h
        .bridge
        .assign_role(sf(GUILD), sf(ALICE), VerificationMethod::Web)
        .await
        .unwrap();
    assert_eq!(res.kind(), Some(FailureKind::Timeout));
    assert_eq!(res.text(), COMMAND_TIMEOUT_MESSAGE);

    h.gateway.set_grant_delay(None);
    let res = h
        .bridge
        .assign_role(sf(GUILD), sf(BOB), VerificationMethod::Web)
        .await
        .unwrap();
    assert_eq!(res.text(), "Role Verified assigned successfully to Bob");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unconfigured_guild_leaves_no_trace() {
    let h = harness(settings(Transport::ResultStore), false);
    let res = h
        .bridge
        .assign_role(sf(GUILD), sf(ALICE), VerificationMethod::Web)
        .await
        .unwrap();
    assert_eq!(res.kind(), Some(FailureKind::NotConfigured));
    assert_eq!(
        res.text(),
        "Server not configured. Please run /setup-web-verification first."
    );
    assert_eq!(h.gateway.grant_calls(), 0);
    assert_eq!(h.kernel.count_verification_logs(sf(GUILD), None).unwrap(), 0);
    assert!(h.bridge.store().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_result_is_orphaned_then_reclaimed() {
    let mut s = settings(Transport::ResultStore);
    s.deadline = Duration::from_millis(100);
    s.result_ttl = Duration::from_millis(200);
    let h = harness(s, true);
    h.gateway.set_grant_delay(Some(Duration::from_millis(300)));

    let err = h
        .bridge
        .assign_role(sf(GUILD), sf(ALICE), VerificationMethod::Web)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout));

    // the command still completes on the dispatcher
    let deadline = Instant::now() + Duration::from_secs(3);
    while h.bridge.store().is_empty() {
        assert!(Instant::now() < deadline, "late result never landed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.gateway.member_roles(sf(GUILD), sf(ALICE)), vec![sf(ROLE)]);

    let later = Instant::now() + h.bridge.store().ttl() + Duration::from_millis(1);
    assert_eq!(h.bridge.store().reclaim_expired_at(later), 1);
    assert!(h.bridge.store().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_completion_is_idempotent() {
    let h = harness(settings(Transport::ResultStore), true);
    let opened = h
        .sessions
        .open(sf(GUILD), sf(ALICE), "203.0.113.9", None)
        .await
        .unwrap();
    assert_eq!(opened.status, SessionStatus::Pending);

    let first = h
        .sessions
        .complete(&opened.session_id, sf(GUILD), sf(ALICE), None)
        .await
        .unwrap();
    assert!(first.newly_completed);
    let replay = h
        .sessions
        .complete(&opened.session_id, sf(GUILD), sf(ALICE), None)
        .await
        .unwrap();
    assert!(!replay.newly_completed);
    assert_eq!(replay.session.status, SessionStatus::Completed);
    assert_eq!(replay.session.completed_at, first.session.completed_at);

    let res = wait_for_grant_result(&h.kernel, &opened.session_id).await;
    assert!(res.is_success());
    assert_eq!(h.gateway.grant_calls(), 1);

    let err = h
        .sessions
        .complete(&opened.session_id, sf(GUILD), sf(BOB), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
    let err = h
        .sessions
        .complete("no-such-session", sf(GUILD), sf(ALICE), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::SessionNotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovery_regrants_without_doubling() {
    let h = harness(settings(Transport::ResultStore), true);
    // simulate a crash between completion and enqueue
    let s = h
        .kernel
        .create_session(sf(ALICE), sf(GUILD), "198.51.100.4", None)
        .unwrap();
    assert!(h
        .kernel
        .update_session(&s.session_id, SessionStatus::Completed, None)
        .unwrap());

    assert_eq!(h.sessions.recover(10).await.unwrap(), 1);
    // a second pass before the first result lands enqueues a duplicate command
    let _ = h.sessions.recover(10).await.unwrap();

    let res = wait_for_grant_result(&h.kernel, &s.session_id).await;
    assert!(res.is_success());
    // give any duplicate command time to run
    let recheck = h
        .bridge
        .assign_role(sf(GUILD), sf(ALICE), VerificationMethod::Web)
        .await
        .unwrap();
    assert_eq!(recheck.text(), "User already has Verified role");
    assert_eq!(h.gateway.grant_calls(), 1);
    assert_eq!(
        h.kernel
            .count_verification_logs(sf(GUILD), Some(sf(ALICE)))
            .unwrap(),
        1
    );
    assert_eq!(h.sessions.recover(10).await.unwrap(), 0);
}
