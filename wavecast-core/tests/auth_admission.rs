//! Admission-pipeline behaviour: queueing, back-end verdicts, rejection
//! routing, queue bounds and shutdown draining.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use tokio::sync::Notify;

use support::{auth_block, build_core, duplex_client, read_all, wait_until, FakeSourceTree};
use wavecast_config::{MountConfig, ServerConfig};
use wavecast_core::auth::backend::{AuthBackend, AuthDecision, ThreadData};
use wavecast_core::auth::{self, AddOutcome, AuthOp, AuthRequest, Authenticator};
use wavecast_core::auth::htpasswd::HtpasswdAuth;
use wavecast_core::fserve::format::FormatType;
use wavecast_core::http::{Method, Request};

fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{pass}")))
}

fn htpasswd_mount(dir: &std::path::Path, extra: &[(&str, &str)]) -> (ServerConfig, String) {
    let users = dir.join("users");
    std::fs::write(
        &users,
        format!("user:{}\n", HtpasswdAuth::digest("pass")),
    )
    .expect("write users");
    let mut options = vec![
        ("filename".to_string(), users.to_string_lossy().to_string()),
        ("realm".to_string(), "members".to_string()),
    ];
    for (name, value) in extra {
        options.push((name.to_string(), value.to_string()));
    }
    let option_refs: Vec<(&str, &str)> = options
        .iter()
        .map(|(n, v)| (n.as_str(), v.as_str()))
        .collect();
    let mut config = ServerConfig::default();
    config.mounts.insert(
        "/stream".to_string(),
        MountConfig {
            auth: Some(auth_block("htpasswd", &option_refs)),
            ..MountConfig::default()
        },
    );
    (config, users.to_string_lossy().to_string())
}

#[tokio::test]
async fn htpasswd_listener_lands_on_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, _) = htpasswd_mount(dir.path(), &[]);
    let sources = FakeSourceTree::new();
    sources.add_live("/stream", FormatType::Mp3);
    let core = build_core(config, sources.clone());

    let request =
        Request::new(Method::Get, "/stream").with_header("Authorization", &basic("user", "pass"));
    let (client, remote) = duplex_client(&core, request);
    let outcome = auth::add_listener(&core, "/stream", client).await;
    assert_eq!(outcome, AddOutcome::Queued);

    assert!(
        wait_until(|| sources.accepted_count() == 1, Duration::from_secs(5)).await,
        "worker never delivered the listener"
    );
    let accepted = sources.accepted.lock()[0].clone();
    assert_eq!(accepted.mount, "/stream");
    assert_eq!(accepted.username.as_deref(), Some("user"));
    assert!(accepted.authenticated);
    drop(remote);
}

#[tokio::test]
async fn bad_password_gets_realm_challenge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, _) = htpasswd_mount(dir.path(), &[]);
    let sources = FakeSourceTree::new();
    sources.add_live("/stream", FormatType::Mp3);
    let core = build_core(config, sources.clone());

    let request =
        Request::new(Method::Get, "/stream").with_header("Authorization", &basic("user", "wrong"));
    let (client, remote) = duplex_client(&core, request);
    assert_eq!(
        auth::add_listener(&core, "/stream", client).await,
        AddOutcome::Queued
    );
    let response = String::from_utf8_lossy(&read_all(remote).await).to_string();
    assert!(response.contains("401 Unauthorized"), "got: {response}");
    assert!(response.contains("WWW-Authenticate: Basic realm=\"members\""));
    assert_eq!(sources.accepted_count(), 0);
}

#[tokio::test]
async fn rejected_listener_is_rerouted_not_challenged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, _) = htpasswd_mount(dir.path(), &[("rejected_mount", "/denied")]);
    let sources = FakeSourceTree::new();
    sources.add_live("/stream", FormatType::Mp3);
    sources.add_live("/denied", FormatType::Mp3);
    let core = build_core(config, sources.clone());

    let request =
        Request::new(Method::Get, "/stream").with_header("Authorization", &basic("user", "wrong"));
    let (client, remote) = duplex_client(&core, request);
    assert_eq!(
        auth::add_listener(&core, "/stream", client).await,
        AddOutcome::Queued
    );
    assert!(
        wait_until(|| sources.accepted_count() == 1, Duration::from_secs(5)).await,
        "listener never rerouted"
    );
    assert_eq!(sources.accepted.lock()[0].mount, "/denied");
    let bytes = read_all(remote).await;
    assert!(
        bytes.is_empty(),
        "no response expected, got {:?}",
        String::from_utf8_lossy(&bytes)
    );
}

#[tokio::test]
async fn no_mount_refused() {
    let mut config = ServerConfig::default();
    config.mounts.insert(
        "/closed".to_string(),
        MountConfig {
            no_mount: true,
            ..MountConfig::default()
        },
    );
    let core = build_core(config, FakeSourceTree::new());
    let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/closed"));
    assert_eq!(
        auth::add_listener(&core, "/closed", client).await,
        AddOutcome::Refused(403)
    );
    let response = String::from_utf8_lossy(&read_all(remote).await).to_string();
    assert!(response.contains("403 Forbidden"));
}

#[tokio::test]
async fn redirect_mount_sends_302() {
    let mut config = ServerConfig::default();
    config.mounts.insert(
        "/old".to_string(),
        MountConfig {
            redirect: Some("http://other.example".to_string()),
            ..MountConfig::default()
        },
    );
    let core = build_core(config, FakeSourceTree::new());
    let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/old"));
    assert_eq!(
        auth::add_listener(&core, "/old", client).await,
        AddOutcome::Refused(302)
    );
    let response = String::from_utf8_lossy(&read_all(remote).await).to_string();
    assert!(response.contains("302 Found"));
    assert!(response.contains("Location: http://other.example/old"));
}

/// Back-end that parks every authenticate call until released.
#[derive(Debug)]
struct BlockingBackend {
    release: Arc<Notify>,
}

#[async_trait]
impl AuthBackend for BlockingBackend {
    fn kind(&self) -> &'static str {
        "blocking"
    }

    fn can_authenticate(&self) -> bool {
        true
    }

    async fn authenticate(
        &self,
        _req: &mut AuthRequest,
        _data: Option<&mut ThreadData>,
    ) -> AuthDecision {
        self.release.notified().await;
        AuthDecision::Denied
    }
}

#[tokio::test]
async fn queue_bound_admits_at_300_refuses_past_it() {
    let core = build_core(ServerConfig::default(), FakeSourceTree::new());
    let release = Arc::new(Notify::new());
    let auth = Authenticator::with_backend(
        &core,
        "/gate",
        Box::new(BlockingBackend {
            release: release.clone(),
        }),
        &auth_block("blocking", &[("handlers", "1")]),
    );
    core.insert_mount("/gate", MountConfig::default(), Some(auth.clone()));

    let mut remotes = Vec::new();
    // first listener occupies the only worker
    let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/gate"));
    remotes.push(remote);
    assert_eq!(
        auth::add_listener(&core, "/gate", client).await,
        AddOutcome::Queued
    );
    assert!(
        wait_until(|| auth.pending_count() == 0, Duration::from_secs(5)).await,
        "worker never picked up the first listener"
    );

    // fill the queue to the admission bound
    for _ in 0..300 {
        let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/gate"));
        remotes.push(remote);
        assert_eq!(
            auth::add_listener(&core, "/gate", client).await,
            AddOutcome::Queued
        );
    }
    assert_eq!(auth.pending_count(), 300);

    // pending == 300 still admits
    let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/gate"));
    remotes.push(remote);
    assert_eq!(
        auth::add_listener(&core, "/gate", client).await,
        AddOutcome::Queued
    );
    assert_eq!(auth.pending_count(), 301);

    // pending == 301 refuses upstream
    let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/gate"));
    assert_eq!(
        auth::add_listener(&core, "/gate", client).await,
        AddOutcome::Refused(403)
    );
    let response = String::from_utf8_lossy(&read_all(remote).await).to_string();
    assert!(response.contains("busy"), "got: {response}");
    assert!(core.slowdown() > 0);

    release.notify_waiters();
}

/// Back-end that records the order authenticate calls begin in.
#[derive(Debug)]
struct OrderingBackend {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl AuthBackend for OrderingBackend {
    fn kind(&self) -> &'static str {
        "ordering"
    }

    fn can_authenticate(&self) -> bool {
        true
    }

    async fn authenticate(
        &self,
        req: &mut AuthRequest,
        _data: Option<&mut ThreadData>,
    ) -> AuthDecision {
        if let Some(client) = &req.client
            && let Some(user) = &client.username
        {
            self.seen.lock().push(user.clone());
        }
        AuthDecision::Denied
    }
}

#[tokio::test]
async fn queue_is_fifo() {
    let core = build_core(ServerConfig::default(), FakeSourceTree::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let auth = Authenticator::with_backend(
        &core,
        "/order",
        Box::new(OrderingBackend { seen: seen.clone() }),
        &auth_block("ordering", &[("handlers", "1")]),
    );
    core.insert_mount("/order", MountConfig::default(), Some(auth.clone()));

    let mut remotes = Vec::new();
    for i in 0..10 {
        let request = Request::new(Method::Get, "/order")
            .with_header("Authorization", &basic(&format!("user{i}"), "pw"));
        let (client, remote) = duplex_client(&core, request);
        remotes.push(remote);
        assert_eq!(
            auth::add_listener(&core, "/order", client).await,
            AddOutcome::Queued
        );
    }
    assert!(
        wait_until(|| seen.lock().len() == 10, Duration::from_secs(5)).await,
        "queue never drained"
    );
    let observed = seen.lock().clone();
    let expected: Vec<String> = (0..10).map(|i| format!("user{i}")).collect();
    assert_eq!(observed, expected);
}

/// Denies everything, counting how many requests reached the back-end.
#[derive(Debug, Default)]
struct CountingBackend {
    count: AtomicUsize,
}

#[async_trait]
impl AuthBackend for CountingBackend {
    fn kind(&self) -> &'static str {
        "counting"
    }

    fn can_authenticate(&self) -> bool {
        true
    }

    async fn authenticate(
        &self,
        _req: &mut AuthRequest,
        _data: Option<&mut ThreadData>,
    ) -> AuthDecision {
        self.count.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(2)).await;
        AuthDecision::Denied
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_pending_work() {
    let core = build_core(ServerConfig::default(), FakeSourceTree::new());
    let auth = Authenticator::with_backend(
        &core,
        "/drain",
        Box::new(CountingBackend::default()),
        &auth_block("counting", &[("handlers", "2")]),
    );
    core.insert_mount("/drain", MountConfig::default(), Some(auth.clone()));

    let mut remotes = Vec::new();
    for _ in 0..50 {
        let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/drain"));
        remotes.push(remote);
        assert_eq!(
            auth::add_listener(&core, "/drain", client).await,
            AddOutcome::Queued
        );
    }

    core.shutdown().await;

    // every item was processed or dropped, and the queue is empty
    assert_eq!(auth.pending_count(), 0);

    // every listener got a terminal response
    for remote in remotes {
        let response = String::from_utf8_lossy(&read_all(remote).await).to_string();
        assert!(response.contains("401"), "got: {response}");
    }

    // new work is refused after shutdown
    let request = AuthRequest::new(&core, "/drain", None, AuthOp::StreamStart);
    assert!(auth.enqueue(&core, request).is_err());
    let (client, remote) = duplex_client(&core, Request::new(Method::Get, "/drain"));
    assert_eq!(
        auth::add_listener(&core, "/drain", client).await,
        AddOutcome::Refused(403)
    );
    drop(remote);
}
