//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, DuplexStream};

use wavecast_config::{AuthBlock, AuthOption, MountConfig, ServerConfig};
use wavecast_core::admin::NullAdmin;
use wavecast_core::client::{Client, ClientControl};
use wavecast_core::fserve::format::FormatType;
use wavecast_core::http::Request;
use wavecast_core::source::{SourceAddOutcome, SourceEntry, SourceTree};
use wavecast_core::stats::TracingStats;
use wavecast_core::Core;

/// A listener the fake source subsystem admitted.
#[derive(Debug, Clone)]
pub struct AcceptedListener {
    pub mount: String,
    pub username: Option<String>,
    pub authenticated: bool,
}

/// Source tree double: a fixed set of live mounts, recording every
/// admission and direct attach.
#[derive(Debug, Default)]
pub struct FakeSourceTree {
    live: Mutex<HashMap<String, FormatType>>,
    pub accepted: Mutex<Vec<AcceptedListener>>,
    pub setups: Mutex<Vec<String>>,
}

impl FakeSourceTree {
    pub fn new() -> Arc<FakeSourceTree> {
        Arc::new(FakeSourceTree::default())
    }

    pub fn add_live(&self, mount: &str, format: FormatType) {
        self.live.lock().insert(mount.to_string(), format);
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().len()
    }
}

impl SourceTree for FakeSourceTree {
    fn find_mount(&self, mount: &str) -> Option<SourceEntry> {
        self.live.lock().get(mount).map(|format| SourceEntry {
            available: true,
            format: *format,
        })
    }

    fn setup_listener(&self, mount: &str, client: Client) -> Result<(), Client> {
        if self.live.lock().contains_key(mount) {
            self.setups.lock().push(mount.to_string());
            drop(client);
            Ok(())
        } else {
            Err(client)
        }
    }

    fn add_listener(
        &self,
        mount: &str,
        _mountinfo: Option<&MountConfig>,
        client: Client,
    ) -> SourceAddOutcome {
        if self.live.lock().contains_key(mount) {
            self.accepted.lock().push(AcceptedListener {
                mount: mount.to_string(),
                username: client.username.clone(),
                authenticated: client
                    .flags
                    .contains(wavecast_core::ClientFlags::AUTHENTICATED),
            });
            drop(client);
            SourceAddOutcome::Accepted
        } else {
            SourceAddOutcome::NoSource(client)
        }
    }

    fn startup_source(&self, mount: &str, client: Client) {
        self.setups.lock().push(mount.to_string());
        drop(client);
    }
}

pub fn build_core(config: ServerConfig, sources: Arc<FakeSourceTree>) -> Arc<Core> {
    Core::with_collaborators(config, sources, Arc::new(TracingStats), Arc::new(NullAdmin))
}

pub fn auth_block(kind: &str, options: &[(&str, &str)]) -> AuthBlock {
    AuthBlock {
        kind: kind.to_string(),
        options: options
            .iter()
            .map(|(name, value)| AuthOption {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
    }
}

/// A client over an in-memory pipe; the far end is handed back for the
/// test to read responses from.
pub fn duplex_client(core: &Core, request: Request) -> (Client, DuplexStream) {
    duplex_client_with_capacity(core, request, 64 * 1024)
}

pub fn duplex_client_with_capacity(
    core: &Core,
    request: Request,
    capacity: usize,
) -> (Client, DuplexStream) {
    let (near, far) = tokio::io::duplex(capacity);
    let control = Arc::new(ClientControl::new(core.next_client_id(), None));
    (Client::new(Box::new(near), request, control), far)
}

/// Drain the far end until EOF, bounded by a timeout.
pub async fn read_all(mut far: DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = far.read_to_end(&mut out).await;
    })
    .await;
    out
}

/// Read whatever arrives within `window`.
pub async fn read_for(far: &mut DuplexStream, window: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, far.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    out
}

/// Poll `cond` until it holds or the timeout lapses.
pub async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
