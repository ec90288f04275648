//! A per-mount authenticator: a FIFO of pending admission work and the
//! lazily-spawned worker pool that drains it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use wavecast_config::AuthBlock;

use crate::auth::backend::{AuthBackend, ThreadData};
use crate::auth::htpasswd::HtpasswdAuth;
use crate::auth::pipeline;
use crate::auth::radio::RadioAuth;
use crate::auth::url::UrlAuth;
use crate::auth::command::CommandAuth;
use crate::client::Client;
use crate::core::Core;
use crate::error::{CoreError, Result};

/// Queue admission refused above this many pending entries.
pub const PENDING_LIMIT: usize = 300;

const DEFAULT_HANDLERS: usize = 3;
const MAX_HANDLERS: usize = 100;

/// Which lifecycle operation a queued work item performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOp {
    NewListener,
    RemoveListener,
    SourceAuth,
    /// Source went live; no client attached.
    StreamStart,
    /// Source terminated; no client attached.
    StreamEnd,
}

/// One work item on an authenticator's queue.
#[derive(Debug)]
pub struct AuthRequest {
    pub mount: String,
    pub hostname: String,
    pub port: u16,
    pub client: Option<Client>,
    pub op: AuthOp,
    /// Worker slot id attached at dequeue.
    pub handler: u64,
}

impl AuthRequest {
    pub fn new(core: &Core, mount: &str, client: Option<Client>, op: AuthOp) -> AuthRequest {
        let config = core.config();
        AuthRequest {
            mount: mount.to_string(),
            hostname: config.hostname.clone(),
            port: config.port,
            client,
            op,
            handler: 0,
        }
    }
}

struct HandlerSlot {
    id: u64,
    running: bool,
    data: Option<ThreadData>,
}

struct AuthQueue {
    pending: VecDeque<AuthRequest>,
    slots: Vec<HandlerSlot>,
}

/// Reference-counted per-mount authenticator. The mount configuration holds
/// one strong reference; every running worker holds another for the length
/// of its loop. Teardown runs when the last reference drops.
pub struct Authenticator {
    /// Mount this authenticator was configured on, for logging.
    pub mount: String,
    pub realm: Option<String>,
    pub rejected_mount: Option<String>,
    pub allow_duplicate_users: bool,
    pub drop_existing_listener: bool,
    pub handlers: usize,
    backend: Box<dyn AuthBackend>,
    queue: Mutex<AuthQueue>,
    running: AtomicBool,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("mount", &self.mount)
            .field("kind", &self.backend.kind())
            .field("handlers", &self.handlers)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Resolve an auth block into a running authenticator. An unrecognised
    /// type fails this mount only.
    pub fn from_block(core: &Arc<Core>, mount: &str, block: &AuthBlock) -> Result<Arc<Authenticator>> {
        debug!("type is {}", block.kind);
        let backend: Box<dyn AuthBackend> = match block.kind.as_str() {
            "htpasswd" => Box::new(HtpasswdAuth::from_block(block)?),
            "url" => Box::new(UrlAuth::from_block(block)?),
            "command" => Box::new(CommandAuth::from_block(block)?),
            "radio" => Box::new(RadioAuth::from_block(block)?),
            other => return Err(CoreError::UnknownAuthType(other.to_string())),
        };
        Ok(Authenticator::with_backend(core, mount, backend, block))
    }

    /// Build an authenticator around a caller-supplied back-end; the block
    /// only contributes the common options.
    pub fn with_backend(
        core: &Arc<Core>,
        mount: &str,
        backend: Box<dyn AuthBackend>,
        block: &AuthBlock,
    ) -> Arc<Authenticator> {
        let handlers = match block.option("handlers") {
            Some(v) => v
                .parse::<usize>()
                .unwrap_or(DEFAULT_HANDLERS)
                .clamp(1, MAX_HANDLERS),
            None => DEFAULT_HANDLERS,
        };
        let slots = (0..handlers)
            .map(|_| HandlerSlot {
                id: core.next_handler_id(),
                running: false,
                data: backend.alloc_thread_data(),
            })
            .collect();

        Arc::new(Authenticator {
            mount: mount.to_string(),
            realm: block.option("realm").map(str::to_string),
            rejected_mount: block.option("rejected_mount").map(str::to_string),
            allow_duplicate_users: block
                .option("allow_duplicate_users")
                .is_none_or(|v| v != "0"),
            drop_existing_listener: block
                .option("drop_existing_listener")
                .is_some_and(|v| v != "0"),
            handlers,
            backend,
            queue: Mutex::new(AuthQueue {
                pending: VecDeque::new(),
                slots,
            }),
            running: AtomicBool::new(true),
        })
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().pending.len()
    }

    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub(crate) fn backend(&self) -> &dyn AuthBackend {
        self.backend.as_ref()
    }

    pub fn can_authenticate(&self) -> bool {
        self.backend.can_authenticate()
    }

    pub fn has_release_listener(&self) -> bool {
        self.backend.has_release_listener()
    }

    pub fn has_stream_auth(&self) -> bool {
        self.backend.has_stream_auth()
    }

    pub fn has_stream_start(&self) -> bool {
        self.backend.has_stream_start()
    }

    pub fn has_stream_end(&self) -> bool {
        self.backend.has_stream_end()
    }

    /// Append a work item and make sure a worker is on it. Refused once the
    /// process-wide shutdown has begun; the item is handed back.
    pub fn enqueue(
        self: &Arc<Self>,
        core: &Arc<Core>,
        request: AuthRequest,
    ) -> std::result::Result<(), AuthRequest> {
        if !core.allow_auth() || !self.running() {
            return Err(request);
        }
        let mut queue = self.queue.lock();
        queue.pending.push_back(request);
        if let Some(idx) = queue.slots.iter().position(|s| !s.running) {
            let slot = &mut queue.slots[idx];
            debug!("starting auth thread {}", slot.id);
            slot.running = true;
            let data = slot.data.take();
            let id = slot.id;
            tokio::spawn(run_worker(core.clone(), self.clone(), idx, id, data));
        } else {
            debug!("max authentication handlers allocated");
        }
        debug!(
            "auth on {} has {} pending",
            self.mount,
            queue.pending.len()
        );
        Ok(())
    }
}

impl Drop for Authenticator {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let mut queue = self.queue.lock();
        while let Some(slot) = queue.slots.pop() {
            if let Some(data) = slot.data {
                self.backend.release_thread_data(data);
            }
        }
        drop(queue);
        self.backend.release();
        debug!("authenticator for {} released", self.mount);
    }
}

/// Worker loop: drain the queue, then vacate the slot and exit. The global
/// gate read-lock is held for the worker's whole life so shutdown can wait
/// for every worker to leave.
async fn run_worker(
    core: Arc<Core>,
    auth: Arc<Authenticator>,
    slot: usize,
    id: u64,
    mut data: Option<ThreadData>,
) {
    debug!("authentication thread {id} started for {}", auth.mount);
    let _gate = core.auth_gate.read().await;
    loop {
        let mut request = {
            let mut queue = auth.queue.lock();
            match queue.pending.pop_front() {
                Some(request) => {
                    debug!(
                        "{} client(s) pending on {}",
                        queue.pending.len() + 1,
                        auth.mount
                    );
                    request
                }
                None => {
                    let open = &mut queue.slots[slot];
                    open.running = false;
                    open.data = data.take();
                    break;
                }
            }
        };
        request.handler = id;
        process_request(&core, &auth, &mut request, data.as_mut()).await;
        dispose_request(&auth, request);
    }
    debug!("authentication thread {id} shutting down");
}

async fn process_request(
    core: &Arc<Core>,
    auth: &Arc<Authenticator>,
    request: &mut AuthRequest,
    data: Option<&mut ThreadData>,
) {
    match request.op {
        AuthOp::NewListener => pipeline::new_listener_callback(core, auth, request, data).await,
        AuthOp::RemoveListener => {
            auth.backend.release_listener(request, data).await;
            if let Some(client) = request.client.take() {
                client.send_404("").await;
            }
        }
        AuthOp::SourceAuth => pipeline::stream_auth_callback(core, auth, request, data).await,
        AuthOp::StreamStart => auth.backend.stream_start(request, data).await,
        AuthOp::StreamEnd => auth.backend.stream_end(request, data).await,
    }
}

/// Work-item disposal: a client the callback left behind was not admitted
/// anywhere, so it gets the realm challenge. Sent even when a 400 was
/// recorded on the way here.
fn dispose_request(auth: &Arc<Authenticator>, mut request: AuthRequest) {
    if let Some(client) = request.client.take() {
        let realm = auth.realm.clone();
        tokio::spawn(async move {
            client.send_401_forced(realm.as_deref()).await;
        });
    }
}
