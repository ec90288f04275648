//! Listener connection state.
//!
//! A [`Client`] is owned by whichever subsystem is currently driving it: the
//! auth queue while admission is pending, then a file-serving session or the
//! live-source subsystem. The shared [`ClientControl`] handle is what stays
//! reachable from the outside (admin kill, duplicate-login checks) once the
//! client itself has moved into a serving task.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::Poll;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::http::{self, Request};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const AUTHENTICATED     = 1 << 0;
        const ACTIVE            = 1 << 1;
        const IS_SLAVE          = 1 << 2;
        const HAS_MOVED         = 1 << 3;
        const IN_FSERVE         = 1 << 4;
        const SKIP_ACCESSLOG    = 1 << 5;
        const IP_BAN_LIFT       = 1 << 6;
        const HAS_INTRO_CONTENT = 1 << 7;
        const WANTS_FLV         = 1 << 8;
        const NO_CONTENT_LENGTH = 1 << 9;
    }
}

/// Serving state a listener occupies once admitted; selects the send routine
/// run on each wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    PreFile,
    File,
    ThrottledFile,
    /// One-shot wait state used while a release is queued on an auth worker;
    /// the session ends on its next wake.
    AwaitAuth,
}

/// Socket the core serves; boxed so tests can substitute an in-memory pipe.
pub trait Connection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Connection for T {}

/// Shared, externally-reachable slice of a client: the bits admin commands
/// and policy checks need after the client has moved into a serving task.
#[derive(Debug)]
pub struct ClientControl {
    pub id: u64,
    pub ip: Option<String>,
    /// Unix seconds of connection establishment.
    pub con_time: u64,
    error: AtomicBool,
    /// Unix seconds after which the listener is cut; 0 = never.
    discon_time: AtomicU64,
    username: Mutex<Option<String>>,
    /// SO_SNDBUF hint from mount policy, for connection layers that can
    /// apply socket options.
    so_sndbuf: AtomicU64,
}

impl ClientControl {
    pub fn new(id: u64, ip: Option<String>) -> ClientControl {
        ClientControl {
            id,
            ip,
            con_time: unix_now(),
            error: AtomicBool::new(false),
            discon_time: AtomicU64::new(0),
            username: Mutex::new(None),
            so_sndbuf: AtomicU64::new(0),
        }
    }

    pub fn so_sndbuf(&self) -> Option<u32> {
        match self.so_sndbuf.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n as u32),
        }
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::Relaxed);
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    pub fn set_discon_time(&self, at: u64) {
        self.discon_time.store(at, Ordering::Relaxed);
    }

    pub fn discon_reached(&self, now: u64) -> bool {
        let at = self.discon_time.load(Ordering::Relaxed);
        at != 0 && now >= at
    }

    pub fn set_username(&self, username: Option<String>) {
        *self.username.lock() = username;
    }

    pub fn username(&self) -> Option<String> {
        self.username.lock().clone()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Outcome of a single non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Wrote(usize),
    /// Socket not writable right now; caller backs off and retries.
    Blocked,
    Closed,
}

pub struct Client {
    conn: Box<dyn Connection>,
    pub request: Request,
    pub control: Arc<ClientControl>,
    pub flags: ClientFlags,
    /// Response code already committed to the wire; 0 while none sent.
    pub respcode: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Mount this client is attached to, aliasing the owning handle's mount.
    pub mount: Option<String>,
    /// Outbound buffer chain; head is being drained at `pos`.
    pub queue: VecDeque<Vec<u8>>,
    pub pos: usize,
    /// Byte offset into the served file for the next read.
    pub intro_offset: u64,
    /// Bytes sent since `timer_start`, for throttle accounting.
    pub counter: u64,
    /// Unix seconds when throttle accounting began.
    pub timer_start: u64,
    pub sent_bytes: u64,
    /// Next wake time for the serving loop.
    pub schedule: Instant,
    pub state: ClientState,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.control.id)
            .field("state", &self.state)
            .field("respcode", &self.respcode)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(conn: Box<dyn Connection>, request: Request, control: Arc<ClientControl>) -> Client {
        let mut client = Client {
            conn,
            request,
            control,
            flags: ClientFlags::empty(),
            respcode: 0,
            username: None,
            password: None,
            mount: None,
            queue: VecDeque::new(),
            pos: 0,
            intro_offset: 0,
            counter: 0,
            timer_start: 0,
            sent_bytes: 0,
            schedule: Instant::now(),
            state: ClientState::PreFile,
        };
        client.check_http_auth();
        client
    }

    /// Capture credentials from an `Authorization: Basic` header, if sent.
    fn check_http_auth(&mut self) {
        let Some(header) = self.request.header("authorization") else {
            return;
        };
        match http::basic_auth(header) {
            Some((user, pass)) => {
                self.control.set_username(Some(user.clone()));
                self.username = Some(user);
                self.password = Some(pass);
            }
            None => debug!("unhandled authorization header"),
        }
    }

    pub fn is_error(&self) -> bool {
        self.control.is_error()
    }

    /// Record the mount's send-buffer override where the connection layer
    /// can pick it up.
    pub fn apply_so_sndbuf(&mut self, bytes: u32) {
        debug!("requesting SO_SNDBUF of {bytes}");
        self.control.so_sndbuf.store(bytes as u64, Ordering::Relaxed);
    }

    /// Whether the peer is still there, checked before spending a slow
    /// back-end call on a listener that already hung up.
    pub async fn connection_alive(&mut self) -> bool {
        let mut byte = [0u8; 1];
        let conn = &mut self.conn;
        std::future::poll_fn(|cx| {
            let mut buf = tokio::io::ReadBuf::new(&mut byte);
            match Pin::new(&mut **conn).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => Poll::Ready(!buf.filled().is_empty()),
                Poll::Ready(Err(_)) => Poll::Ready(false),
                Poll::Pending => Poll::Ready(true),
            }
        })
        .await
    }

    /// Queue response bytes behind whatever is already pending.
    pub fn queue_buffer(&mut self, data: Vec<u8>) {
        if self.queue.is_empty() {
            self.pos = 0;
        }
        self.queue.push_back(data);
    }

    /// Drop all pending output, eg before handing the client elsewhere.
    pub fn drain_queue(&mut self) {
        self.queue.clear();
        self.pos = 0;
    }

    /// One non-blocking write attempt against the socket, mirroring a
    /// `send()` on a non-blocking fd: `Blocked` maps to EAGAIN.
    pub async fn try_write(&mut self, data: &[u8]) -> WriteOutcome {
        let outcome = poll_write_once(&mut self.conn, data).await;
        if let WriteOutcome::Wrote(n) = outcome {
            self.sent_bytes += n as u64;
        }
        outcome
    }

    /// Write the head of the buffer queue from the current position,
    /// advancing through the chain as buffers complete.
    pub async fn write_queued(&mut self) -> WriteOutcome {
        loop {
            let Some(head) = self.queue.front() else {
                return WriteOutcome::Wrote(0);
            };
            if self.pos >= head.len() {
                self.queue.pop_front();
                self.pos = 0;
                continue;
            }
            let outcome = poll_write_once(&mut self.conn, &head[self.pos..]).await;
            if let WriteOutcome::Wrote(n) = outcome {
                self.sent_bytes += n as u64;
                self.pos += n;
                if self.pos >= head.len() {
                    self.queue.pop_front();
                    self.pos = 0;
                }
            }
            return outcome;
        }
    }

    /// Best-effort flush for terminal responses; the client is gone
    /// afterwards either way. When a response has already started, only the
    /// error flag is set and the connection closed.
    async fn finish_with(mut self, response: Vec<u8>, code: u16, force: bool) {
        if self.respcode != 0 {
            self.control.set_error();
            if !force {
                let _ = self.conn.shutdown().await;
                return;
            }
        }
        self.respcode = code;
        let _ = self.conn.write_all(&response).await;
        let _ = self.conn.shutdown().await;
    }

    pub async fn send_400(self, message: &str) {
        self.finish_with(http::response_400(message), 400, false).await;
    }

    pub async fn send_401(self, realm: Option<&str>) {
        self.finish_with(http::response_401(realm), 401, false).await;
    }

    /// The auth work-item disposal path challenges unconditionally, even on
    /// a client that already carries a response code.
    pub async fn send_401_forced(self, realm: Option<&str>) {
        self.finish_with(http::response_401(realm), 401, true).await;
    }

    pub async fn send_302(self, location: &str) {
        self.finish_with(http::response_302(location), 302, false).await;
    }

    pub async fn send_403(self, message: &str) {
        self.finish_with(http::response_403(message, None), 403, false).await;
    }

    pub async fn send_403_redirect(self, redirect: &str, message: &str) {
        self.finish_with(http::response_403(message, Some(redirect)), 403, false)
            .await;
    }

    pub async fn send_404(self, message: &str) {
        self.finish_with(http::response_404(message), 404, false).await;
    }
}

/// Single `poll_write` against the connection; `Pending` is surfaced as
/// [`WriteOutcome::Blocked`] rather than suspending, so send routines can
/// back off on their own schedule.
async fn poll_write_once(conn: &mut Box<dyn Connection>, data: &[u8]) -> WriteOutcome {
    std::future::poll_fn(|cx| match Pin::new(&mut **conn).poll_write(cx, data) {
        Poll::Ready(Ok(0)) => Poll::Ready(WriteOutcome::Closed),
        Poll::Ready(Ok(n)) => Poll::Ready(WriteOutcome::Wrote(n)),
        Poll::Ready(Err(_)) => Poll::Ready(WriteOutcome::Closed),
        Poll::Pending => Poll::Ready(WriteOutcome::Blocked),
    })
    .await
}
