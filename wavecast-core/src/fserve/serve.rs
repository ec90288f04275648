//! Per-listener serving loop.
//!
//! Each admitted listener runs in its own task, woken at its scheduled
//! deadline to run the send routine for its current state. The routines
//! mirror the classic three-phase shape: drain the response header chain,
//! then stream the file flat out, or at a metered rate for fallbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::client::{ClientState, WriteOutcome, unix_now};
use crate::core::Core;
use crate::fserve::cache::{FileHandle, MIN_LIMIT};
use crate::fserve::format::{self, FileRead};

/// What a wake decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeAction {
    /// Sleep until `client.schedule`, then run the state routine again.
    Continue,
    /// A fallback target was published; relocate the listener.
    Move,
    /// Listener is done (error, EOF, policy); run the release path.
    Terminate,
}

/// Listener-count accounting across serving shards, with a bounded budget
/// of rebalance moves per housekeeping cycle.
#[derive(Debug)]
pub struct ShardRegistry {
    counts: Vec<AtomicUsize>,
    move_budget: AtomicU32,
}

const MOVES_PER_CYCLE: u32 = 20;

impl ShardRegistry {
    pub fn new(shards: usize) -> ShardRegistry {
        let shards = shards.max(1);
        ShardRegistry {
            counts: (0..shards).map(|_| AtomicUsize::new(0)).collect(),
            move_budget: AtomicU32::new(MOVES_PER_CYCLE),
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, shard: usize) -> usize {
        self.counts[shard].load(Ordering::Relaxed)
    }

    /// Join the least-loaded shard.
    pub fn assign(&self) -> usize {
        let shard = self.least_loaded();
        self.counts[shard].fetch_add(1, Ordering::Relaxed);
        shard
    }

    pub fn leave(&self, shard: usize) {
        self.counts[shard].fetch_sub(1, Ordering::Relaxed);
    }

    fn least_loaded(&self) -> usize {
        self.counts
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Move off `shard` if it runs at least 16 listeners ahead of the
    /// least-loaded one and the cycle's move budget allows.
    pub fn try_rebalance(&self, shard: usize) -> Option<usize> {
        if self.counts.len() < 2 {
            return None;
        }
        if self.move_budget.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let target = self.least_loaded();
        let here = self.counts[shard].load(Ordering::Relaxed) as i64;
        let there = self.counts[target].load(Ordering::Relaxed) as i64;
        if here - there > 15 {
            self.move_budget.fetch_sub(1, Ordering::Relaxed);
            self.counts[shard].fetch_sub(1, Ordering::Relaxed);
            self.counts[target].fetch_add(1, Ordering::Relaxed);
            debug!("moving listener from shard {shard} to {target}");
            return Some(target);
        }
        None
    }

    /// Housekeeping: restore the per-cycle move budget.
    pub fn replenish(&self) {
        self.move_budget.store(MOVES_PER_CYCLE, Ordering::Relaxed);
    }
}

/// A listener being served from a file handle (or a synthesized body).
#[derive(Debug)]
pub struct Session {
    pub client: crate::client::Client,
    pub fh: Option<Arc<FileHandle>>,
    pub shard: usize,
}

impl Session {
    /// Run the send routine for the current state once.
    pub async fn process(&mut self, core: &Core) -> ServeAction {
        match self.client.state {
            ClientState::PreFile => self.prefile_send(core).await,
            ClientState::File => self.file_send(core).await,
            ClientState::ThrottledFile => self.throttled_send(core).await,
            ClientState::AwaitAuth => {
                debug!("client finished with auth");
                ServeAction::Terminate
            }
        }
    }

    /// Drain the buffered response chain, then pick the body state.
    async fn prefile_send(&mut self, core: &Core) -> ServeAction {
        let mut written = 0usize;
        for _ in 0..8 {
            if !core.fserve_running() || self.client.is_error() {
                return ServeAction::Terminate;
            }
            if self.client.queue.is_empty() {
                if let Some(fh) = &self.fh {
                    if fh.fallback().is_some() {
                        return ServeAction::Move;
                    }
                    if fh.file().is_some() {
                        self.client.state = if fh.limit > 0 {
                            ClientState::ThrottledFile
                        } else {
                            ClientState::File
                        };
                        self.client.schedule = Instant::now();
                        return ServeAction::Continue;
                    }
                }
                if self.client.respcode != 0 {
                    // synthesized body fully sent
                    return ServeAction::Terminate;
                }
                return self.not_found(core).await;
            }
            match self.client.write_queued().await {
                WriteOutcome::Wrote(n) => {
                    written += n;
                    core.add_global_sample(n as u64);
                    if written > 30_000 {
                        break;
                    }
                }
                WriteOutcome::Blocked => {
                    let backoff = if written > 0 { 150 } else { 300 };
                    self.client.schedule = Instant::now() + Duration::from_millis(backoff);
                    return ServeAction::Continue;
                }
                WriteOutcome::Closed => return ServeAction::Terminate,
            }
        }
        self.client.schedule = Instant::now();
        ServeAction::Continue
    }

    async fn not_found(&mut self, core: &Core) -> ServeAction {
        if let Some(fh) = self.fh.take() {
            core.fh_cache
                .release(core.stats.as_ref(), &fh, self.client.control.id);
        }
        self.client.respcode = 404;
        let body = crate::http::response_404("The file you requested could not be found");
        self.client.queue_buffer(body);
        while !self.client.queue.is_empty() {
            if !matches!(self.client.write_queued().await, WriteOutcome::Wrote(_)) {
                break;
            }
        }
        ServeAction::Terminate
    }

    /// Unthrottled body send: up to six read/write rounds per wake.
    async fn file_send(&mut self, core: &Core) -> ServeAction {
        let now = unix_now();
        let mut schedule = Instant::now();
        let mut loops = 6;
        // slow everyone down when the server-wide ceiling is exceeded, but
        // let short-lived connections finish unimpeded
        if core.throttle_sends() > 1 && now.saturating_sub(self.client.control.con_time) > 1 {
            schedule += Duration::from_millis(300);
            loops = 1;
        }
        let mut written = 0usize;
        while loops > 0 && written < 30_000 {
            loops -= 1;
            if !core.fserve_running() || self.client.is_error() {
                return ServeAction::Terminate;
            }
            if self.client.control.discon_reached(now) {
                return ServeAction::Terminate;
            }
            if self.client.queue.is_empty() {
                let Some(fh) = &self.fh else {
                    return ServeAction::Terminate;
                };
                let Some(file) = fh.file() else {
                    return ServeAction::Terminate;
                };
                let mut buf = vec![0u8; 8192];
                match format::read_at(file, &mut buf, self.client.intro_offset) {
                    Ok(0) | Err(_) => return ServeAction::Terminate,
                    Ok(n) => {
                        buf.truncate(n);
                        self.client.intro_offset += n as u64;
                        self.client.queue_buffer(buf);
                    }
                }
            }
            match self.client.write_queued().await {
                WriteOutcome::Wrote(n) => {
                    written += n;
                    core.add_global_sample(n as u64);
                    schedule += Duration::from_millis(3);
                }
                WriteOutcome::Blocked => {
                    let backoff = if written > 0 { 120 } else { 250 };
                    schedule += Duration::from_millis(backoff);
                    break;
                }
                WriteOutcome::Closed => return ServeAction::Terminate,
            }
        }
        self.client.schedule = schedule;
        ServeAction::Continue
    }

    /// Metered send for fallback streams.
    async fn throttled_send(&mut self, core: &Core) -> ServeAction {
        if !core.fserve_running() || self.client.is_error() {
            return ServeAction::Terminate;
        }
        let Some(fh) = self.fh.clone() else {
            return ServeAction::Terminate;
        };
        let now = unix_now();
        let now_ms = core.now_ms();
        let secs = now.saturating_sub(self.client.timer_start);
        let mut schedule = Instant::now();
        if self.client.control.discon_reached(now) {
            return ServeAction::Terminate;
        }
        if fh.fallback().is_some() {
            return ServeAction::Move;
        }
        if let Some(target) = core.shards.try_rebalance(self.shard) {
            self.shard = target;
            self.client.schedule = Instant::now();
            return ServeAction::Continue;
        }

        let mut limit = fh.limit.max(1) as u64;
        if self
            .client
            .flags
            .contains(crate::client::ClientFlags::WANTS_FLV)
        {
            // flv wrapping inflates the payload slightly
            limit = limit * 101 / 100;
        }
        let rate = if secs > 0 {
            (self.client.counter + 1400) / secs
        } else {
            0
        };
        if rate > limit || secs < 3 {
            let pause = if limit >= MIN_LIMIT as u64 {
                1000 / (limit / 1400)
            } else {
                50
            };
            schedule += Duration::from_millis(pause.max(1));
            fh.add_rate_sample(0, now_ms);
            if secs > 2 {
                core.add_global_sample(0);
                self.client.schedule = schedule;
                return ServeAction::Continue;
            }
        }
        if fh.stats_due(now)
            && let Some(scope) = fh.stats_scope()
        {
            let kbps = fh.out_kbitrate(now_ms);
            core.stats
                .set(Some(&scope), "outgoing_kbitrate", &kbps.to_string());
        }
        if self.client.queue.is_empty() {
            let block = match (fh.format.as_ref(), fh.file()) {
                (Some(format), Some(file)) => format.file_read(file, self.client.intro_offset),
                _ => FileRead::Fatal,
            };
            match block {
                FileRead::Loop => {
                    self.client.intro_offset = 0;
                    self.client.schedule = schedule + Duration::from_millis(150);
                    return ServeAction::Continue;
                }
                FileRead::Fatal => return ServeAction::Terminate,
                FileRead::Block(data) => {
                    self.client.intro_offset += data.len() as u64;
                    self.client.queue_buffer(data);
                }
            }
        }
        let bytes = match self.client.write_queued().await {
            WriteOutcome::Wrote(n) => n,
            WriteOutcome::Blocked => 0,
            WriteOutcome::Closed => return ServeAction::Terminate,
        };
        self.client.counter += bytes as u64;
        fh.add_rate_sample(bytes as u64, now_ms);
        core.add_global_sample(bytes as u64);
        if limit > 2800 {
            schedule += Duration::from_millis(1000 / (limit / 1400 * 2));
        } else {
            schedule += Duration::from_millis(50);
        }
        if core.throttle_sends() > 1 {
            schedule += Duration::from_millis(300);
        }
        self.client.schedule = schedule;
        ServeAction::Continue
    }
}
