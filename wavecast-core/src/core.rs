//! Process-wide state, gathered into one context object that every public
//! entry point receives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use wavecast_config::{MountConfig, ServerConfig};

use crate::admin::{AdminHooks, NullAdmin};
use crate::auth::instance::Authenticator;
use crate::client::unix_now;
use crate::fserve::cache::FhCache;
use crate::fserve::serve::ShardRegistry;
use crate::mime::MimeTypes;
use crate::rate::RateEstimator;
use crate::source::{NullSourceTree, SourceTree};
use crate::stats::{StatsSink, TracingStats};

/// A configured mountpoint with its resolved authenticator.
#[derive(Debug)]
pub struct Mount {
    pub name: String,
    pub config: MountConfig,
    pub auth: Option<Arc<Authenticator>>,
}

/// IP bans registered through mount policy (`ban_client`).
#[derive(Debug, Default)]
pub struct BanList {
    entries: Mutex<HashMap<String, u64>>,
}

impl BanList {
    /// Positive `seconds` bans, negative lifts an existing ban.
    pub fn add(&self, ip: &str, seconds: i64) {
        let mut entries = self.entries.lock();
        if seconds < 0 {
            entries.remove(ip);
        } else {
            entries.insert(ip.to_string(), unix_now() + seconds as u64);
        }
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(ip) {
            Some(&until) if until > unix_now() => true,
            Some(_) => {
                entries.remove(ip);
                false
            }
            None => false,
        }
    }
}

pub struct Core {
    config: RwLock<ServerConfig>,
    mounts: RwLock<HashMap<String, Arc<Mount>>>,
    pub mime: MimeTypes,
    pub fh_cache: FhCache,
    pub sources: Arc<dyn SourceTree>,
    pub admin: Arc<dyn AdminHooks>,
    pub stats: Arc<dyn StatsSink>,
    pub bans: BanList,
    pub shards: ShardRegistry,

    allow_auth: AtomicBool,
    fserve_running: AtomicBool,
    /// Held read by every auth worker; the shutdown writer blocks until the
    /// last worker has left its loop.
    pub auth_gate: tokio::sync::RwLock<()>,
    /// Accept-path backpressure, bumped when auth queues overflow.
    slowdown: AtomicU32,
    /// >1 means the server-wide bandwidth ceiling is being exceeded.
    throttle_sends: AtomicU32,
    global_rate: Mutex<RateEstimator>,

    epoch: Instant,
    next_client_id: AtomicU64,
    next_handler_id: AtomicU64,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("mounts", &self.mounts.read().len())
            .finish_non_exhaustive()
    }
}

impl Core {
    pub fn new(config: ServerConfig) -> Arc<Core> {
        Core::with_collaborators(
            config,
            Arc::new(NullSourceTree),
            Arc::new(TracingStats),
            Arc::new(NullAdmin),
        )
    }

    pub fn with_collaborators(
        config: ServerConfig,
        sources: Arc<dyn SourceTree>,
        stats: Arc<dyn StatsSink>,
        admin: Arc<dyn AdminHooks>,
    ) -> Arc<Core> {
        let core = Arc::new(Core {
            config: RwLock::new(ServerConfig::default()),
            mounts: RwLock::new(HashMap::new()),
            mime: MimeTypes::new(),
            fh_cache: FhCache::new(),
            sources,
            admin,
            stats,
            bans: BanList::default(),
            shards: ShardRegistry::new(std::thread::available_parallelism().map_or(1, |n| n.get())),
            allow_auth: AtomicBool::new(true),
            fserve_running: AtomicBool::new(true),
            auth_gate: tokio::sync::RwLock::new(()),
            slowdown: AtomicU32::new(0),
            throttle_sends: AtomicU32::new(0),
            global_rate: Mutex::new(RateEstimator::new()),
            epoch: Instant::now(),
            next_client_id: AtomicU64::new(1),
            next_handler_id: AtomicU64::new(0),
        });
        core.apply_config(config);
        core.stats.set(None, "file_connections", "0");
        info!("file serving started");
        core
    }

    /// Swap in a configuration, resolving each mount's authenticator. A
    /// mount whose auth block fails to build is dropped; the rest stand.
    pub fn apply_config(self: &Arc<Self>, config: ServerConfig) {
        let mut mounts = HashMap::new();
        for (name, mc) in &config.mounts {
            let auth = match &mc.auth {
                Some(block) => match Authenticator::from_block(self, name, block) {
                    Ok(auth) => Some(auth),
                    Err(err) => {
                        error!("mount {name} disabled: {err}");
                        continue;
                    }
                },
                None => None,
            };
            mounts.insert(
                name.clone(),
                Arc::new(Mount {
                    name: name.clone(),
                    config: mc.clone(),
                    auth,
                }),
            );
        }
        if let Some(path) = &config.mimetypes_file {
            self.mime.reload(path);
        }
        *self.mounts.write() = mounts;
        *self.config.write() = config;
    }

    pub fn find_mount(&self, mount: &str) -> Option<Arc<Mount>> {
        self.mounts.read().get(mount).cloned()
    }

    /// Install or replace a single mount, eg one built around a custom
    /// authenticator back-end.
    pub fn insert_mount(&self, name: &str, config: MountConfig, auth: Option<Arc<Authenticator>>) {
        self.mounts.write().insert(
            name.to_string(),
            Arc::new(Mount {
                name: name.to_string(),
                config,
                auth,
            }),
        );
    }

    pub fn config(&self) -> parking_lot::RwLockReadGuard<'_, ServerConfig> {
        self.config.read()
    }

    /// Milliseconds since core startup, the serving engine's clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_handler_id(&self) -> u64 {
        self.next_handler_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allow_auth(&self) -> bool {
        self.allow_auth.load(Ordering::Acquire)
    }

    pub fn fserve_running(&self) -> bool {
        self.fserve_running.load(Ordering::Acquire)
    }

    pub fn slowdown(&self) -> u32 {
        self.slowdown.load(Ordering::Relaxed)
    }

    /// Bumped when clients pile up behind auth; capped at 10.
    pub fn bump_slowdown(&self) {
        let _ = self
            .slowdown
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v < 10).then_some(v + 1)
            });
    }

    pub fn decay_slowdown(&self) {
        let _ = self
            .slowdown
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v > 0).then_some(v - 1)
            });
    }

    pub fn throttle_sends(&self) -> u32 {
        self.throttle_sends.load(Ordering::Relaxed)
    }

    pub fn add_global_sample(&self, bytes: u64) {
        let now = self.now_ms();
        self.global_rate.lock().add(bytes, now);
    }

    pub fn reduce_global_sampling(&self) {
        let now = self.now_ms();
        self.global_rate.lock().reduce_sampling(now);
    }

    /// Housekeeping tick: compare outgoing bandwidth against the configured
    /// ceiling and step the global throttle accordingly.
    pub fn update_throttle(&self) {
        let limit_kbps = self.config.read().max_bandwidth_kbps;
        if limit_kbps == 0 {
            self.throttle_sends.store(0, Ordering::Relaxed);
            return;
        }
        let now = self.now_ms();
        let kbps = self.global_rate.lock().kbitrate(now);
        if kbps > limit_kbps {
            let level = self.throttle_sends.load(Ordering::Relaxed);
            if level < 3 {
                self.throttle_sends.store(level + 1, Ordering::Relaxed);
                warn!("outgoing bandwidth {kbps} kbit/s over limit {limit_kbps}");
            }
        } else {
            let _ = self
                .throttle_sends
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    (v > 0).then_some(v - 1)
                });
        }
    }

    /// Orderly teardown: stop accepting auth work, wait out the auth
    /// workers, then give serving sessions a bounded window to drain the
    /// file-handle cache.
    pub async fn shutdown(&self) {
        if self.allow_auth.swap(false, Ordering::AcqRel) {
            let _guard = self.auth_gate.write().await;
            info!("auth shutdown complete");
        }
        self.fserve_running.store(false, Ordering::Release);
        for _ in 0..10 {
            let remaining = self.fh_cache.len();
            if remaining == 0 {
                break;
            }
            info!("waiting for {remaining} file handles to clear");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        info!("file serving stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_list_add_and_lift() {
        let bans = BanList::default();
        bans.add("198.51.100.7", 60);
        assert!(bans.is_banned("198.51.100.7"));
        bans.add("198.51.100.7", -1);
        assert!(!bans.is_banned("198.51.100.7"));
        assert!(!bans.is_banned("203.0.113.1"));
    }

    #[tokio::test]
    async fn slowdown_caps_at_ten() {
        let core = Core::new(ServerConfig::default());
        for _ in 0..20 {
            core.bump_slowdown();
        }
        assert_eq!(core.slowdown(), 10);
        core.decay_slowdown();
        assert_eq!(core.slowdown(), 9);
    }
}
