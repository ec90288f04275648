//! Shared cache of open file handles.
//!
//! One [`FileHandle`] exists per (mount, flags) key; listeners multiplex
//! onto it and the handle leaves the cache the moment its last listener
//! releases it. Lock order is strict: cache map first, then per-handle
//! state, never the reverse.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use wavecast_config::ServerConfig;

use crate::client::{ClientControl, unix_now};
use crate::fserve::format::{FormatHandler, FormatType};
use crate::mime::MimeTypes;
use crate::rate::RateEstimator;
use crate::stats::StatsSink;

/// Minimum serving rate; throttle arithmetic divides by `limit / 1400`.
pub const MIN_LIMIT: u32 = 1400;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FhFlags: u32 {
        /// Handle backs a fallback stream rather than an on-demand file.
        const FALLBACK  = 1 << 0;
        /// Resolve the path under the admin root.
        const USE_ADMIN = 1 << 1;
        /// A fallback override has been published; swap roles once on move.
        const OVERRIDE  = 1 << 2;
    }
}

impl FhFlags {
    /// The bits that participate in the cache key.
    pub fn key_bits(self) -> FhFlags {
        self & (FhFlags::FALLBACK | FhFlags::USE_ADMIN)
    }
}

/// Where a listener should be served from; passed through the move
/// protocol and resolved against the cache.
#[derive(Debug, Clone)]
pub struct FbInfo {
    pub mount: String,
    pub fallback: Option<String>,
    pub flags: FhFlags,
    /// Target rate in bytes/s; 0 = send at socket speed.
    pub limit: u32,
    pub ftype: FormatType,
}

impl FbInfo {
    pub fn new(mount: impl Into<String>) -> FbInfo {
        FbInfo {
            mount: mount.into(),
            fallback: None,
            flags: FhFlags::empty(),
            limit: 0,
            ftype: FormatType::Undefined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FhKey {
    mount: String,
    flags: FhFlags,
}

impl FhKey {
    fn of(finfo: &FbInfo) -> FhKey {
        FhKey {
            mount: finfo.mount.clone(),
            flags: finfo.flags.key_bits(),
        }
    }
}

/// Mutable slice of a handle, guarded by the per-handle lock.
#[derive(Debug)]
pub struct FhState {
    pub refcount: usize,
    pub peak: usize,
    pub clients: Vec<Arc<ClientControl>>,
    pub fallback: Option<String>,
    pub override_active: bool,
    /// Unix time the next `outgoing_kbitrate` publish is due.
    pub stats_update: u64,
}

#[derive(Debug)]
pub struct FileHandle {
    pub mount: String,
    pub flags: FhFlags,
    /// Serving rate in bytes/s, clamped to [`MIN_LIMIT`]; 0 = unthrottled.
    pub limit: u32,
    pub ftype: FormatType,
    pub content_type: String,
    pub content_length: Option<u64>,
    file: Option<File>,
    pub format: Option<FormatHandler>,
    pub out_rate: Option<Mutex<RateEstimator>>,
    state: Mutex<FhState>,
}

impl FileHandle {
    pub fn state(&self) -> MutexGuard<'_, FhState> {
        self.state.lock()
    }

    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    /// Current fallback target, including a published override.
    pub fn fallback(&self) -> Option<String> {
        self.state.lock().fallback.clone()
    }

    pub fn is_fallback(&self) -> bool {
        self.flags.contains(FhFlags::FALLBACK)
    }

    /// Stats scope for this handle, present only on throttled handles.
    pub fn stats_scope(&self) -> Option<String> {
        (self.limit > 0).then(|| {
            let kind = if self.is_fallback() { "fallback" } else { "file" };
            format!("{kind}-{}", self.mount)
        })
    }

    /// First listener to observe the 5 s deadline wins the publish.
    pub fn stats_due(&self, now: u64) -> bool {
        let mut state = self.state.lock();
        if state.stats_update <= now {
            state.stats_update = now + 5;
            true
        } else {
            false
        }
    }

    pub fn add_rate_sample(&self, bytes: u64, now_ms: u64) {
        if let Some(rate) = &self.out_rate {
            rate.lock().add(bytes, now_ms);
        }
    }

    pub fn out_kbitrate(&self, now_ms: u64) -> u64 {
        self.out_rate
            .as_ref()
            .map(|rate| rate.lock().kbitrate(now_ms))
            .unwrap_or(0)
    }
}

/// Why an acquire was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// Admission policy said no; respond 403.
    MaxListeners,
    DuplicateLogin,
    /// No usable handle (missing fallback file, format mismatch).
    Unavailable,
}

/// Admission decision made while the handle is locked during acquire.
pub type AcquirePolicy<'a> =
    &'a mut dyn FnMut(&FileHandle, &mut FhState, bool) -> Result<(), AcquireError>;

#[derive(Debug, Default)]
pub struct FhCache {
    map: RwLock<HashMap<FhKey, Arc<FileHandle>>>,
}

impl FhCache {
    pub fn new() -> FhCache {
        FhCache::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Read-locked lookup. The returned handle must be locked before use;
    /// prefer [`FhCache::acquire`] which does lookup and attach atomically.
    pub fn find(&self, finfo: &FbInfo) -> Option<Arc<FileHandle>> {
        self.map.read().get(&FhKey::of(finfo)).cloned()
    }

    /// Find or open a handle and attach a listener to it in one step.
    ///
    /// `policy` runs with the handle locked and decides admission; its
    /// third argument says whether the handle pre-existed. On success the
    /// listener's control is attached and the refcount incremented.
    pub fn acquire(
        &self,
        config: &ServerConfig,
        mime: &MimeTypes,
        stats: &dyn StatsSink,
        finfo: &FbInfo,
        control: &Arc<ClientControl>,
        policy: AcquirePolicy<'_>,
    ) -> Result<Arc<FileHandle>, AcquireError> {
        let mut map = self.map.write();
        let key = FhKey::of(finfo);
        let (fh, existing) = match map.get(&key) {
            Some(fh) => {
                if finfo.flags.contains(FhFlags::FALLBACK)
                    && finfo.ftype != FormatType::Undefined
                    && !finfo.ftype.compatible(fh.ftype)
                {
                    warn!("format mismatched for {}", finfo.mount);
                    return Err(AcquireError::Unavailable);
                }
                (fh.clone(), true)
            }
            None => {
                let fh = Arc::new(open_handle(config, mime, stats, finfo)?);
                map.insert(key, fh.clone());
                (fh, false)
            }
        };
        let mut state = fh.state.lock();
        drop(map);
        if let Err(err) = policy(&fh, &mut state, existing) {
            drop(state);
            // a freshly opened handle with no listeners must not linger
            if !existing {
                self.evict_if_unused(&fh);
            }
            return Err(err);
        }
        state.refcount += 1;
        state.clients.push(control.clone());
        if state.refcount > state.peak {
            state.peak = state.refcount;
        }
        if let Some(scope) = fh.stats_scope() {
            stats.set(Some(&scope), "listeners", &state.refcount.to_string());
            stats.set(Some(&scope), "listener_peak", &state.peak.to_string());
        }
        debug!("refcount now {} for {}", state.refcount, fh.mount);
        drop(state);
        Ok(fh)
    }

    /// Detach a listener and drop the handle from the cache when the last
    /// reference goes. Takes the cache lock first per the lock hierarchy.
    pub fn release(&self, stats: &dyn StatsSink, fh: &Arc<FileHandle>, client_id: u64) {
        let mut map = self.map.write();
        let mut state = fh.state.lock();
        state.clients.retain(|c| c.id != client_id);
        if state.refcount > 0 {
            state.refcount -= 1;
        }
        if let Some(scope) = fh.stats_scope() {
            stats.set(Some(&scope), "listeners", &state.refcount.to_string());
        }
        debug!("refcount now {} on {}", state.refcount, fh.mount);
        if state.refcount == 0 {
            let key = FhKey {
                mount: fh.mount.clone(),
                flags: fh.flags.key_bits(),
            };
            // an override may have replaced this key with a fresh handle
            if map.get(&key).is_some_and(|entry| Arc::ptr_eq(entry, fh)) {
                map.remove(&key);
            }
            if let Some(scope) = fh.stats_scope() {
                stats.remove(Some(&scope), None);
            }
        }
    }

    fn evict_if_unused(&self, fh: &Arc<FileHandle>) {
        let mut map = self.map.write();
        let state = fh.state.lock();
        if state.refcount == 0 {
            let key = FhKey {
                mount: fh.mount.clone(),
                flags: fh.flags.key_bits(),
            };
            if map.get(&key).is_some_and(|entry| Arc::ptr_eq(entry, fh)) {
                map.remove(&key);
            }
        }
    }

    /// Publish a fallback override on a cached fallback handle: the handle
    /// leaves the cache and its listeners migrate on their next wake.
    pub fn set_override(&self, mount: &str, dest: &str, ftype: FormatType) -> bool {
        let mut map = self.map.write();
        let key = FhKey {
            mount: mount.to_string(),
            flags: FhFlags::FALLBACK,
        };
        let Some(fh) = map.get(&key) else {
            return false;
        };
        if fh.ftype != ftype {
            return false;
        }
        let fh = fh.clone();
        map.remove(&key);
        drop(map);
        let mut state = fh.state.lock();
        state.override_active = true;
        state.fallback = Some(dest.to_string());
        info!("move clients from {mount} to {dest}");
        true
    }

    /// Listener count on the handle for `finfo`, 0 when absent.
    pub fn query_count(&self, finfo: &FbInfo) -> usize {
        self.find(finfo).map(|fh| fh.refcount()).unwrap_or(0)
    }

    /// Flag a listener on `mount` for disconnection by connection id,
    /// checking the on-demand handle then the fallback handle.
    pub fn kill_client(&self, mount: &str, id: u64) -> bool {
        let mut finfo = FbInfo::new(mount);
        for flags in [FhFlags::empty(), FhFlags::FALLBACK] {
            finfo.flags = flags;
            if let Some(fh) = self.find(&finfo) {
                let state = fh.state.lock();
                if let Some(control) = state.clients.iter().find(|c| c.id == id) {
                    control.set_error();
                    return true;
                }
            }
        }
        false
    }

    /// Snapshot the listeners on `mount`, preferring the fallback handle
    /// and retrying the plain key, as the admin list does.
    pub fn list_clients(&self, mount: &str) -> Vec<Arc<ClientControl>> {
        let mut finfo = FbInfo::new(mount);
        for flags in [FhFlags::FALLBACK, FhFlags::empty()] {
            finfo.flags = flags;
            if let Some(fh) = self.find(&finfo) {
                let listeners = fh.state.lock().clients.clone();
                if !listeners.is_empty() {
                    return listeners;
                }
            }
        }
        Vec::new()
    }
}

/// Resolve a mount to a path under the configured roots.
pub fn resolve_path(config: &ServerConfig, mount: &str, use_admin: bool) -> PathBuf {
    let root = if use_admin {
        &config.admin_root
    } else {
        &config.document_root
    };
    root.join(mount.trim_start_matches('/'))
}

/// Build a new handle for `finfo`. Called with the cache write lock held.
fn open_handle(
    config: &ServerConfig,
    mime: &MimeTypes,
    stats: &dyn StatsSink,
    finfo: &FbInfo,
) -> Result<FileHandle, AcquireError> {
    let is_fallback = finfo.flags.contains(FhFlags::FALLBACK);
    let path = resolve_path(config, &finfo.mount, finfo.flags.contains(FhFlags::USE_ADMIN));
    let content_type = mime.content_type(&path.to_string_lossy());
    let sniffed = FormatType::from_content_type(&content_type);
    let ftype = if finfo.ftype == FormatType::Undefined {
        sniffed
    } else {
        finfo.ftype
    };
    if is_fallback && ftype != FormatType::Undefined && !ftype.compatible(sniffed) {
        warn!("format mismatched for {}", finfo.mount);
        return Err(AcquireError::Unavailable);
    }
    if is_fallback {
        info!("lookup of fallback file \"{}\" ({})", finfo.mount, finfo.limit);
    } else {
        info!("lookup of \"{}\"", finfo.mount);
    }
    let (file, content_length) = match File::open(&path) {
        Ok(file) => {
            let len = file.metadata().ok().map(|m| m.len());
            (Some(file), len)
        }
        Err(err) => {
            info!("failed to open \"{}\": {err}", path.display());
            if is_fallback {
                return Err(AcquireError::Unavailable);
            }
            (None, None)
        }
    };
    let limit = match finfo.limit {
        0 => 0,
        n => n.max(MIN_LIMIT),
    };
    let handle = FileHandle {
        mount: finfo.mount.clone(),
        flags: finfo.flags.key_bits(),
        limit,
        ftype,
        content_type,
        content_length,
        file,
        format: FormatHandler::new(ftype),
        out_rate: (limit > 0).then(|| Mutex::new(RateEstimator::new())),
        state: Mutex::new(FhState {
            refcount: 0,
            peak: 0,
            clients: Vec::new(),
            fallback: finfo.fallback.clone(),
            override_active: false,
            stats_update: unix_now(),
        }),
    };
    if let Some(scope) = handle.stats_scope() {
        stats.set(Some(&scope), "outgoing_kbitrate", "0");
        stats.set(Some(&scope), "listeners", "0");
        stats.set(Some(&scope), "listener_peak", "0");
    }
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TracingStats;
    use std::io::Write;

    fn admit_all() -> impl FnMut(&FileHandle, &mut FhState, bool) -> Result<(), AcquireError> {
        |_, _, _| Ok(())
    }

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            document_root: dir.to_path_buf(),
            ..ServerConfig::default()
        }
    }

    fn write_file(dir: &std::path::Path, name: &str, len: usize) {
        let mut f = File::create(dir.join(name)).expect("create");
        f.write_all(&vec![0u8; len]).expect("write");
    }

    #[test]
    fn open_then_release_restores_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "track.mp3", 64);
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let mime = MimeTypes::new();
        let stats = TracingStats;
        let control = Arc::new(ClientControl::new(1, None));

        assert!(cache.is_empty());
        let finfo = FbInfo::new("/track.mp3");
        let fh = cache
            .acquire(&config, &mime, &stats, &finfo, &control, &mut admit_all())
            .expect("acquire");
        assert_eq!(cache.len(), 1);
        assert_eq!(fh.refcount(), 1);
        assert_eq!(fh.content_length, Some(64));
        assert_eq!(fh.ftype, FormatType::Mp3);

        cache.release(&stats, &fh, control.id);
        assert!(cache.is_empty());
        assert_eq!(fh.refcount(), 0);
    }

    #[test]
    fn one_handle_per_key_and_refcount_tracks_clients() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.mp3", 10);
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let mime = MimeTypes::new();
        let stats = TracingStats;
        let finfo = FbInfo::new("/a.mp3");

        let c1 = Arc::new(ClientControl::new(1, None));
        let c2 = Arc::new(ClientControl::new(2, None));
        let fh1 = cache
            .acquire(&config, &mime, &stats, &finfo, &c1, &mut admit_all())
            .expect("first");
        let fh2 = cache
            .acquire(&config, &mime, &stats, &finfo, &c2, &mut admit_all())
            .expect("second");
        assert!(Arc::ptr_eq(&fh1, &fh2));
        assert_eq!(cache.len(), 1);
        {
            let state = fh1.state();
            assert_eq!(state.refcount, state.clients.len());
            assert_eq!(state.refcount, 2);
            assert_eq!(state.peak, 2);
        }
        cache.release(&stats, &fh1, 1);
        assert_eq!(cache.len(), 1);
        cache.release(&stats, &fh2, 2);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn fallback_and_plain_keys_are_distinct() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.mp3", 10);
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let mime = MimeTypes::new();
        let stats = TracingStats;

        let plain = FbInfo::new("/a.mp3");
        let fallback = FbInfo {
            flags: FhFlags::FALLBACK,
            limit: 16_000,
            ..FbInfo::new("/a.mp3")
        };
        let c1 = Arc::new(ClientControl::new(1, None));
        let c2 = Arc::new(ClientControl::new(2, None));
        cache
            .acquire(&config, &mime, &stats, &plain, &c1, &mut admit_all())
            .expect("plain");
        cache
            .acquire(&config, &mime, &stats, &fallback, &c2, &mut admit_all())
            .expect("fallback");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn missing_fallback_file_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let control = Arc::new(ClientControl::new(1, None));
        let finfo = FbInfo {
            flags: FhFlags::FALLBACK,
            limit: 16_000,
            ..FbInfo::new("/missing.mp3")
        };
        let err = cache
            .acquire(
                &config,
                &MimeTypes::new(),
                &TracingStats,
                &finfo,
                &control,
                &mut admit_all(),
            )
            .unwrap_err();
        assert_eq!(err, AcquireError::Unavailable);
        assert!(cache.is_empty());
    }

    #[test]
    fn limit_clamped_to_floor() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.mp3", 10);
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let control = Arc::new(ClientControl::new(1, None));
        let finfo = FbInfo {
            flags: FhFlags::FALLBACK,
            limit: 100,
            ..FbInfo::new("/a.mp3")
        };
        let fh = cache
            .acquire(
                &config,
                &MimeTypes::new(),
                &TracingStats,
                &finfo,
                &control,
                &mut admit_all(),
            )
            .expect("acquire");
        assert_eq!(fh.limit, MIN_LIMIT);
    }

    #[test]
    fn refused_policy_evicts_fresh_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.mp3", 10);
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let control = Arc::new(ClientControl::new(1, None));
        let mut policy = |_: &FileHandle, _: &mut FhState, _: bool| Err(AcquireError::MaxListeners);
        let err = cache
            .acquire(
                &config,
                &MimeTypes::new(),
                &TracingStats,
                &FbInfo::new("/a.mp3"),
                &control,
                &mut policy,
            )
            .unwrap_err();
        assert_eq!(err, AcquireError::MaxListeners);
        assert!(cache.is_empty());
    }

    #[test]
    fn override_pulls_handle_from_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.mp3", 10);
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let control = Arc::new(ClientControl::new(1, None));
        let finfo = FbInfo {
            flags: FhFlags::FALLBACK,
            limit: 16_000,
            ..FbInfo::new("/a.mp3")
        };
        let fh = cache
            .acquire(
                &config,
                &MimeTypes::new(),
                &TracingStats,
                &finfo,
                &control,
                &mut admit_all(),
            )
            .expect("acquire");
        assert!(cache.set_override("/a.mp3", "/live.mp3", FormatType::Mp3));
        assert_eq!(cache.len(), 0);
        assert_eq!(fh.fallback().as_deref(), Some("/live.mp3"));
        assert!(fh.state().override_active);
    }

    #[test]
    fn kill_client_flags_listener() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.mp3", 10);
        let config = test_config(dir.path());
        let cache = FhCache::new();
        let control = Arc::new(ClientControl::new(42, None));
        cache
            .acquire(
                &config,
                &MimeTypes::new(),
                &TracingStats,
                &FbInfo::new("/a.mp3"),
                &control,
                &mut admit_all(),
            )
            .expect("acquire");
        assert!(!control.is_error());
        assert!(cache.kill_client("/a.mp3", 42));
        assert!(control.is_error());
        assert!(!cache.kill_client("/a.mp3", 99));
    }
}
