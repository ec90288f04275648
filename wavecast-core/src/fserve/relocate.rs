//! Relocating a listener along a mount's fallback chain.
//!
//! Walks the chain looking for a live, format-compatible source; failing
//! that, the listener lands back on file serving. The walk is bounded and
//! resolved fresh on every move, never cached.

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{Client, ClientFlags};
use crate::core::Core;
use crate::fserve::cache::{FbInfo, FhFlags};
use crate::fserve::{self, SetupFailure};

const MAX_FALLBACK_HOPS: u32 = 20;

/// Where the listener ended up.
#[derive(Debug)]
pub enum MoveOutcome {
    /// Handed to a live source, or answered and closed along the way.
    Done,
    /// Re-attached to a file handle; the caller keeps driving the session.
    File(fserve::serve::Session),
    /// Nowhere to go; the caller terminates the listener.
    Failed(Client),
}

pub async fn move_listener(core: &Arc<Core>, mut client: Client, finfo: FbInfo) -> MoveOutcome {
    let mut hops = MAX_FALLBACK_HOPS;
    let mut rate = finfo.limit;
    let mut target = finfo.clone();

    loop {
        let minfo = core.find_mount(&target.mount);
        if rate == 0
            && let Some(mount) = &minfo
            && mount.config.limit_rate_kbps > 0
        {
            rate = mount.config.limit_rate_kbps * 125;
        }
        let src = core.sources.find_mount(&target.mount);
        if src.is_none() && minfo.is_none() {
            break;
        }
        if let Some(entry) = src
            && entry.available
            // an unused on-demand relay still has an undetermined type
            && finfo.ftype.compatible(entry.format)
        {
            client.flags.insert(ClientFlags::HAS_MOVED);
            match core.sources.setup_listener(&target.mount, client) {
                Ok(()) => {
                    debug!("listener moved to live source {}", target.mount);
                    return MoveOutcome::Done;
                }
                Err(returned) => {
                    client = returned;
                    client.flags.remove(ClientFlags::HAS_MOVED);
                }
            }
        }
        match minfo.as_ref().and_then(|m| m.config.fallback_mount.clone()) {
            Some(fallback) if hops > 0 => {
                hops -= 1;
                target.mount = fallback;
            }
            _ => break,
        }
    }

    if client.flags.contains(ClientFlags::IS_SLAVE) {
        return MoveOutcome::Failed(client);
    }
    if target.flags.contains(FhFlags::OVERRIDE) {
        // one-shot swap back to the mount the override displaced
        if let Some(displaced) = target.fallback.take() {
            target.mount = displaced;
        }
        target.flags.remove(FhFlags::OVERRIDE);
    }
    if target.limit == 0 {
        if rate == 0 {
            rate = parse_limit_suffix(&target.mount).unwrap_or(0);
        }
        target.limit = rate;
    }
    info!("moving listener to file serve on {}", target.mount);
    match fserve::setup_client(core, client, Some(target)).await {
        Ok(session) => MoveOutcome::File(session),
        Err(SetupFailure::Handled) => MoveOutcome::Done,
        Err(SetupFailure::Invalid(client)) => MoveOutcome::Failed(client),
    }
}

/// `/mount[NNN]` carries a serving rate in kbit/s; used only when no
/// explicit limit was resolved.
pub fn parse_limit_suffix(mount: &str) -> Option<u32> {
    let open = mount.rfind('[')?;
    let close = open + mount[open..].find(']')?;
    let kbits: u32 = mount[open + 1..close].parse().ok()?;
    Some(kbits * 125)
}
