//! Facade over the live-source subsystem.
//!
//! The core decides *whether* a listener reaches a source; the broadcaster
//! behind this trait owns the per-listener queues and does the rest.

use wavecast_config::MountConfig;

use crate::client::Client;
use crate::fserve::format::FormatType;

/// Snapshot of a mount in the source tree.
#[derive(Debug, Clone, Copy)]
pub struct SourceEntry {
    /// Source exists and is accepting listeners.
    pub available: bool,
    pub format: FormatType,
}

/// Outcome of routing a listener through the source subsystem.
#[derive(Debug)]
pub enum SourceAddOutcome {
    Accepted,
    /// No live source on this mount; the caller falls through to file
    /// serving with the client handed back.
    NoSource(Client),
    /// The source subsystem refused and already answered the client.
    Refused,
}

#[cfg_attr(test, mockall::automock)]
pub trait SourceTree: Send + Sync {
    /// Raw lookup, no admission checks.
    fn find_mount(&self, mount: &str) -> Option<SourceEntry>;

    /// Attach a listener directly to an available source, as the move
    /// protocol does. `Err` hands the client back untouched.
    fn setup_listener(&self, mount: &str, client: Client) -> Result<(), Client>;

    /// Full admission path: listener counts, intro content, queue setup.
    fn add_listener<'a>(
        &self,
        mount: &'a str,
        mountinfo: Option<&'a MountConfig>,
        client: Client,
    ) -> SourceAddOutcome;

    /// Begin broadcasting from an authenticated source client.
    fn startup_source(&self, mount: &str, client: Client);
}

/// Source tree with no live mounts; every listener falls through to files.
#[derive(Debug, Default)]
pub struct NullSourceTree;


impl SourceTree for NullSourceTree {
    fn find_mount(&self, _mount: &str) -> Option<SourceEntry> {
        None
    }

    fn setup_listener(&self, _mount: &str, client: Client) -> Result<(), Client> {
        Err(client)
    }

    fn add_listener(
        &self,
        _mount: &str,
        _mountinfo: Option<&MountConfig>,
        client: Client,
    ) -> SourceAddOutcome {
        SourceAddOutcome::NoSource(client)
    }

    fn startup_source(&self, mount: &str, client: Client) {
        tracing::warn!("no source subsystem to start {mount}");
        drop(client);
    }
}
