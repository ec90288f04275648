//! Hooks into the admin/stats surface the core hands clients to.
//!
//! The admin interface itself lives outside the core; these are the points
//! where an admitted client leaves the admission pipeline for it.

use async_trait::async_trait;

use crate::client::Client;

#[async_trait]
pub trait AdminHooks: Send + Sync {
    /// `/admin/streams` without a `mount` parameter: plain-text mount list
    /// for a slave server.
    async fn list_mounts(&self, client: Client);

    /// STATS-method request on `/admin/streams`: register the slave as a
    /// stats feed listener.
    async fn slave_stats_listener(&self, client: Client);

    /// `.xsl` request: run the stats transform for `path`.
    async fn stats_transform(&self, client: Client, path: &str);

    /// Source-side metadata update (`/admin.cgi`, `/admin/metadata`).
    async fn metadata_request(&self, client: Client);
}

/// Stub used when no admin surface is wired in.
#[derive(Debug, Default)]
pub struct NullAdmin;

#[async_trait]
impl AdminHooks for NullAdmin {
    async fn list_mounts(&self, client: Client) {
        client.send_404("admin interface unavailable").await;
    }

    async fn slave_stats_listener(&self, client: Client) {
        client.send_404("admin interface unavailable").await;
    }

    async fn stats_transform(&self, client: Client, _path: &str) {
        client.send_404("stats transform unavailable").await;
    }

    async fn metadata_request(&self, client: Client) {
        client.send_404("admin interface unavailable").await;
    }
}
