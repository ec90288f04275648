//! The authenticator back-end surface.
//!
//! Each back-end implements whichever operations it supports; the pipeline
//! consults the capability probes before queueing work, so an absent
//! operation costs nothing.

use std::any::Any;

use async_trait::async_trait;

use crate::auth::instance::AuthRequest;

/// Verdict from a back-end's authenticate call. The back-end also sets the
/// client's AUTHENTICATED flag on success; post-processing keys off the
/// flag so a back-end can grant admission out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Granted,
    Denied,
}

/// Per-worker back-end state, eg a connection handle kept across requests.
pub type ThreadData = Box<dyn Any + Send>;

#[async_trait]
pub trait AuthBackend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &'static str;

    fn can_authenticate(&self) -> bool {
        false
    }
    fn has_release_listener(&self) -> bool {
        false
    }
    fn has_stream_auth(&self) -> bool {
        false
    }
    fn has_stream_start(&self) -> bool {
        false
    }
    fn has_stream_end(&self) -> bool {
        false
    }

    async fn authenticate(
        &self,
        _req: &mut AuthRequest,
        _data: Option<&mut ThreadData>,
    ) -> AuthDecision {
        AuthDecision::Denied
    }

    async fn release_listener(&self, _req: &mut AuthRequest, _data: Option<&mut ThreadData>) {}

    async fn stream_auth(&self, _req: &mut AuthRequest, _data: Option<&mut ThreadData>) {}

    async fn stream_start(&self, _req: &mut AuthRequest, _data: Option<&mut ThreadData>) {}

    async fn stream_end(&self, _req: &mut AuthRequest, _data: Option<&mut ThreadData>) {}

    /// Allocate per-worker state, called once per handler slot at build.
    fn alloc_thread_data(&self) -> Option<ThreadData> {
        None
    }

    fn release_thread_data(&self, _data: ThreadData) {}

    /// Back-end teardown, run when the authenticator is dropped.
    fn release(&mut self) {}
}
