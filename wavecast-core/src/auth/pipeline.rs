//! Listener and source admission.
//!
//! The connection layer hands every parsed request to [`add_listener`]; it
//! either answers the client on the spot, queues it on the mount's
//! authenticator, or routes it onward to the source subsystem or the
//! file-serving engine.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::backend::ThreadData;
use crate::auth::instance::{AuthOp, AuthRequest, Authenticator, PENDING_LIMIT};
use crate::client::{Client, ClientFlags, ClientState};
use crate::core::{Core, Mount};
use crate::fserve;
use crate::http::Method;
use crate::source::SourceAddOutcome;

/// How the admission path ended, from the connection layer's viewpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Waiting on an auth worker; the worker finishes the request.
    Queued,
    /// Handed to the source subsystem, a serving session, or the admin
    /// surface; someone owns the client.
    Routed,
    /// Answered with the given status.
    Refused(u16),
}

/// Admit a listener to `mount`, authenticating first when the mount asks
/// for it. Runs on the connection-accept path and never blocks on a
/// back-end: authentication is queued, not awaited.
pub async fn add_listener(core: &Arc<Core>, mount: &str, mut client: Client) -> AddOutcome {
    let mountinfo = core.find_mount(mount);
    if !client.flags.contains(ClientFlags::AUTHENTICATED) {
        if let Some(minfo) = &mountinfo {
            if minfo.config.skip_accesslog {
                client.flags.insert(ClientFlags::SKIP_ACCESSLOG);
            }
            if minfo.config.ban_client != 0 {
                if minfo.config.ban_client < 0 {
                    client.flags.insert(ClientFlags::IP_BAN_LIFT);
                }
                if let Some(ip) = client.control.ip.clone() {
                    core.bans.add(&ip, minfo.config.ban_client);
                }
            }
            if minfo.config.no_mount {
                client.send_403("mountpoint unavailable").await;
                return AddOutcome::Refused(403);
            }
            if let Some(prefix) = &minfo.config.redirect {
                let location = format!("{prefix}{mount}");
                client.send_302(&location).await;
                return AddOutcome::Refused(302);
            }
            if let Some(auth) = &minfo.auth
                && auth.can_authenticate()
            {
                if !auth.running() || auth.pending_count() > PENDING_LIMIT {
                    warn!("too many clients awaiting authentication");
                    core.bump_slowdown();
                    client.send_403("busy, please try again later").await;
                    return AddOutcome::Refused(403);
                }
                client.flags.remove(ClientFlags::ACTIVE);
                debug!("adding client for authentication");
                let request = AuthRequest::new(core, mount, Some(client), AuthOp::NewListener);
                return match auth.enqueue(core, request) {
                    Ok(()) => AddOutcome::Queued,
                    Err(mut returned) => {
                        if let Some(client) = returned.client.take() {
                            client.send_403("busy, please try again later").await;
                        }
                        AddOutcome::Refused(403)
                    }
                };
            }
        } else if mount == "/admin/streams" {
            // slaves must authenticate for the streamlist
            client.send_401(None).await;
            return AddOutcome::Refused(401);
        }
    }
    add_authenticated_listener(core, mount, mountinfo, client).await
}

/// Route a listener that has passed (or never needed) authentication onto
/// the source subsystem, the admin surface, or file serving.
pub async fn add_authenticated_listener(
    core: &Arc<Core>,
    mount: &str,
    mut mountinfo: Option<Arc<Mount>>,
    mut client: Client,
) -> AddOutcome {
    client.flags.insert(ClientFlags::AUTHENTICATED);
    let mut mount = mount.to_string();

    if let Some(minfo) = &mountinfo
        && minfo.config.so_sndbuf > 0
    {
        client.apply_so_sndbuf(minfo.config.so_sndbuf);
    }

    // streamlist requests from slave servers
    if mount == "/admin/streams" {
        client.flags.insert(ClientFlags::IS_SLAVE);
        if client.request.method == Method::Stats {
            core.admin.slave_stats_listener(client).await;
            return AddOutcome::Routed;
        }
        match client.request.query_param("mount").map(str::to_string) {
            None => {
                core.admin.list_mounts(client).await;
                return AddOutcome::Routed;
            }
            Some(requested) => {
                mountinfo = core.find_mount(&requested);
                mount = requested;
            }
        }
    }

    if crate::mime::extension(&mount) == Some("xsl") {
        debug!("stats request, sending transformed stats");
        core.admin.stats_transform(client, &mount).await;
        return AddOutcome::Routed;
    }

    let config = mountinfo.as_ref().map(|m| m.config.clone());
    match core.sources.add_listener(&mount, config.as_ref(), client) {
        SourceAddOutcome::Accepted | SourceAddOutcome::Refused => AddOutcome::Routed,
        SourceAddOutcome::NoSource(mut client) => {
            if let Some(minfo) = &mountinfo
                && !minfo.config.file_seekable
            {
                debug!("disable seek on file matching {}", minfo.name);
                client.request.remove_header("range");
                client.flags.insert(ClientFlags::NO_CONTENT_LENGTH);
            }
            fserve::client_create(core, client, &mount).await;
            AddOutcome::Routed
        }
    }
}

/// Worker-side handling of a queued listener: re-check the connection, run
/// the back-end, then place the listener.
pub(crate) async fn new_listener_callback(
    core: &Arc<Core>,
    auth: &Arc<Authenticator>,
    request: &mut AuthRequest,
    data: Option<&mut ThreadData>,
) {
    {
        let Some(client) = request.client.as_mut() else {
            return;
        };
        // a slow back-end call is wasted on a listener that already hung up
        if !core.allow_auth() || !client.connection_alive().await {
            debug!("dropping listener connection");
            client.respcode = 400;
            return;
        }
    }
    let _ = auth.backend().authenticate(request, data).await;
    if postprocess_listener(core, auth, request).await.is_err() {
        debug!("listener connection failed");
    }
}

/// Place a listener after its back-end verdict: onward when authenticated,
/// to the rejected mount when configured, otherwise challenge.
pub(crate) async fn postprocess_listener(
    core: &Arc<Core>,
    auth: &Arc<Authenticator>,
    request: &mut AuthRequest,
) -> Result<(), ()> {
    let Some(client) = request.client.take() else {
        return Err(());
    };
    let mut mount = request.mount.clone();
    if !client.flags.contains(ClientFlags::AUTHENTICATED) {
        match &auth.rejected_mount {
            Some(rejected) => mount = rejected.clone(),
            None => {
                client.send_401(auth.realm.as_deref()).await;
                return Err(());
            }
        }
    }
    let mountinfo = core.find_mount(&mount);
    match add_authenticated_listener(core, &mount, mountinfo, client).await {
        AddOutcome::Refused(_) => Err(()),
        _ => Ok(()),
    }
}

/// Worker-side handling of a queued source client.
pub(crate) async fn stream_auth_callback(
    core: &Arc<Core>,
    auth: &Arc<Authenticator>,
    request: &mut AuthRequest,
    data: Option<&mut ThreadData>,
) {
    auth.backend().stream_auth(request, data).await;
    let authenticated = request
        .client
        .as_ref()
        .is_some_and(|c| c.flags.contains(ClientFlags::AUTHENTICATED));
    if authenticated {
        if let Some(client) = request.client.take() {
            postprocess_source(core, client, &request.mount).await;
        }
    } else {
        // client stays on the request; disposal challenges it
        warn!("failed auth for source \"{}\"", request.mount);
    }
}

/// Either a source admin request or an actual stream start.
async fn postprocess_source(core: &Arc<Core>, client: Client, mount: &str) {
    let path = client.request.path.clone();
    if path == "/admin.cgi" || path.starts_with("/admin/metadata") {
        debug!("metadata request ({path}, {mount})");
        core.admin.metadata_request(client).await;
    } else {
        debug!("on mountpoint {mount}");
        core.sources.startup_source(mount, client);
    }
}

/// Queue source-client authentication when the mount's back-end handles
/// it. `Err` hands the client back for the plain password check.
pub fn stream_authenticate(
    core: &Arc<Core>,
    mut client: Client,
    mount: &str,
    mountinfo: &Option<Arc<Mount>>,
) -> Result<(), Client> {
    if let Some(minfo) = mountinfo
        && let Some(auth) = &minfo.auth
        && auth.has_stream_auth()
    {
        info!("request source auth for \"{mount}\"");
        client.flags.remove(ClientFlags::ACTIVE);
        let request = AuthRequest::new(core, mount, Some(client), AuthOp::SourceAuth);
        return match auth.enqueue(core, request) {
            Ok(()) => Ok(()),
            Err(mut returned) => match returned.client.take() {
                Some(client) => Err(client),
                None => Ok(()),
            },
        };
    }
    Err(client)
}

/// Outcome of the synchronous source-credential check.
#[derive(Debug)]
pub enum SourceCheck {
    /// Queued on an auth worker; the worker finishes the request.
    Queued,
    Accepted(Client),
    Denied(Client),
}

/// Check a connecting source client against mount or global credentials,
/// deferring to the back-end when one is configured.
pub fn check_source(core: &Arc<Core>, client: Client, mount: &str) -> SourceCheck {
    let mountinfo = core.find_mount(mount);
    let mut expected_pass = core.config().source_password.clone();
    let mut expected_user = "source".to_string();
    let mut client = client;
    if let Some(minfo) = &mountinfo {
        match stream_authenticate(core, client, mount, &mountinfo) {
            Ok(()) => return SourceCheck::Queued,
            Err(returned) => client = returned,
        }
        if let Some(pass) = &minfo.config.password {
            expected_pass = Some(pass.clone());
        }
        if let Some(user) = &minfo.config.username {
            expected_user = user.clone();
        }
    }
    let accepted = match (&client.username, &client.password, &expected_pass) {
        (Some(user), Some(pass), Some(expected)) => {
            *user == expected_user && pass == expected
        }
        _ => false,
    };
    if accepted {
        SourceCheck::Accepted(client)
    } else {
        SourceCheck::Denied(client)
    }
}

/// Tell the mount's back-end a stream went live. Ordered before any
/// listener that joins afterwards observes the source.
pub fn stream_start(core: &Arc<Core>, mountinfo: &Option<Arc<Mount>>, mount: &str) {
    if let Some(minfo) = mountinfo
        && let Some(auth) = &minfo.auth
        && auth.has_stream_start()
    {
        info!("request source start for \"{mount}\"");
        let request = AuthRequest::new(core, mount, None, AuthOp::StreamStart);
        let _ = auth.enqueue(core, request);
    }
}

/// Tell the mount's back-end a stream terminated.
pub fn stream_end(core: &Arc<Core>, mountinfo: &Option<Arc<Mount>>, mount: &str) {
    if let Some(minfo) = mountinfo
        && let Some(auth) = &minfo.auth
        && auth.has_stream_end()
    {
        info!("request source end for \"{mount}\"");
        let request = AuthRequest::new(core, mount, None, AuthOp::StreamEnd);
        let _ = auth.enqueue(core, request);
    }
}

/// Release an authenticated listener: hand it to the back-end's
/// remove-listener queue when one exists, else answer and close.
pub async fn release_listener(
    core: &Arc<Core>,
    mut client: Client,
    mount: &str,
    mountinfo: Option<Arc<Mount>>,
) {
    if client.flags.contains(ClientFlags::AUTHENTICATED) {
        client.drain_queue();
        if let Some(minfo) = &mountinfo
            && let Some(auth) = &minfo.auth
            && auth.has_release_listener()
        {
            client.flags.remove(ClientFlags::ACTIVE);
            client.state = ClientState::AwaitAuth;
            let request = AuthRequest::new(core, mount, Some(client), AuthOp::RemoveListener);
            match auth.enqueue(core, request) {
                Ok(()) => return,
                Err(mut returned) => {
                    let Some(recovered) = returned.client.take() else {
                        return;
                    };
                    client = recovered;
                }
            }
        }
        client.flags.remove(ClientFlags::AUTHENTICATED);
    }
    client.send_404("").await;
}
