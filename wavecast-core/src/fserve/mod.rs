//! The file-serving engine.
//!
//! Entry points for attaching a listener to on-disk content: direct file
//! requests, fallback streams resolved through the move protocol, and the
//! playlist bodies the server synthesizes itself.

pub mod cache;
pub mod format;
pub mod relocate;
pub mod serve;

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::auth;
use crate::client::{Client, ClientFlags, ClientState, unix_now};
use crate::core::Core;
use crate::fserve::cache::{AcquireError, FbInfo, FhFlags, FhState, FileHandle};
use crate::fserve::relocate::MoveOutcome;
use crate::fserve::serve::{ServeAction, Session};
use crate::http;
use tokio::time::Instant;

/// Why a setup did not produce a session.
#[derive(Debug)]
pub enum SetupFailure {
    /// The client was answered (403, 404, …) or dropped; nothing to drive.
    Handled,
    /// Invalid destination (unusable fallback target, malformed range);
    /// the caller still owns the client.
    Invalid(Client),
}

/// Resolve `finfo` against the handle cache and prepare the client for
/// serving. `None` serves whatever is already queued on the client (eg a
/// synthesized playlist).
pub async fn setup_client(
    core: &Arc<Core>,
    mut client: Client,
    finfo: Option<FbInfo>,
) -> Result<Session, SetupFailure> {
    let mut handle = None;
    if let Some(finfo) = finfo {
        if finfo.flags.contains(FhFlags::FALLBACK) && finfo.limit == 0 {
            return Err(SetupFailure::Invalid(client));
        }
        let mount = core.find_mount(&finfo.mount);
        let control = client.control.clone();
        let mut policy = |_fh: &FileHandle, state: &mut FhState, _existing: bool| {
            let Some(mount) = &mount else {
                return Ok(());
            };
            let max = mount.config.max_listeners;
            if max >= 0 && state.refcount as i64 >= max {
                return Err(AcquireError::MaxListeners);
            }
            if let Some(auth) = &mount.auth
                && !auth.allow_duplicate_users
                && let Some(username) = control.username()
            {
                let duplicate = state
                    .clients
                    .iter()
                    .find(|c| c.username().as_deref() == Some(username.as_str()));
                if let Some(existing) = duplicate {
                    if auth.drop_existing_listener {
                        info!("dropping existing listener for {username}");
                        existing.set_error();
                    } else {
                        return Err(AcquireError::DuplicateLogin);
                    }
                }
            }
            Ok(())
        };
        let acquired = {
            let config = core.config();
            core.fh_cache.acquire(
                &config,
                &core.mime,
                core.stats.as_ref(),
                &finfo,
                &client.control,
                &mut policy,
            )
        };
        let fh = match acquired {
            Ok(fh) => fh,
            Err(AcquireError::MaxListeners) => {
                let redirect = core
                    .find_mount(&finfo.mount)
                    .and_then(|m| m.config.fallback_mount.clone());
                match redirect {
                    Some(to) => client.send_403_redirect(&to, "max listeners reached").await,
                    None => client.send_403("max listeners reached").await,
                }
                return Err(SetupFailure::Handled);
            }
            Err(AcquireError::DuplicateLogin) => {
                client.send_403("Account already in use").await;
                return Err(SetupFailure::Handled);
            }
            Err(AcquireError::Unavailable) => return Err(SetupFailure::Invalid(client)),
        };
        if fh.limit > 0 {
            client.timer_start = unix_now();
            if client.sent_bytes == 0 {
                // fresh connections get a short burst before throttling bites
                client.timer_start -= 2;
            }
            client.counter = 0;
            client.intro_offset = 0;
            core.reduce_global_sampling();
        }
        if client.respcode == 0 && !fill_headers(&mut client, &fh) {
            core.fh_cache
                .release(core.stats.as_ref(), &fh, client.control.id);
            client.control.set_error();
            return Err(SetupFailure::Handled);
        }
        client.mount = Some(fh.mount.clone());
        handle = Some(fh);
    }
    client.flags.remove(ClientFlags::HAS_INTRO_CONTENT);
    client.flags.insert(ClientFlags::IN_FSERVE);
    client.state = ClientState::PreFile;
    client.schedule = Instant::now();
    let shard = core.shards.assign();
    Ok(Session {
        client,
        fh: handle,
        shard,
    })
}

/// Synthesize the response header chain for a file-backed listener.
/// Returns false when a range request cannot be satisfied.
fn fill_headers(client: &mut Client, fh: &FileHandle) -> bool {
    let range = client.request.header("range").map(str::to_string);
    if let Some(range) = range {
        let Some(total) = fh.content_length else {
            return false;
        };
        let Some(start) = http::parse_range(&range, total) else {
            return false;
        };
        client.respcode = 206;
        client.intro_offset = start;
        client.queue_buffer(http::response_206(&fh.content_type, start, total));
    } else {
        client.respcode = 200;
        // a looping fallback stream has no meaningful end
        let length = if client.flags.contains(ClientFlags::NO_CONTENT_LENGTH) || fh.is_fallback()
        {
            None
        } else {
            fh.content_length
        };
        client.queue_buffer(http::response_200(&fh.content_type, length));
    }
    client.pos = 0;
    true
}

/// A listener asked for a file by path: serve it, or synthesize a playlist
/// pointing at the stream the path names.
pub async fn client_create(core: &Arc<Core>, mut client: Client, path: &str) {
    let (fullpath, fileserve) = {
        let config = core.config();
        (cache::resolve_path(&config, path, false), config.fileserve)
    };
    debug!("checking for file {path} ({})", fullpath.display());

    let ext = crate::mime::extension(path);
    let m3u_requested = ext == Some("m3u");
    let xspf_requested = ext == Some("xspf");
    let metadata = std::fs::metadata(&fullpath).ok();

    if metadata.is_none() {
        if m3u_requested {
            let body = synthesize_m3u(core, &client, path);
            client.respcode = 200;
            client.queue_buffer(body);
            spawn_or_drop(core, client, None).await;
            return;
        }
        if xspf_requested {
            let body = synthesize_xspf(core, path);
            client.respcode = 200;
            client.queue_buffer(body);
            spawn_or_drop(core, client, None).await;
            return;
        }
        if !client.flags.contains(ClientFlags::SKIP_ACCESSLOG) {
            warn!("req for file \"{}\" not found", fullpath.display());
        }
        client
            .send_404("The file you requested could not be found")
            .await;
        return;
    }

    if !fileserve {
        debug!("on demand file \"{}\" refused", fullpath.display());
        client
            .send_404("The file you requested could not be found")
            .await;
        return;
    }
    if !metadata.is_some_and(|m| m.is_file()) {
        warn!(
            "found requested file but there is no handler for it: {}",
            fullpath.display()
        );
        client
            .send_404("The file you requested could not be found")
            .await;
        return;
    }

    core.stats.increment(None, "file_connections", 1);
    spawn_or_drop(core, client, Some(FbInfo::new(path))).await;
}

async fn spawn_or_drop(core: &Arc<Core>, client: Client, finfo: Option<FbInfo>) {
    match setup_client(core, client, finfo).await {
        Ok(session) => spawn_session(core.clone(), session),
        Err(SetupFailure::Handled) => {}
        Err(SetupFailure::Invalid(client)) => {
            // unsatisfiable request; cut the connection
            client.control.set_error();
            drop(client);
        }
    }
}

pub fn spawn_session(core: Arc<Core>, session: Session) {
    tokio::spawn(run_session(core, session));
}

/// Drive one listener until it terminates or moves to a live source.
async fn run_session(core: Arc<Core>, mut session: Session) {
    loop {
        tokio::time::sleep_until(session.client.schedule).await;
        match session.process(&core).await {
            ServeAction::Continue => {}
            ServeAction::Move => {
                let Some(old_fh) = session.fh.take() else {
                    core.shards.leave(session.shard);
                    release_session(&core, session).await;
                    return;
                };
                session.client.drain_queue();
                let finfo = FbInfo {
                    mount: old_fh.fallback().unwrap_or_default(),
                    fallback: Some(old_fh.mount.clone()),
                    flags: old_fh.flags.key_bits() | FhFlags::OVERRIDE,
                    limit: old_fh.limit,
                    ftype: old_fh.ftype,
                };
                let Session { client, shard, .. } = session;
                let client_id = client.control.id;
                core.shards.leave(shard);
                match relocate::move_listener(&core, client, finfo).await {
                    MoveOutcome::Done => {
                        core.fh_cache
                            .release(core.stats.as_ref(), &old_fh, client_id);
                        return;
                    }
                    MoveOutcome::File(next) => {
                        core.fh_cache
                            .release(core.stats.as_ref(), &old_fh, client_id);
                        session = next;
                    }
                    MoveOutcome::Failed(client) => {
                        warn!("move failed, terminating listener on {}", old_fh.mount);
                        let session = Session {
                            client,
                            fh: Some(old_fh),
                            shard,
                        };
                        release_session(&core, session).await;
                        return;
                    }
                }
            }
            ServeAction::Terminate => {
                core.shards.leave(session.shard);
                release_session(&core, session).await;
                return;
            }
        }
    }
}

/// Detach from the handle and hand the client back to the auth layer for
/// release accounting.
pub async fn release_session(core: &Arc<Core>, mut session: Session) {
    if let Some(fh) = session.fh.take() {
        if fh.is_fallback() {
            core.stats.increment(None, "listeners", -1);
        }
        core.fh_cache
            .release(core.stats.as_ref(), &fh, session.client.control.id);
    }
    let mut client = session.client;
    client.drain_queue();
    let mount = client.request.path.clone();
    let mountinfo = core.find_mount(&mount);
    if client.flags.contains(ClientFlags::AUTHENTICATED)
        && let Some(mount) = &mountinfo
        && mount.config.access_log.is_some()
        && !client.flags.contains(ClientFlags::SKIP_ACCESSLOG)
    {
        info!(
            target: "access",
            mount = %mount.name,
            id = client.control.id,
            sent = client.sent_bytes,
            "listener disconnected"
        );
    }
    auth::pipeline::release_listener(core, client, &mount, mountinfo).await;
    core.reduce_global_sampling();
}

fn playlist_uri(path: &str) -> &str {
    path.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(path)
}

/// Build an M3U body pointing at the stream this playlist names.
fn synthesize_m3u(core: &Arc<Core>, client: &Client, path: &str) -> Vec<u8> {
    let sourceuri = playlist_uri(path);
    let args = client
        .request
        .query
        .as_deref()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    // some players rewrite their transport from the scheme alone
    let protocol = match client.request.header("user-agent") {
        Some(agent) if agent.contains("QTS") || agent.contains("QuickTime") => "icy",
        _ => "http",
    };
    // a host header without a port is as good as no host header
    let host = client
        .request
        .header("host")
        .filter(|h| h.contains(':'))
        .map(str::to_string);
    let credentials = match (&client.username, &client.password) {
        (Some(user), Some(pass)) => format!("{user}:{pass}@"),
        _ => String::new(),
    };
    let authority = match host {
        Some(host) => host,
        None => {
            let config = core.config();
            format!("{}:{}", config.hostname, config.port)
        }
    };
    format!(
        "HTTP/1.0 200 OK\r\nContent-Type: audio/x-mpegurl\r\n\r\n{protocol}://{credentials}{authority}{sourceuri}{args}\r\n"
    )
    .into_bytes()
}

fn synthesize_xspf(core: &Arc<Core>, path: &str) -> Vec<u8> {
    let sourceuri = playlist_uri(path);
    let config = core.config();
    let location = format!("http://{}:{}{}", config.hostname, config.port, sourceuri);
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<playlist version=\"1\" xmlns=\"http://xspf.org/ns/0/\">\n  <trackList>\n    <track><location>{location}</location></track>\n  </trackList>\n</playlist>\n"
    );
    format!(
        "HTTP/1.0 200 OK\r\nContent-Type: application/xspf+xml\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Flag a listener for disconnection by connection id.
pub fn kill_client(core: &Core, mount: &str, id: u64) -> serde_json::Value {
    let killed = core.fh_cache.kill_client(mount, id);
    json!({
        "message": if killed {
            format!("Client {id} removed")
        } else {
            format!("Client {id} not found")
        },
        "return": if killed { 1 } else { 0 },
    })
}

/// Admin listing of the listeners on a mount's handles.
pub fn list_clients(core: &Core, mount: &str) -> Option<serde_json::Value> {
    let listeners = core.fh_cache.list_clients(mount);
    if listeners.is_empty() {
        return None;
    }
    let entries: Vec<serde_json::Value> = listeners
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "ip": c.ip,
                "connected": unix_now().saturating_sub(c.con_time),
                "username": c.username(),
            })
        })
        .collect();
    Some(json!({
        "mount": mount,
        "listeners": entries.len(),
        "clients": entries,
    }))
}
