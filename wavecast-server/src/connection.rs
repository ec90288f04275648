//! Per-connection ingress: read and parse the request head, build the core
//! client, and hand it to the admission pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use wavecast_core::auth;
use wavecast_core::client::{Client, ClientControl};
use wavecast_core::http::{Method, Request};
use wavecast_core::{Core, auth::SourceCheck};

const MAX_HEAD: usize = 8192;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handle(core: Arc<Core>, stream: TcpStream, peer_ip: String) {
    if core.bans.is_banned(&peer_ip) {
        debug!("refusing banned ip {peer_ip}");
        return;
    }
    // ease off accepting work while auth queues are backed up
    let slowdown = core.slowdown();
    if slowdown > 0 {
        tokio::time::sleep(Duration::from_millis(20 * slowdown as u64)).await;
    }

    let mut stream = stream;
    let head = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut stream)).await {
        Ok(Ok(head)) => head,
        Ok(Err(err)) => {
            debug!("dropping connection from {peer_ip}: {err}");
            return;
        }
        Err(_) => {
            debug!("request head timeout from {peer_ip}");
            return;
        }
    };
    let Some(request) = parse_request(&head) else {
        warn!("unparseable request from {peer_ip}");
        return;
    };
    if request.path.contains("..") {
        warn!("rejecting traversal path from {peer_ip}");
        return;
    }

    let control = Arc::new(ClientControl::new(core.next_client_id(), Some(peer_ip)));
    let client = Client::new(Box::new(stream), request, control);
    route(&core, client).await;
}

async fn route(core: &Arc<Core>, client: Client) {
    let mount = client.request.path.clone();
    match client.request.method {
        Method::Source | Method::Put => match auth::check_source(core, client, &mount) {
            SourceCheck::Queued => {}
            SourceCheck::Accepted(client) => core.sources.startup_source(&mount, client),
            SourceCheck::Denied(client) => {
                client.send_401(None).await;
            }
        },
        _ => {
            auth::add_listener(core, &mount, client).await;
        }
    }
}

/// Read up to the blank line ending the request head.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

fn parse_request(head: &[u8]) -> Option<Request> {
    let mut header_buf = [httparse::EMPTY_HEADER; 48];
    let mut parsed = httparse::Request::new(&mut header_buf);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }
    let method = Method::parse(parsed.method?);
    let target = parsed.path?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let mut request = Request::new(method, path);
    if let Some(query) = query {
        request = request.with_query(query);
    }
    for header in parsed.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            request.set_header(header.name, value);
        }
    }
    Some(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_listener_request() {
        let head = b"GET /stream.mp3?foo=1 HTTP/1.1\r\nHost: radio.example:8000\r\nRange: bytes=0-\r\n\r\n";
        let request = parse_request(head).expect("parse");
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/stream.mp3");
        assert_eq!(request.query.as_deref(), Some("foo=1"));
        assert_eq!(request.header("host"), Some("radio.example:8000"));
        assert_eq!(request.header("range"), Some("bytes=0-"));
    }

    #[test]
    fn rejects_partial_head() {
        assert!(parse_request(b"GET /stream HTTP/1.1\r\nHost: x").is_none());
    }
}
