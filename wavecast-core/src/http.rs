//! The slice of HTTP the core consumes and emits.
//!
//! Requests are parsed upstream (the server binary owns the wire parsing);
//! the core works on this pre-chewed view. Responses are rendered to raw
//! bytes because listener sockets are driven directly by the serving engine.

use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Source,
    Put,
    Stats,
    Other,
}

impl Method {
    pub fn parse(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "SOURCE" => Method::Source,
            "PUT" => Method::Put,
            "STATS" => Method::Stats,
            _ => Method::Other,
        }
    }
}

/// A parsed request as handed to the core by the connection layer.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request path, percent-decoded and normalised, no query string.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Request {
        Request {
            method,
            path: path.into(),
            query: None,
            headers: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Request {
        self.query = Some(query.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Request {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Drop a header, eg range removal for unseekable mounts.
    pub fn remove_header(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.query.as_deref()?;
        for pair in query.split('&') {
            let mut it = pair.splitn(2, '=');
            if it.next() == Some(name) {
                return Some(it.next().unwrap_or(""));
            }
        }
        None
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next()?;
        let (_, ext) = name.rsplit_once('.')?;
        if ext.is_empty() { None } else { Some(ext) }
    }
}

/// Pull user/pass out of an `Authorization: Basic` header value.
pub fn basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let userpass = String::from_utf8(decoded).ok()?;
    let (user, pass) = userpass.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Parse a `bytes=N-` range against a known content length.
///
/// Only the open-ended prefix form is handled; anything else, or an offset
/// at or past the end of the file, fails the attach.
pub fn parse_range(header: &str, content_length: u64) -> Option<u64> {
    let rest = header
        .get(..6)
        .filter(|p| p.eq_ignore_ascii_case("bytes="))
        .map(|_| &header[6..])?;
    let digits = rest.split('-').next()?;
    let start: u64 = digits.parse().ok()?;
    if start < content_length {
        Some(start)
    } else {
        None
    }
}

fn http_date() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

pub fn response_200(content_type: &str, content_length: Option<u64>) -> Vec<u8> {
    match content_length {
        Some(len) => format!(
            "HTTP/1.0 200 OK\r\nAccept-Ranges: bytes\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\r\n"
        ),
        None => format!("HTTP/1.0 200 OK\r\nContent-Type: {content_type}\r\n\r\n"),
    }
    .into_bytes()
}

/// 206 framing for a `bytes=N-` request. `start` must be below `total`.
pub fn response_206(content_type: &str, start: u64, total: u64) -> Vec<u8> {
    let remaining = total - start;
    let end = total.saturating_sub(1);
    format!(
        "HTTP/1.1 206 Partial Content\r\nDate: {}\r\nAccept-Ranges: bytes\r\nContent-Length: {remaining}\r\nContent-Range: bytes {start}-{end}/{total}\r\nContent-Type: {content_type}\r\n\r\n",
        http_date()
    )
    .into_bytes()
}

pub fn response_302(location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 302 Found\r\nDate: {}\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n",
        http_date()
    )
    .into_bytes()
}

pub fn response_401(realm: Option<&str>) -> Vec<u8> {
    let realm = realm.unwrap_or("Wavecast");
    format!(
        "HTTP/1.0 401 Unauthorized\r\nDate: {}\r\nWWW-Authenticate: Basic realm=\"{realm}\"\r\nContent-Length: 0\r\n\r\n",
        http_date()
    )
    .into_bytes()
}

/// 403 with an optional alternate-mount hint for clients that follow it.
pub fn response_403(message: &str, redirect: Option<&str>) -> Vec<u8> {
    let mut head = format!("HTTP/1.0 403 Forbidden\r\nDate: {}\r\n", http_date());
    if let Some(mount) = redirect {
        head.push_str(&format!("Location: {mount}\r\n"));
    }
    head.push_str(&format!(
        "Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n{message}",
        message.len()
    ));
    head.into_bytes()
}

pub fn response_404(message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 404 Not Found\r\nDate: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{message}",
        http_date(),
        message.len()
    )
    .into_bytes()
}

pub fn response_400(message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 400 Bad Request\r\nDate: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{message}",
        http_date(),
        message.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_round_trip() {
        let encoded = BASE64.encode("user:pass");
        let header = format!("Basic {encoded}");
        assert_eq!(
            basic_auth(&header),
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn basic_auth_password_may_contain_colon() {
        let encoded = BASE64.encode("user:pa:ss");
        let (user, pass) = basic_auth(&format!("Basic {encoded}")).expect("creds");
        assert_eq!(user, "user");
        assert_eq!(pass, "pa:ss");
    }

    #[test]
    fn basic_auth_rejects_garbage() {
        assert!(basic_auth("Basic !!!").is_none());
        assert!(basic_auth("Digest abc").is_none());
        let encoded = BASE64.encode("nocolon");
        assert!(basic_auth(&format!("Basic {encoded}")).is_none());
    }

    #[test]
    fn range_zero_on_hundred_byte_file() {
        assert_eq!(parse_range("bytes=0-", 100), Some(0));
        let head = String::from_utf8(response_206("audio/mpeg", 0, 100)).unwrap();
        assert!(head.contains("Content-Range: bytes 0-99/100"));
        assert!(head.contains("Content-Length: 100"));
    }

    #[test]
    fn range_at_length_fails() {
        assert_eq!(parse_range("bytes=100-", 100), None);
    }

    #[test]
    fn range_mid_file() {
        assert_eq!(parse_range("bytes=500000-", 1_000_000), Some(500_000));
        let head =
            String::from_utf8(response_206("audio/mpeg", 500_000, 1_000_000)).unwrap();
        assert!(head.contains("Content-Range: bytes 500000-999999/1000000"));
        assert!(head.contains("Content-Length: 500000"));
    }

    #[test]
    fn range_malformed() {
        assert_eq!(parse_range("bytes=-500", 1000), None);
        assert_eq!(parse_range("lines=0-", 1000), None);
        assert_eq!(parse_range("bytes=abc-", 1000), None);
    }

    #[test]
    fn explicit_end_is_treated_as_open_ended() {
        // only the start offset is honoured
        assert_eq!(parse_range("bytes=10-99", 1000), Some(10));
    }

    #[test]
    fn query_params() {
        let req = Request::new(Method::Get, "/admin/streams").with_query("mount=/live&id=4");
        assert_eq!(req.query_param("mount"), Some("/live"));
        assert_eq!(req.query_param("id"), Some("4"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = Request::new(Method::Get, "/stream.mp3");
        req.set_header("Range", "bytes=0-");
        assert_eq!(req.header("range"), Some("bytes=0-"));
        req.remove_header("RANGE");
        assert_eq!(req.header("range"), None);
    }
}
