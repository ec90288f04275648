//! HTTP-callback back-end.
//!
//! Each configured event POSTs a form to an operator-run endpoint; the
//! endpoint grants a listener by answering with `wavecast-auth-user: 1`.
//! Every worker keeps its own HTTP client as thread data, so slow endpoints
//! only stall the worker that is talking to them.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use wavecast_config::AuthBlock;

use crate::auth::backend::{AuthBackend, AuthDecision, ThreadData};
use crate::auth::instance::AuthRequest;
use crate::client::{ClientFlags, unix_now};
use crate::error::Result;

const AUTH_HEADER: &str = "wavecast-auth-user";
const TIMELIMIT_HEADER: &str = "wavecast-auth-timelimit";

#[derive(Debug)]
pub struct UrlAuth {
    listener_add: Option<String>,
    listener_remove: Option<String>,
    stream_auth: Option<String>,
    stream_start: Option<String>,
    stream_end: Option<String>,
    timeout: Duration,
}

impl UrlAuth {
    pub fn from_block(block: &AuthBlock) -> Result<UrlAuth> {
        let timeout = block
            .option("timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);
        Ok(UrlAuth {
            listener_add: block.option("listener_add").map(str::to_string),
            listener_remove: block.option("listener_remove").map(str::to_string),
            stream_auth: block.option("stream_auth").map(str::to_string),
            stream_start: block.option("stream_start").map(str::to_string),
            stream_end: block.option("stream_end").map(str::to_string),
            timeout: Duration::from_secs(timeout),
        })
    }

    fn http_client<'a>(&self, data: Option<&'a mut ThreadData>) -> Option<&'a reqwest::Client> {
        data.and_then(|d| d.downcast_ref::<reqwest::Client>())
    }

    async fn post(
        &self,
        data: Option<&mut ThreadData>,
        url: &str,
        form: &[(&str, String)],
    ) -> Option<reqwest::Response> {
        let client = self.http_client(data)?;
        match client.post(url).form(form).send().await {
            Ok(response) => Some(response),
            Err(err) => {
                warn!("auth callback {url} failed: {err}");
                None
            }
        }
    }

    fn base_form(req: &AuthRequest, action: &str) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("action", action.to_string()),
            ("mount", req.mount.clone()),
            ("server", req.hostname.clone()),
            ("port", req.port.to_string()),
        ];
        if let Some(client) = &req.client {
            form.push(("client", client.control.id.to_string()));
            if let Some(ip) = &client.control.ip {
                form.push(("ip", ip.clone()));
            }
            if let Some(user) = &client.username {
                form.push(("user", user.clone()));
            }
            if let Some(pass) = &client.password {
                form.push(("pass", pass.clone()));
            }
            if let Some(agent) = client.request.header("user-agent") {
                form.push(("agent", agent.to_string()));
            }
        }
        form
    }
}

#[async_trait]
impl AuthBackend for UrlAuth {
    fn kind(&self) -> &'static str {
        "url"
    }

    fn can_authenticate(&self) -> bool {
        self.listener_add.is_some()
    }

    fn has_release_listener(&self) -> bool {
        self.listener_remove.is_some()
    }

    fn has_stream_auth(&self) -> bool {
        self.stream_auth.is_some()
    }

    fn has_stream_start(&self) -> bool {
        self.stream_start.is_some()
    }

    fn has_stream_end(&self) -> bool {
        self.stream_end.is_some()
    }

    async fn authenticate(
        &self,
        req: &mut AuthRequest,
        data: Option<&mut ThreadData>,
    ) -> AuthDecision {
        let Some(url) = self.listener_add.clone() else {
            return AuthDecision::Denied;
        };
        let form = Self::base_form(req, "listener_add");
        let Some(response) = self.post(data, &url, &form).await else {
            return AuthDecision::Denied;
        };
        let granted = response
            .headers()
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "1");
        let timelimit = response
            .headers()
            .get(TIMELIMIT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let Some(client) = req.client.as_mut() else {
            return AuthDecision::Denied;
        };
        if granted {
            client.flags.insert(ClientFlags::AUTHENTICATED);
            if let Some(secs) = timelimit {
                client.control.set_discon_time(unix_now() + secs);
            }
            AuthDecision::Granted
        } else {
            debug!("listener denied by {url} for {}", req.mount);
            AuthDecision::Denied
        }
    }

    async fn release_listener(&self, req: &mut AuthRequest, data: Option<&mut ThreadData>) {
        if let Some(url) = self.listener_remove.clone() {
            let form = Self::base_form(req, "listener_remove");
            let _ = self.post(data, &url, &form).await;
        }
    }

    async fn stream_auth(&self, req: &mut AuthRequest, data: Option<&mut ThreadData>) {
        let Some(url) = self.stream_auth.clone() else {
            return;
        };
        let form = Self::base_form(req, "stream_auth");
        let Some(response) = self.post(data, &url, &form).await else {
            return;
        };
        let granted = response
            .headers()
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "1");
        if granted && let Some(client) = req.client.as_mut() {
            client.flags.insert(ClientFlags::AUTHENTICATED);
        }
    }

    async fn stream_start(&self, req: &mut AuthRequest, data: Option<&mut ThreadData>) {
        if let Some(url) = self.stream_start.clone() {
            let form = Self::base_form(req, "mount_add");
            let _ = self.post(data, &url, &form).await;
        }
    }

    async fn stream_end(&self, req: &mut AuthRequest, data: Option<&mut ThreadData>) {
        if let Some(url) = self.stream_end.clone() {
            let form = Self::base_form(req, "mount_remove");
            let _ = self.post(data, &url, &form).await;
        }
    }

    fn alloc_thread_data(&self) -> Option<ThreadData> {
        match reqwest::Client::builder().timeout(self.timeout).build() {
            Ok(client) => Some(Box::new(client)),
            Err(err) => {
                warn!("unable to build http client for auth callbacks: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_config::AuthOption;

    fn block(options: &[(&str, &str)]) -> AuthBlock {
        AuthBlock {
            kind: "url".to_string(),
            options: options
                .iter()
                .map(|(n, v)| AuthOption {
                    name: n.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn capabilities_follow_configured_urls() {
        let auth = UrlAuth::from_block(&block(&[
            ("listener_add", "http://auth.example/add"),
            ("stream_start", "http://auth.example/start"),
        ]))
        .expect("build");
        assert!(auth.can_authenticate());
        assert!(auth.has_stream_start());
        assert!(!auth.has_release_listener());
        assert!(!auth.has_stream_end());
    }

    #[test]
    fn thread_data_is_an_http_client() {
        let auth = UrlAuth::from_block(&block(&[("listener_add", "http://x/")])).expect("build");
        let data = auth.alloc_thread_data().expect("client");
        assert!(data.downcast_ref::<reqwest::Client>().is_some());
    }
}
