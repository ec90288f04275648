//! External-program back-end.
//!
//! The configured program is run per event with the listener's details on
//! stdin, one `key: value` per line; exit status 0 grants admission.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use wavecast_config::AuthBlock;

use crate::auth::backend::{AuthBackend, AuthDecision, ThreadData};
use crate::auth::instance::AuthRequest;
use crate::client::ClientFlags;
use crate::error::{CoreError, Result};

#[derive(Debug)]
pub struct CommandAuth {
    listener_add: Option<String>,
    listener_remove: Option<String>,
}

impl CommandAuth {
    pub fn from_block(block: &AuthBlock) -> Result<CommandAuth> {
        let listener_add = block.option("listener_add").map(str::to_string);
        let listener_remove = block.option("listener_remove").map(str::to_string);
        if listener_add.is_none() && listener_remove.is_none() {
            return Err(CoreError::Auth(
                "command auth requires listener_add or listener_remove".to_string(),
            ));
        }
        Ok(CommandAuth {
            listener_add,
            listener_remove,
        })
    }

    async fn run(&self, program: &str, req: &AuthRequest) -> bool {
        let mut child = match tokio::process::Command::new(program)
            .arg(&req.mount)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!("failed to spawn auth command {program}: {err}");
                return false;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            let mut details = format!("mount: {}\nserver: {}\n", req.mount, req.hostname);
            if let Some(client) = &req.client {
                if let Some(user) = &client.username {
                    details.push_str(&format!("user: {user}\n"));
                }
                if let Some(pass) = &client.password {
                    details.push_str(&format!("pass: {pass}\n"));
                }
                if let Some(ip) = &client.control.ip {
                    details.push_str(&format!("ip: {ip}\n"));
                }
            }
            details.push('\n');
            let _ = stdin.write_all(details.as_bytes()).await;
        }
        match child.wait().await {
            Ok(status) => status.success(),
            Err(err) => {
                warn!("auth command {program} did not finish: {err}");
                false
            }
        }
    }
}

#[async_trait]
impl AuthBackend for CommandAuth {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn can_authenticate(&self) -> bool {
        self.listener_add.is_some()
    }

    fn has_release_listener(&self) -> bool {
        self.listener_remove.is_some()
    }

    async fn authenticate(
        &self,
        req: &mut AuthRequest,
        _data: Option<&mut ThreadData>,
    ) -> AuthDecision {
        let Some(program) = self.listener_add.clone() else {
            return AuthDecision::Denied;
        };
        if self.run(&program, req).await {
            if let Some(client) = req.client.as_mut() {
                client.flags.insert(ClientFlags::AUTHENTICATED);
            }
            AuthDecision::Granted
        } else {
            debug!("listener denied by command for {}", req.mount);
            AuthDecision::Denied
        }
    }

    async fn release_listener(&self, req: &mut AuthRequest, _data: Option<&mut ThreadData>) {
        if let Some(program) = self.listener_remove.clone() {
            let _ = self.run(&program, req).await;
        }
    }
}
