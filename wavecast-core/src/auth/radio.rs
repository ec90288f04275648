//! Fixed-credential back-end for relay/radio setups: one shared account
//! admits listeners, with stream lifecycle events logged for the operator.

use async_trait::async_trait;
use tracing::{debug, info};

use wavecast_config::AuthBlock;

use crate::auth::backend::{AuthBackend, AuthDecision, ThreadData};
use crate::auth::instance::AuthRequest;
use crate::client::ClientFlags;
use crate::error::{CoreError, Result};

#[derive(Debug)]
pub struct RadioAuth {
    username: String,
    password: String,
}

impl RadioAuth {
    pub fn from_block(block: &AuthBlock) -> Result<RadioAuth> {
        let username = block
            .option("username")
            .ok_or_else(|| CoreError::Auth("radio auth requires a username".to_string()))?;
        let password = block
            .option("password")
            .ok_or_else(|| CoreError::Auth("radio auth requires a password".to_string()))?;
        Ok(RadioAuth {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[async_trait]
impl AuthBackend for RadioAuth {
    fn kind(&self) -> &'static str {
        "radio"
    }

    fn can_authenticate(&self) -> bool {
        true
    }

    fn has_stream_start(&self) -> bool {
        true
    }

    fn has_stream_end(&self) -> bool {
        true
    }

    async fn authenticate(
        &self,
        req: &mut AuthRequest,
        _data: Option<&mut ThreadData>,
    ) -> AuthDecision {
        let Some(client) = req.client.as_mut() else {
            return AuthDecision::Denied;
        };
        let matched = client.username.as_deref() == Some(self.username.as_str())
            && client.password.as_deref() == Some(self.password.as_str());
        if matched {
            client.flags.insert(ClientFlags::AUTHENTICATED);
            AuthDecision::Granted
        } else {
            debug!("radio credentials rejected on {}", req.mount);
            AuthDecision::Denied
        }
    }

    async fn stream_start(&self, req: &mut AuthRequest, _data: Option<&mut ThreadData>) {
        info!("stream started on {}", req.mount);
    }

    async fn stream_end(&self, req: &mut AuthRequest, _data: Option<&mut ThreadData>) {
        info!("stream ended on {}", req.mount);
    }
}
