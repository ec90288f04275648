//! Credential-file back-end.
//!
//! Entries are `user:digest` lines where the digest is the lowercase hex
//! SHA-256 of the password. The file is re-read when its mtime moves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use wavecast_config::AuthBlock;

use crate::auth::backend::{AuthBackend, AuthDecision, ThreadData};
use crate::auth::instance::AuthRequest;
use crate::client::ClientFlags;
use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct UserFile {
    mtime: Option<SystemTime>,
    users: HashMap<String, String>,
}

#[derive(Debug)]
pub struct HtpasswdAuth {
    filename: PathBuf,
    state: Mutex<UserFile>,
}

impl HtpasswdAuth {
    pub fn from_block(block: &AuthBlock) -> Result<HtpasswdAuth> {
        let filename = block
            .option("filename")
            .ok_or_else(|| CoreError::Auth("htpasswd auth requires a filename".to_string()))?;
        Ok(HtpasswdAuth {
            filename: PathBuf::from(filename),
            state: Mutex::new(UserFile::default()),
        })
    }

    /// Hex digest used for file entries; exposed so tooling and tests can
    /// generate them.
    pub fn digest(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        let out = hasher.finalize();
        out.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn refresh(&self) {
        let mtime = std::fs::metadata(&self.filename)
            .and_then(|m| m.modified())
            .ok();
        let mut state = self.state.lock();
        if mtime.is_some() && state.mtime == mtime {
            return;
        }
        let contents = match std::fs::read_to_string(&self.filename) {
            Ok(c) => c,
            Err(err) => {
                warn!("unable to read {}: {err}", self.filename.display());
                return;
            }
        };
        let mut users = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, digest)) = line.split_once(':') {
                users.insert(user.to_string(), digest.trim().to_string());
            }
        }
        debug!(
            "loaded {} users from {}",
            users.len(),
            self.filename.display()
        );
        state.mtime = mtime;
        state.users = users;
    }

    fn check(&self, username: &str, password: &str) -> bool {
        self.refresh();
        let state = self.state.lock();
        state
            .users
            .get(username)
            .is_some_and(|digest| *digest == Self::digest(password))
    }
}

#[async_trait]
impl AuthBackend for HtpasswdAuth {
    fn kind(&self) -> &'static str {
        "htpasswd"
    }

    fn can_authenticate(&self) -> bool {
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
        let (Some(user), Some(pass)) = (client.username.clone(), client.password.clone()) else {
            return AuthDecision::Denied;
        };
        if self.check(&user, &pass) {
            client.flags.insert(ClientFlags::AUTHENTICATED);
            AuthDecision::Granted
        } else {
            debug!("failed htpasswd auth for {user} on {}", req.mount);
            AuthDecision::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_config::AuthOption;
    use std::io::Write;

    fn block_for(path: &str) -> AuthBlock {
        AuthBlock {
            kind: "htpasswd".to_string(),
            options: vec![AuthOption {
                name: "filename".to_string(),
                value: path.to_string(),
            }],
        }
    }

    #[test]
    fn missing_filename_is_an_error() {
        let block = AuthBlock {
            kind: "htpasswd".to_string(),
            options: vec![],
        };
        assert!(HtpasswdAuth::from_block(&block).is_err());
    }

    #[test]
    fn accepts_matching_digest() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "# users").unwrap();
        writeln!(file, "user:{}", HtpasswdAuth::digest("pass")).unwrap();
        let auth =
            HtpasswdAuth::from_block(&block_for(&file.path().to_string_lossy())).expect("build");
        assert!(auth.check("user", "pass"));
        assert!(!auth.check("user", "wrong"));
        assert!(!auth.check("ghost", "pass"));
    }
}
