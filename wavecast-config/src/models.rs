//! Serde models for the server configuration file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Hostname advertised in generated playlists.
    pub hostname: String,
    pub port: u16,
    /// Bind address for the listener socket; defaults to all interfaces.
    pub bind_address: String,
    /// Root for on-demand file serving.
    pub document_root: PathBuf,
    /// Root for admin-flagged file lookups.
    pub admin_root: PathBuf,
    /// Optional `type ext ext …` mime map; builtin fallbacks apply without it.
    pub mimetypes_file: Option<PathBuf>,
    /// Master switch for on-demand file serving.
    pub fileserve: bool,
    /// Server-wide outgoing bandwidth ceiling in kbit/s; 0 = unlimited.
    pub max_bandwidth_kbps: u64,
    /// Password accepted for source clients when a mount sets none.
    pub source_password: Option<String>,
    pub mounts: HashMap<String, MountConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hostname: "localhost".to_string(),
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            document_root: PathBuf::from("webroot"),
            admin_root: PathBuf::from("admin"),
            mimetypes_file: None,
            fileserve: true,
            max_bandwidth_kbps: 0,
            source_password: None,
            mounts: HashMap::new(),
        }
    }
}

/// Per-mount admission and serving policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    pub password: Option<String>,
    pub username: Option<String>,
    pub fallback_mount: Option<String>,
    /// When false, range requests on matching files are ignored.
    pub file_seekable: bool,
    /// SO_SNDBUF override in bytes; 0 leaves the OS default.
    pub so_sndbuf: u32,
    /// Mount exists in config but must never be served.
    pub no_mount: bool,
    /// Absolute URL prefix; listeners get a 302 to `redirect + mount`.
    pub redirect: Option<String>,
    /// Seconds to ban a connecting IP for; negative lifts an existing ban.
    pub ban_client: i64,
    /// −1 = unlimited, 0 = closed.
    pub max_listeners: i64,
    pub skip_accesslog: bool,
    /// Serving rate cap in kbit/s for fallback file streaming; 0 = none.
    pub limit_rate_kbps: u32,
    pub access_log: Option<String>,
    pub auth: Option<AuthBlock>,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            password: None,
            username: None,
            fallback_mount: None,
            file_seekable: true,
            so_sndbuf: 0,
            no_mount: false,
            redirect: None,
            ban_client: 0,
            max_listeners: -1,
            skip_accesslog: false,
            limit_rate_kbps: 0,
            access_log: None,
            auth: None,
        }
    }
}

/// An authenticator declaration: a type tag plus free-form name/value
/// options, interpreted by the selected back-end.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Vec<AuthOption>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthOption {
    pub name: String,
    pub value: String,
}

impl AuthBlock {
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let mount = MountConfig::default();
        assert_eq!(mount.max_listeners, -1);
        assert!(mount.file_seekable);
        assert!(!mount.no_mount);
    }

    #[test]
    fn auth_block_option_lookup() {
        let block = AuthBlock {
            kind: "htpasswd".to_string(),
            options: vec![
                AuthOption {
                    name: "filename".to_string(),
                    value: "/tmp/users".to_string(),
                },
                AuthOption {
                    name: "realm".to_string(),
                    value: "members".to_string(),
                },
            ],
        };
        assert_eq!(block.option("realm"), Some("members"));
        assert_eq!(block.option("handlers"), None);
    }
}
