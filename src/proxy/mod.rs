//! Per-account upstream proxies.
//!
//! An account can carry its own upstream proxy. Chrome is pointed at a local
//! relay holding the upstream credentials, because `--proxy-server` cannot
//! carry them inline.

mod relay;

pub use relay::{allocate_port, auth_header, ProxyRelay};

use serde::{Deserialize, Serialize};

/// Upstream proxy coordinates for one account, as they appear in the
/// account roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    pub url: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxySettings {
    /// Hostname with any scheme prefix stripped. Rosters hold both bare
    /// hosts and full URLs.
    pub fn host(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(parsed) => parsed
                .host_str()
                .map(str::to_string)
                .unwrap_or_else(|| self.url.clone()),
            Err(_) => self.url.clone(),
        }
    }

    /// Upstream address in `host:port` form.
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port)
    }

    /// Whether the upstream needs Basic credentials (and therefore a relay).
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}
