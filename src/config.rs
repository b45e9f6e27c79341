use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::access::Directory;
use crate::scm::Vcs;

fn default_backends() -> Vec<Vcs> {
    vec![Vcs::Hg, Vcs::Git, Vcs::Svn]
}

fn default_svn_magic_segment() -> String {
    "/!svn".to_owned()
}

fn default_auth_plugin() -> String {
    "gateway.auth-file".to_owned()
}

fn default_anonymous_user() -> String {
    "anonymous".to_owned()
}

fn default_svn_handshake_timeout() -> u64 {
    30
}

fn default_binary(name: &str) -> String {
    name.to_owned()
}

fn default_git_binary() -> String {
    default_binary("git")
}

fn default_hg_binary() -> String {
    default_binary("hg")
}

fn default_svnserve_binary() -> String {
    default_binary("svnserve")
}

/// Gateway settings, loaded from a JSON file. The embedded [`Directory`]
/// stands in for the external user/repository store.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Base path under which all repositories are stored.
    pub repositories_root: PathBuf,

    /// Order in which the protocol sniffers are consulted.
    #[serde(default = "default_backends")]
    pub backends: Vec<Vcs>,

    /// Reject plain-HTTP requests when set.
    #[serde(default)]
    pub require_ssl: bool,

    /// Path segment that marks Subversion protocol URLs.
    #[serde(default = "default_svn_magic_segment")]
    pub svn_magic_segment: String,

    /// Base URL of the VCS execution service handling Git and Mercurial
    /// smart HTTP calls.
    pub vcs_http_server: Option<String>,

    /// Base URL of the `subversion-http-server` reverse-proxy target. When
    /// unset, SVN-over-HTTP is answered with a fixed "not acceptable".
    #[serde(default)]
    pub svn_http_server: Option<String>,

    /// Externally visible URL of this gateway, handed to hooks.
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub git_update_server_info: bool,
    #[serde(default)]
    pub git_lfs_enabled: bool,
    #[serde(default)]
    pub git_lfs_store: Option<PathBuf>,

    /// Identity of the authentication plugin, part of every permission
    /// cache key.
    #[serde(default = "default_auth_plugin")]
    pub auth_plugin: String,

    /// Permission cache TTL in seconds; zero disables caching.
    #[serde(default)]
    pub auth_cache_ttl: u64,

    /// Name of the account anonymous requests run as. Anonymous access is
    /// active when this account exists and is active in the directory.
    #[serde(default = "default_anonymous_user")]
    pub anonymous_user: String,

    /// Trust the `Remote-User` header set by a fronting container/proxy
    /// authenticator.
    #[serde(default)]
    pub trust_proxy_auth: bool,

    /// Seconds to wait for the first `ra_svn` client message on an SSH
    /// tunnel before giving up.
    #[serde(default = "default_svn_handshake_timeout")]
    pub svn_handshake_timeout: u64,

    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    #[serde(default = "default_hg_binary")]
    pub hg_binary: String,
    #[serde(default = "default_svnserve_binary")]
    pub svnserve_binary: String,

    pub directory: Arc<Directory>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|err| ConfigError::Io(path.into(), err))?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_cache_ttl)
    }

    pub fn svn_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.svn_handshake_timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at `{0}`: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
