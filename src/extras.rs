use std::collections::BTreeMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::access::PermissionLevel;
use crate::scm::{Action, Vcs};

/// Everything the spawned VCS process and its hooks need to know about the
/// operation that triggered them. Built once per request, read-only once
/// handed to the sub-application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationExtras {
    pub ip: String,
    pub username: String,
    pub action: String,
    pub repository: String,
    pub scm: Option<Vcs>,
    pub server_url: Option<String>,
    pub check_locking: bool,
    pub is_shadow_repo: bool,
    pub ssh: bool,
    /// Snapshot of the caller's permission on the repository, for hooks that
    /// re-validate mid-protocol.
    pub permission: Option<PermissionLevel>,
    /// Address of the per-request callback daemon, `host:port`.
    pub hooks_uri: Option<String>,
    /// Backend-specific settings (LFS store, SVN upstream, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl OperationExtras {
    /// Environment variable carrying the serialized extras into spawned
    /// VCS processes.
    pub const ENV_VAR: &'static str = "VCS_GATEWAY_EXTRAS";

    pub fn new(ip: String, username: String, action: Action, repository: String, scm: Vcs) -> Self {
        Self {
            ip,
            username,
            action: action.as_str().to_owned(),
            repository,
            scm: Some(scm),
            check_locking: true,
            ..Self::default()
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.settings.insert(key.to_owned(), value.into());
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("extras are always serializable")
    }

    /// URL-safe base64 of the JSON form, used when smuggling the extras
    /// through headers or SVN revision properties.
    pub fn encoded(&self) -> String {
        base64::engine::general_purpose::URL_SAFE.encode(self.to_json_string().as_bytes())
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE.decode(encoded).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Port of the callback daemon, if one was attached.
    pub fn hooks_port(&self) -> Option<u16> {
        self.hooks_uri
            .as_ref()
            .and_then(|uri| uri.rsplit(':').next())
            .and_then(|port| port.parse().ok())
    }
}
