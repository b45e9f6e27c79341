use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::scm::{Action, Vcs};

/// Permission tiers, lowest to highest. Pull needs at least `Read`,
/// push at least `Write`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    #[default]
    None,
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    pub fn allows(self, action: Action) -> bool {
        match action {
            Action::Pull => self >= Self::Read,
            Action::Push => self >= Self::Write,
        }
    }
}

fn default_true() -> bool {
    true
}

/// An account known to the directory. `allowed_ips` is a list of addresses
/// or CIDR ranges; an empty list means no IP restriction.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// A hosted repository and its access control list.
#[derive(Debug, Clone, Deserialize)]
pub struct Repo {
    pub name: String,
    pub vcs: Vcs,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub permissions: HashMap<String, PermissionLevel>,
}

/// An open pull request whose merge result is materialized as a shadow
/// repository under `<target>/pull-request/<id>/repository`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    pub target: String,
}

/// A repository-scoped UI/config setting forwarded into generated
/// Mercurial configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UiSetting {
    pub section: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// The external store the gateway consults: users, repositories, ACLs and
/// pull requests. Permission computation itself is a black box behind
/// [`Directory::permission`]; this implementation reads a static file, but
/// the gateway never assumes more than the methods below.
#[derive(Debug, Default, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub repositories: Vec<Repo>,
    #[serde(default)]
    pub pull_requests: Vec<PullRequest>,
    #[serde(default)]
    pub ui: Vec<UiSetting>,

    #[serde(skip)]
    invalidations: Mutex<Vec<String>>,
    #[serde(skip)]
    key_accesses: Mutex<Vec<u64>>,
}

impl Directory {
    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Interactive credential check. Inactive users can never authenticate.
    pub fn authenticate(&self, name: &str, password: &str) -> bool {
        self.user(name)
            .filter(|user| user.active)
            .and_then(|user| user.password.as_deref())
            .map(|stored| stored == password)
            .unwrap_or(false)
    }

    pub fn repository(&self, name: &str) -> Option<&Repo> {
        self.repositories.iter().find(|r| r.name == name)
    }

    pub fn repository_by_id(&self, id: u64) -> Option<&Repo> {
        self.repositories.iter().find(|r| r.id == Some(id))
    }

    /// The permission a user holds on a repository.
    pub fn permission(&self, user: &str, repo_name: &str) -> PermissionLevel {
        self.repository(repo_name)
            .and_then(|repo| repo.permissions.get(user))
            .copied()
            .unwrap_or_default()
    }

    /// Full permission map for a user, as handed to the SSH tunnel backends.
    pub fn permissions_for(&self, user: &str) -> HashMap<String, PermissionLevel> {
        self.repositories
            .iter()
            .filter_map(|repo| {
                repo.permissions
                    .get(user)
                    .map(|level| (repo.name.clone(), *level))
            })
            .collect()
    }

    /// Checks the caller's address against the user's allowed ranges.
    pub fn ip_allowed(&self, user: &str, ip: IpAddr) -> bool {
        let Some(user) = self.user(user) else {
            return false;
        };
        if user.allowed_ips.is_empty() {
            return true;
        }
        user.allowed_ips.iter().any(|range| ip_in_range(range, ip))
    }

    pub fn pull_request(&self, id: u64) -> Option<&PullRequest> {
        self.pull_requests.iter().find(|pr| pr.id == id)
    }

    pub fn ui_settings(&self, section: &str) -> impl Iterator<Item = &UiSetting> {
        let section = section.to_owned();
        self.ui
            .iter()
            .filter(move |s| s.active && s.section == section)
    }

    /// Marks a repository's cache namespace for invalidation on next access.
    pub fn mark_for_invalidation(&self, repo_name: &str) {
        tracing::debug!("marking `{repo_name}` for cache invalidation");
        self.invalidations
            .lock()
            .expect("invalidation lock")
            .push(repo_name.to_owned());
    }

    pub fn invalidations(&self) -> Vec<String> {
        self.invalidations.lock().expect("invalidation lock").clone()
    }

    /// Records that an SSH key was used, mirroring last-access bookkeeping.
    pub fn record_key_access(&self, key_id: u64) {
        self.key_accesses.lock().expect("key access lock").push(key_id);
    }
}

/// True if `ip` falls within `range`, where a range is either a literal
/// address or `addr/prefix-len` in CIDR notation.
fn ip_in_range(range: &str, ip: IpAddr) -> bool {
    match range.split_once('/') {
        None => range.parse::<IpAddr>().map(|r| r == ip).unwrap_or(false),
        Some((addr, len)) => {
            let (Ok(net), Ok(len)) = (addr.parse::<IpAddr>(), len.parse::<u32>()) else {
                return false;
            };
            let (net_octets, ip_octets) = match (net, ip) {
                (IpAddr::V4(n), IpAddr::V4(i)) => (n.octets().to_vec(), i.octets().to_vec()),
                (IpAddr::V6(n), IpAddr::V6(i)) => (n.octets().to_vec(), i.octets().to_vec()),
                _ => return false,
            };
            let bits = (net_octets.len() * 8) as u32;
            let len = len.min(bits);

            let full_bytes = (len / 8) as usize;
            if net_octets[..full_bytes] != ip_octets[..full_bytes] {
                return false;
            }
            let rem = len % 8;
            if rem == 0 {
                return true;
            }
            let mask = !0u8 << (8 - rem);
            net_octets[full_bytes] & mask == ip_octets[full_bytes] & mask
        }
    }
}
