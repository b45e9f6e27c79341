use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::access::{Directory, PermissionLevel};
use crate::scm::Action;

/// Default number of cached permission decisions.
pub const DEFAULT_CACHE_SIZE: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(512) };

/// The underlying permission facts the gate needs. Split out so the cache
/// behaviour can be tested against a counting stub.
pub trait AccessCheck {
    fn ip_allowed(&self, user: &str, ip: IpAddr) -> bool;
    fn permission(&self, user: &str, repo_name: &str) -> PermissionLevel;
}

impl AccessCheck for Directory {
    fn ip_allowed(&self, user: &str, ip: IpAddr) -> bool {
        Directory::ip_allowed(self, user, ip)
    }

    fn permission(&self, user: &str, repo_name: &str) -> PermissionLevel {
        Directory::permission(self, user, repo_name)
    }
}

/// One permission question, fully keyed: the same question within the TTL
/// window must not hit the underlying store twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GateKey {
    pub plugin_id: String,
    pub action: Action,
    pub user: String,
    pub repo_name: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    decided_at: Instant,
    allowed: bool,
    ttl: Duration,
}

/// Permission gate with a short-lived decision cache, keyed by the
/// authenticating plugin's identity.
pub struct Gate {
    cache: Mutex<LruCache<GateKey, Entry>>,
}

impl Gate {
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(size)),
        }
    }

    /// Answers `key` against `source`. When `cache_ttl` is zero, caching is
    /// inactive for this plugin and the check is computed directly.
    pub fn check(&self, source: &dyn AccessCheck, key: &GateKey, cache_ttl: Duration) -> bool {
        if cache_ttl.is_zero() {
            return compute(source, key);
        }

        let mut cache = self.cache.lock().expect("permission cache lock");
        if let Some(entry) = cache.get(key) {
            if entry.decided_at.elapsed() < entry.ttl {
                tracing::debug!(
                    "cached permission for `{}` on `{}`: {}",
                    key.user,
                    key.repo_name,
                    entry.allowed
                );
                return entry.allowed;
            }
        }

        let allowed = compute(source, key);
        cache.put(
            key.clone(),
            Entry {
                decided_at: Instant::now(),
                allowed,
                ttl: cache_ttl,
            },
        );
        allowed
    }
}

/// The uncached decision: the caller's IP must be inside the user's allowed
/// ranges, then the repository permission must cover the action.
fn compute(source: &dyn AccessCheck, key: &GateKey) -> bool {
    if !source.ip_allowed(&key.user, key.ip) {
        tracing::info!("access for IP {} denied for user `{}`", key.ip, key.user);
        return false;
    }
    let level = source.permission(&key.user, &key.repo_name);
    let allowed = level.allows(key.action);
    tracing::debug!(
        "permission for `{}` on `{}`: {:?}, {} {}",
        key.user,
        key.repo_name,
        level,
        key.action,
        if allowed { "allowed" } else { "denied" },
    );
    allowed
}
