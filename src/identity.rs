use std::path::{Path, PathBuf};

use crate::access::Directory;

/// The three names a request can resolve to. For ordinary repositories all
/// of them agree; only pull-request shadow repositories diverge: the ACL
/// name is the pull request's target (which owns the permissions) while the
/// storage path points at the ephemeral merge workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoIdentity {
    pub url_name: String,
    pub acl_name: String,
    pub storage_path: PathBuf,
    pub is_shadow: bool,
}

impl RepoIdentity {
    fn plain(base: &Path, url_name: &str) -> Self {
        Self {
            acl_name: url_name.to_owned(),
            storage_path: base.join(url_name),
            url_name: url_name.to_owned(),
            is_shadow: false,
        }
    }
}

/// Matches `<groups...>/<target>/pull-request/<id>/repository` and returns
/// `(acl name, pull request id)`.
fn shadow_parts(url_name: &str) -> Option<(String, u64)> {
    let segments: Vec<&str> = url_name.split('/').collect();
    if segments.len() < 4 {
        return None;
    }
    let [pull_request, id, repository] = segments[segments.len() - 3..] else {
        return None;
    };
    if pull_request != "pull-request" || repository != "repository" {
        return None;
    }
    let id = id.parse().ok()?;
    let acl_name = segments[..segments.len() - 3].join("/");
    if acl_name.is_empty() {
        return None;
    }
    Some((acl_name, id))
}

/// Filesystem location of a pull request's shadow workspace, next to the
/// target repository.
fn shadow_storage_path(base: &Path, target: &str, id: u64) -> PathBuf {
    let (group, name) = match target.rsplit_once('/') {
        Some((group, name)) => (group, name),
        None => ("", target),
    };
    base.join(group).join(format!(".__shadow_{name}_pr-{id}"))
}

/// Resolves the repository identity a URL addresses.
///
/// A URL matching the shadow pattern only resolves to a shadow identity if
/// the referenced pull request exists and its target repository equals the
/// ACL name derived from the URL; otherwise the URL is treated as a plain
/// (likely nonexistent) repository name.
pub fn resolve(directory: &Directory, base: &Path, url_name: &str) -> RepoIdentity {
    if let Some((acl_name, id)) = shadow_parts(url_name) {
        let pull_request = directory.pull_request(id);
        if let Some(pr) = pull_request {
            if pr.target == acl_name {
                let identity = RepoIdentity {
                    url_name: url_name.to_owned(),
                    storage_path: shadow_storage_path(base, &pr.target, id),
                    acl_name,
                    is_shadow: true,
                };
                tracing::debug!("resolved shadow repository: {identity:?}");
                return identity;
            }
            tracing::debug!(
                "pull request {id} targets `{}`, not `{acl_name}`; not a shadow repo",
                pr.target
            );
        }
    }
    RepoIdentity::plain(base, url_name)
}
