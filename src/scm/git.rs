use axum::http::Method;

use crate::config::Config;
use crate::extras::OperationExtras;
use crate::scm::{Action, RequestMeta};

/// Path suffixes that mark a request as Git smart HTTP.
const PROTOCOL_MARKERS: [&str; 3] = ["/info/refs", "/git-upload-pack", "/git-receive-pack"];
const LFS_MARKER: &str = "/info/lfs/";

/// Splits a Git protocol path into `(repository, protocol remainder)`.
/// Returns `None` for paths that are not Git smart HTTP or LFS.
pub fn split_protocol_path(path: &str) -> Option<(&str, &str)> {
    for marker in PROTOCOL_MARKERS {
        if let Some(repo) = path.strip_suffix(marker) {
            let repo = repo.trim_start_matches('/');
            if !repo.is_empty() {
                return Some((repo, &marker[1..]));
            }
        }
    }
    if let Some(pos) = path.find(LFS_MARKER) {
        let repo = path[..pos].trim_start_matches('/');
        if !repo.is_empty() {
            return Some((repo, &path[pos + 1..]));
        }
    }
    None
}

/// Repository name addressed by a Git protocol URL. Bare-style `.git`
/// suffixes are stripped, matching what LFS clients send.
pub fn repo_name(path: &str) -> Option<String> {
    let (repo, _) = split_protocol_path(path)?;
    Some(repo.strip_suffix(".git").unwrap_or(repo).to_owned())
}

/// The LFS sub-operation, if this is an LFS route: the part of the path
/// after `/info/lfs/`.
fn lfs_operation(path: &str) -> Option<&str> {
    path.find(LFS_MARKER)
        .map(|pos| &path[pos + LFS_MARKER.len()..])
}

/// LFS routes get their own classification:
///
/// * `objects/batch` via POST only hands out transfer instructions, so it
///   counts as a pull; the actual transfer is a separate request.
/// * `verify` is a pull.
/// * anything else is an object id: GET downloads (pull), everything else
///   uploads (push).
///
/// Unknown LFS sub-operations default to push.
fn lfs_action(operation: &str, method: &Method) -> Action {
    if operation == "verify" {
        return Action::Pull;
    }
    if operation == "objects/batch" {
        if method == Method::POST {
            return Action::Pull;
        }
    } else if !operation.is_empty() {
        return if method == Method::GET {
            Action::Pull
        } else {
            Action::Push
        };
    }
    Action::Push
}

/// Maps a Git smart HTTP request to a pull or push. Unknown non-LFS paths
/// default to pull.
pub fn action(meta: &RequestMeta) -> Action {
    if meta.path.ends_with("/info/refs") {
        return match meta.query_param("service").as_deref() {
            Some("git-receive-pack") => Action::Push,
            Some("git-upload-pack") => Action::Pull,
            _ => Action::Pull,
        };
    }
    if let Some(operation) = lfs_operation(meta.path) {
        return lfs_action(operation, meta.method);
    }
    if meta.path.ends_with("/git-receive-pack") {
        return Action::Push;
    }
    if meta.path.ends_with("/git-upload-pack") {
        return Action::Pull;
    }
    Action::Pull
}

/// Backend settings forwarded to the execution service alongside the extras.
pub fn create_config(extras: &mut OperationExtras, config: &Config, scheme: &str) {
    extras.set("git_update_server_info", config.git_update_server_info);
    extras.set("git_lfs_enabled", config.git_lfs_enabled);
    if let Some(store) = &config.git_lfs_store {
        extras.set("git_lfs_store_path", store.display().to_string());
    }
    extras.set("git_lfs_http_scheme", scheme);
}

#[cfg(test)]
mod test {
    use axum::http::{HeaderMap, Method};
    use pretty_assertions::assert_eq;

    use super::*;

    fn classify(method: Method, path: &str, query: &str) -> Action {
        let headers = HeaderMap::new();
        action(&RequestMeta {
            method: &method,
            path,
            query,
            headers: &headers,
        })
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name("/teams/alpha/info/refs").as_deref(), Some("teams/alpha"));
        assert_eq!(repo_name("/alpha.git/info/lfs/objects/batch").as_deref(), Some("alpha"));
        assert_eq!(repo_name("/alpha/git-receive-pack").as_deref(), Some("alpha"));
        assert_eq!(repo_name("/alpha/branches"), None);
    }

    #[test]
    fn test_info_refs_service() {
        assert_eq!(
            classify(Method::GET, "/r/info/refs", "service=git-receive-pack"),
            Action::Push
        );
        assert_eq!(
            classify(Method::GET, "/r/info/refs", "service=git-upload-pack"),
            Action::Pull
        );
        // Unknown service falls open to read.
        assert_eq!(classify(Method::GET, "/r/info/refs", "service=bogus"), Action::Pull);
        assert_eq!(classify(Method::GET, "/r/info/refs", ""), Action::Pull);
    }

    #[test]
    fn test_direct_pack_paths() {
        assert_eq!(classify(Method::POST, "/r/git-receive-pack", ""), Action::Push);
        assert_eq!(classify(Method::POST, "/r/git-upload-pack", ""), Action::Pull);
        assert_eq!(classify(Method::GET, "/r/anything", ""), Action::Pull);
    }

    #[test]
    fn test_lfs_objects() {
        let oid = "/r/info/lfs/deadbeefcafe";
        assert_eq!(classify(Method::GET, oid, ""), Action::Pull);
        assert_eq!(classify(Method::PUT, oid, ""), Action::Push);
        assert_eq!(classify(Method::POST, "/r/info/lfs/objects/batch", ""), Action::Pull);
        // Batch reached with any other verb is not a known read.
        assert_eq!(classify(Method::GET, "/r/info/lfs/objects/batch", ""), Action::Push);
        assert_eq!(classify(Method::POST, "/r/info/lfs/verify", ""), Action::Pull);
        // Unknown LFS sub-operations fall closed to push.
        assert_eq!(classify(Method::GET, "/r/info/lfs/", ""), Action::Push);
    }
}
