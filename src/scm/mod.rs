pub mod git;
pub mod hg;
pub mod service;
pub mod svn;

use std::fmt;
use std::str::FromStr;

use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};

/// Version control systems served by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    Git,
    Hg,
    Svn,
}

impl Vcs {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Hg => "hg",
            Self::Svn => "svn",
        }
    }
}

impl fmt::Display for Vcs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vcs {
    type Err = UnknownVcs;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Self::Git),
            "hg" => Ok(Self::Hg),
            "svn" => Ok(Self::Svn),
            other => Err(UnknownVcs(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown vcs type: {0}")]
pub struct UnknownVcs(pub String);

/// What a request does to the repository. Classified once, never re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pull,
    Push,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request metadata the sniffers and classifiers operate on. Pure data,
/// no I/O beyond what is already in memory.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
}

impl<'a> RequestMeta<'a> {
    /// First value of the given query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|h| h.to_str().ok())
    }
}

/// Returns true if the request carries the Git smart HTTP (or LFS) protocol.
pub fn is_git(meta: &RequestMeta) -> bool {
    git::split_protocol_path(meta.path).is_some()
}

/// Returns true if the request carries the Mercurial wire protocol.
///
/// The `Accept` header alone is not enough: plain browsing may send it too,
/// so a `cmd` query parameter is required as well.
pub fn is_hg(meta: &RequestMeta) -> bool {
    let accepts_hg = meta
        .header("Accept")
        .map(|h| h.starts_with("application/mercurial"))
        .unwrap_or(false);

    accepts_hg && meta.query_param("cmd").is_some()
}

/// Returns true if the request carries the Subversion WebDAV protocol.
pub fn is_svn(meta: &RequestMeta, magic_segment: &str) -> bool {
    let dav = meta.header("DAV").unwrap_or_default();

    dav.contains("subversion")
        || meta.path.contains(magic_segment)
        || matches!(meta.method.as_str(), "PROPFIND" | "PROPPATCH")
}

/// Try the configured backends in order and return the first protocol match.
pub fn detect(meta: &RequestMeta, order: &[Vcs], svn_magic_segment: &str) -> Option<Vcs> {
    for vcs in order {
        let matched = match vcs {
            Vcs::Git => is_git(meta),
            Vcs::Hg => is_hg(meta),
            Vcs::Svn => is_svn(meta, svn_magic_segment),
        };
        if matched {
            tracing::debug!("request path `{}` detected as {} protocol", meta.path, vcs);
            return Some(*vcs);
        }
    }
    None
}

/// Classify a recognized request as a pull or a push.
pub fn classify(vcs: Vcs, meta: &RequestMeta) -> Action {
    match vcs {
        Vcs::Git => git::action(meta),
        Vcs::Hg => hg::action(meta),
        Vcs::Svn => svn::action(meta),
    }
}

#[cfg(test)]
mod test {
    use axum::http::{HeaderMap, Method};
    use pretty_assertions::assert_eq;

    use super::*;

    fn meta<'a>(method: &'a Method, path: &'a str, query: &'a str, headers: &'a HeaderMap) -> RequestMeta<'a> {
        RequestMeta {
            method,
            path,
            query,
            headers,
        }
    }

    #[test]
    fn test_sniff_git_paths() {
        let headers = HeaderMap::new();
        let get = Method::GET;

        for path in [
            "/project/info/refs",
            "/teams/alpha/git-upload-pack",
            "/teams/alpha/git-receive-pack",
            "/project/info/lfs/objects/batch",
        ] {
            assert!(is_git(&meta(&get, path, "", &headers)), "{path}");
        }
        assert!(!is_git(&meta(&get, "/project", "", &headers)));
        assert!(!is_git(&meta(&get, "/project/branches", "", &headers)));
    }

    #[test]
    fn test_sniff_hg_requires_cmd() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", "application/mercurial-0.1".parse().unwrap());
        let get = Method::GET;

        assert!(is_hg(&meta(&get, "/project", "cmd=capabilities", &headers)));
        // Header present but no `cmd`: plain browsing, not the wire protocol.
        assert!(!is_hg(&meta(&get, "/project", "", &headers)));

        let plain = HeaderMap::new();
        assert!(!is_hg(&meta(&get, "/project", "cmd=capabilities", &plain)));
    }

    #[test]
    fn test_sniff_svn() {
        let get = Method::GET;
        let propfind = Method::from_bytes(b"PROPFIND").unwrap();

        let mut dav = HeaderMap::new();
        dav.insert("DAV", "http://subversion.tigris.org/xmlns/dav/svn/depth".parse().unwrap());
        assert!(is_svn(&meta(&get, "/project", "", &dav), "/!svn"));

        let plain = HeaderMap::new();
        assert!(is_svn(&meta(&get, "/project/!svn/vcc/default", "", &plain), "/!svn"));
        assert!(is_svn(&meta(&propfind, "/project", "", &plain), "/!svn"));
        assert!(!is_svn(&meta(&get, "/project", "", &plain), "/!svn"));
    }

    #[test]
    fn test_detect_respects_backend_order() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", "application/mercurial-0.1".parse().unwrap());
        let get = Method::GET;
        let m = meta(&get, "/project", "cmd=capabilities", &headers);

        assert_eq!(detect(&m, &[Vcs::Hg, Vcs::Git, Vcs::Svn], "/!svn"), Some(Vcs::Hg));
        assert_eq!(detect(&m, &[Vcs::Git, Vcs::Svn], "/!svn"), None);
    }
}
