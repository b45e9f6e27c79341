use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine as _;

use crate::config::Config;
use crate::error::Error;
use crate::extras::OperationExtras;
use crate::scm::service::{
    filtered_request_headers, read_response, ForwardedRequest, ProxiedResponse, UpstreamBody,
};
use crate::scm::{Action, RequestMeta};

/// HTTP methods that only ever read from a Subversion repository.
const READ_ONLY_METHODS: [&str; 4] = ["OPTIONS", "PROPFIND", "GET", "REPORT"];

/// Maps a Subversion WebDAV request to a pull or push: read-only verbs are
/// pulls, every other method mutates.
pub fn action(meta: &RequestMeta) -> Action {
    if READ_ONLY_METHODS.contains(&meta.method.as_str()) {
        Action::Pull
    } else {
        Action::Push
    }
}

/// Only MERGE commits a transaction and POST opens one; other methods never
/// reach the hooks, so no callback daemon is needed for them.
pub fn needs_callback_daemon(method: &str) -> bool {
    matches!(method, "MERGE" | "POST")
}

/// Repository name addressed by a Subversion URL.
///
/// SVN requests carry the whole path, including directories inside the
/// repository, so the name is the longest registered prefix of the path
/// (checked via `is_repo`). The magic protocol segment and anything after
/// it is ignored.
pub fn repo_name(path: &str, magic_segment: &str, is_repo: impl Fn(&str) -> bool) -> String {
    let path = match path.find(magic_segment) {
        Some(pos) => &path[..pos],
        None => path,
    };
    let candidate = path.trim_matches('/');

    if !is_repo(candidate) {
        let mut current = String::new();
        for component in candidate.split('/') {
            current.push_str(component);
            if is_repo(&current) {
                return current;
            }
            current.push('/');
        }
    }
    candidate.to_owned()
}

/// Subversion transactions opened over HTTP, recorded so hooks fired later
/// in the transaction's life can find the callback daemon that belongs to
/// the originating request.
#[derive(Debug, Default)]
pub struct TxnStore {
    entries: Mutex<HashMap<String, u16>>,
}

impl TxnStore {
    pub fn record(&self, repo_name: &str, txn_id: &str, port: u16) {
        let key = Self::key(repo_name, txn_id);
        tracing::debug!("storing txn `{key}` -> callback port {port}");
        self.entries.lock().expect("txn store lock").insert(key, port);
    }

    pub fn port(&self, repo_name: &str, txn_id: &str) -> Option<u16> {
        let key = Self::key(repo_name, txn_id);
        self.entries.lock().expect("txn store lock").get(&key).copied()
    }

    fn key(repo_name: &str, txn_id: &str) -> String {
        format!("{repo_name}:{txn_id}")
    }
}

/// Reverse proxy that forwards every request byte-for-byte to the
/// configured `subversion-http-server`.
pub struct ProxyApp<'a> {
    base_url: String,
    repo_name: String,
    extras: OperationExtras,
    txns: &'a TxnStore,
}

impl<'a> ProxyApp<'a> {
    pub fn new(
        base_url: String,
        repo_name: String,
        extras: OperationExtras,
        txns: &'a TxnStore,
    ) -> Self {
        Self {
            base_url,
            repo_name,
            extras,
            txns,
        }
    }

    fn url(&self, req: &ForwardedRequest) -> String {
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), req.path);
        if !req.query.is_empty() {
            url.push('?');
            url.push_str(&req.query);
        }
        url
    }

    /// Rewrites a `create-txn-with-props` body so the operation extras ride
    /// along as an SVN revision property, where hooks executed later inside
    /// the transaction can read them.
    fn patch_txn_body(&self, body: &[u8]) -> Vec<u8> {
        if !body.starts_with(b"(create-txn-with-props") || body.len() < 2 {
            return body.to_vec();
        }
        let encoded = base64::engine::general_purpose::URL_SAFE
            .encode(self.extras.to_json_string().as_bytes());
        let skel = format!(" gateway-extras {} {} ))", encoded.len(), encoded);

        let mut patched = body[..body.len() - 2].to_vec();
        patched.extend_from_slice(skel.as_bytes());
        patched
    }

    pub fn handle(&self, req: &ForwardedRequest) -> Result<ProxiedResponse, Error> {
        let url = self.url(req);
        tracing::debug!("proxying {} via `{}`", req.method, url);

        let body = if req.method.as_str() == "MKCOL" || !req.body.is_empty() {
            self.patch_txn_body(&req.body)
        } else {
            req.body.clone()
        };

        let mut outbound = ureq::request(req.method.as_str(), &url);
        for (name, value) in filtered_request_headers(&req.headers) {
            outbound = outbound.set(&name, &value);
        }

        let response = read_response(outbound.send_bytes(&body))?;

        // Remember which callback daemon belongs to the transaction the SVN
        // server just opened.
        if let Some((_, txn_id)) = response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("SVN-Txn-name"))
        {
            if let Some(port) = self.extras.hooks_port() {
                self.txns.record(&self.repo_name, txn_id, port);
            }
        }

        Ok(response)
    }
}

/// Placeholder used when no SVN-over-HTTP upstream is configured: every
/// call is answered with a fixed "not acceptable".
pub struct DisabledApp;

impl DisabledApp {
    pub fn handle(&self, _req: &ForwardedRequest) -> Result<ProxiedResponse, Error> {
        let reason = "Cannot handle SVN call: no subversion-http-server is configured";
        tracing::warn!("{reason}");
        Ok(ProxiedResponse {
            status: 406,
            headers: vec![("Content-Type".to_owned(), "text/plain".to_owned())],
            body: UpstreamBody::from_bytes(reason.as_bytes().to_vec()),
        })
    }
}

pub fn create_config(extras: &mut OperationExtras, config: &Config) {
    if let Some(server) = &config.svn_http_server {
        extras.set("subversion_http_server_url", server.clone());
    }
}

#[cfg(test)]
mod test {
    use axum::http::{HeaderMap, Method};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_read_only_methods_are_pulls() {
        let headers = HeaderMap::new();
        for method in ["OPTIONS", "PROPFIND", "GET", "REPORT"] {
            let method = Method::from_bytes(method.as_bytes()).unwrap();
            let meta = RequestMeta {
                method: &method,
                path: "/r",
                query: "",
                headers: &headers,
            };
            assert_eq!(action(&meta), Action::Pull);
        }
        for method in ["PUT", "POST", "MERGE", "MKCOL", "DELETE", "PROPPATCH"] {
            let method = Method::from_bytes(method.as_bytes()).unwrap();
            let meta = RequestMeta {
                method: &method,
                path: "/r",
                query: "",
                headers: &headers,
            };
            assert_eq!(action(&meta), Action::Push);
        }
    }

    #[test]
    fn test_repo_name_strips_magic_segment() {
        let name = repo_name("/teams/alpha/!svn/vcc/default", "/!svn", |r| r == "teams/alpha");
        assert_eq!(name, "teams/alpha");
    }

    #[test]
    fn test_repo_name_walks_to_registered_root() {
        let name = repo_name("/teams/alpha/trunk/src", "/!svn", |r| r == "teams/alpha");
        assert_eq!(name, "teams/alpha");
    }

    #[test]
    fn test_repo_name_unregistered_returns_full_path() {
        let name = repo_name("/not/known", "/!svn", |_| false);
        assert_eq!(name, "not/known");
    }

    #[test]
    fn test_patch_txn_body() {
        let txns = TxnStore::default();
        let app = ProxyApp::new(
            "http://localhost:8090".to_owned(),
            "r".to_owned(),
            OperationExtras::default(),
            &txns,
        );
        let body = b"(create-txn-with-props (something 3:abc ))".to_vec();
        let patched = app.patch_txn_body(&body);
        let text = String::from_utf8(patched).unwrap();

        assert!(text.starts_with("(create-txn-with-props (something 3:abc "));
        assert!(text.contains(" gateway-extras "));
        assert!(text.ends_with(" ))"));

        // Non-txn bodies pass through untouched.
        let other = app.patch_txn_body(b"(checkout)");
        assert_eq!(other, b"(checkout)".to_vec());
    }

    #[test]
    fn test_txn_store_roundtrip() {
        let txns = TxnStore::default();
        txns.record("teams/alpha", "1-a", 35771);
        assert_eq!(txns.port("teams/alpha", "1-a"), Some(35771));
        assert_eq!(txns.port("teams/alpha", "2-b"), None);
    }
}
