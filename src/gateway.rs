use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::Engine as _;
use flate2::read::GzDecoder;

use crate::access::Directory;
use crate::config::Config;
use crate::error::Error;
use crate::extras::OperationExtras;
use crate::hooks::{CallbackDaemon, GatewayHooks, Hooks};
use crate::identity::{self, RepoIdentity};
use crate::perms::{Gate, GateKey};
use crate::scm::service::{ForwardedRequest, ProxiedResponse, ServiceApp};
use crate::scm::svn::{DisabledApp, ProxyApp, TxnStore};
use crate::scm::{self, Action, RequestMeta, Vcs};

/// Realm presented with the basic-auth challenge.
const REALM: &str = "VCS Gateway";

/// Shared state of the HTTP dispatcher.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub gate: Arc<Gate>,
    pub txns: Arc<TxnStore>,
}

impl Context {
    pub fn new(config: Arc<Config>, cache_size: NonZeroUsize) -> Self {
        Self {
            config,
            gate: Arc::new(Gate::new(cache_size)),
            txns: Arc::new(TxnStore::default()),
        }
    }

    fn directory(&self) -> &Arc<Directory> {
        &self.config.directory
    }
}

pub fn router(ctx: Context) -> Router {
    // Any path can be a VCS protocol call; sniffing decides.
    Router::new().fallback(vcs_handler).with_state(ctx)
}

async fn vcs_handler(
    State(ctx): State<Context>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle(&ctx, &method, &uri, headers, remote, body) {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// The dispatcher state machine: detect, resolve identity, enforce policy,
/// classify, authenticate, authorize, delegate, invalidate. Each rejection
/// happens before any byte of the real protocol response is produced.
fn handle(
    ctx: &Context,
    method: &Method,
    uri: &Uri,
    headers: HeaderMap,
    remote: SocketAddr,
    body: Bytes,
) -> Result<Response, Error> {
    let config = &ctx.config;
    let path = uri.path();
    let query = uri.query().unwrap_or("");

    // Gzip bodies are inflated up front: classification and the backends
    // must see the plain protocol stream.
    let (headers, body) = decode_body(headers, body)?;

    let meta = RequestMeta {
        method,
        path,
        query,
        headers: &headers,
    };
    let Some(vcs) = scm::detect(&meta, &config.backends, &config.svn_magic_segment) else {
        // Nothing else is mounted behind the gateway.
        return Err(Error::NotFound);
    };

    let url_name = url_repo_name(ctx, vcs, path).ok_or(Error::NotFound)?;
    let url_name = translate_repo_id(ctx.directory(), &url_name);
    tracing::debug!("extracted repo name is `{url_name}`");

    let identity = identity::resolve(ctx.directory(), &config.repositories_root, &url_name);

    if !identity.is_shadow && !is_valid_repo(ctx, &identity, vcs) {
        return Err(Error::NotFound);
    }

    let scheme = origin_scheme(&headers).to_owned();
    if config.require_ssl && scheme == "http" {
        return Err(Error::NotAcceptable(
            "SSL required, but the request came in over plain HTTP".to_owned(),
        ));
    }

    let action = scm::classify(vcs, &meta);

    if identity.is_shadow {
        if action != Action::Pull {
            return Err(Error::NotAcceptable(
                "Only pull action is allowed for shadow repositories".to_owned(),
            ));
        }
        // Shadow workspaces are cleaned up after the pull request merges.
        if !identity.storage_path.exists() {
            return Err(Error::NotFound);
        }
    }

    let ip = remote.ip();
    let username = authorize(ctx, &identity, action, ip, &headers)?;

    tracing::info!(
        "{} action on {} repo `{}` by `{}` from {}",
        action,
        vcs,
        identity.url_name,
        username,
        ip
    );

    let extras = build_extras(ctx, vcs, &identity, action, &username, ip, query, &scheme);
    let request = ForwardedRequest {
        method: method.clone(),
        path: path.to_owned(),
        query: query.to_owned(),
        headers,
        body,
    };

    respond(ctx, vcs, &identity, action, extras, &request)
}

/// Inflates a gzip-encoded request body and drops the encoding headers, so
/// downstream consumers see the plain stream.
fn decode_body(mut headers: HeaderMap, body: Bytes) -> Result<(HeaderMap, Vec<u8>), Error> {
    let gzip = headers
        .get("Content-Encoding")
        .and_then(|h| h.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);

    if !gzip {
        return Ok((headers, body.to_vec()));
    }
    tracing::debug!("gzip request body detected, inflating");

    let mut decoded = Vec::new();
    GzDecoder::new(body.as_ref()).read_to_end(&mut decoded)?;

    headers.remove("Content-Encoding");
    headers.remove("Content-Length");
    Ok((headers, decoded))
}

/// Scheme the client originally used, as reported by the fronting proxy.
fn origin_scheme(headers: &HeaderMap) -> &str {
    headers
        .get("X-Forwarded-Proto")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("http")
}

/// Repository name addressed by the URL, per backend.
fn url_repo_name(ctx: &Context, vcs: Vcs, path: &str) -> Option<String> {
    let name = match vcs {
        Vcs::Git => scm::git::repo_name(path)?,
        Vcs::Hg => scm::hg::repo_name(path),
        Vcs::Svn => {
            let directory = ctx.directory();
            scm::svn::repo_name(path, &ctx.config.svn_magic_segment, |name| {
                directory
                    .repository(name)
                    .map(|repo| repo.vcs == Vcs::Svn)
                    .unwrap_or(false)
            })
        }
    };
    Some(name).filter(|name| !name.is_empty())
}

/// Supports non-changeable `_<ID>` clone URLs: a leading `_<id>` path
/// segment is replaced by the repository's name.
fn translate_repo_id(directory: &Directory, url_name: &str) -> String {
    let (first, rest) = match url_name.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (url_name, None),
    };
    let resolved = first
        .strip_prefix('_')
        .and_then(|id| id.parse().ok())
        .and_then(|id| directory.repository_by_id(id));

    match (resolved, rest) {
        (Some(repo), Some(rest)) => format!("{}/{}", repo.name, rest),
        (Some(repo), None) => repo.name.clone(),
        (None, _) => url_name.to_owned(),
    }
}

/// A non-shadow repository must be registered with the matching SCM type
/// and present on disk.
fn is_valid_repo(ctx: &Context, identity: &RepoIdentity, vcs: Vcs) -> bool {
    let registered = ctx
        .directory()
        .repository(&identity.acl_name)
        .map(|repo| repo.vcs == vcs)
        .unwrap_or(false);
    if !registered {
        tracing::debug!(
            "repository `{}` not registered as a {} repo",
            identity.acl_name,
            vcs
        );
        return false;
    }
    identity.storage_path.exists()
}

/// Resolves who this request runs as: the anonymous account if it is
/// active and passes the gate, a proxy-authenticated user, or basic-auth
/// credentials. The resolved user is then gated; failure is a 403.
fn authorize(
    ctx: &Context,
    identity: &RepoIdentity,
    action: Action,
    ip: IpAddr,
    headers: &HeaderMap,
) -> Result<String, Error> {
    let config = &ctx.config;
    let directory = ctx.directory();
    let ttl = config.cache_ttl();
    let gate_key = |user: &str| GateKey {
        plugin_id: config.auth_plugin.clone(),
        action,
        user: user.to_owned(),
        repo_name: identity.acl_name.clone(),
        ip,
    };

    match directory.user(&config.anonymous_user).filter(|u| u.active) {
        Some(anonymous) => {
            if ctx.gate.check(directory.as_ref(), &gate_key(&anonymous.name), ttl) {
                return Ok(anonymous.name.clone());
            }
            tracing::debug!("not enough credentials to access this repository anonymously");
        }
        None => tracing::debug!("anonymous access is disabled, running authentication"),
    }

    // Container/proxy pre-authentication, then interactive credentials.
    let pre_auth = if config.trust_proxy_auth {
        headers
            .get("Remote-User")
            .and_then(|h| h.to_str().ok())
            .map(|user| user.to_owned())
    } else {
        None
    };
    let username = match pre_auth {
        Some(username) => {
            tracing::debug!("pre-auth got `{username}` as username");
            username
        }
        None => basic_auth(directory, headers).ok_or_else(|| Error::Unauthorized(REALM.to_owned()))?,
    };

    let user = directory
        .user(&username)
        .filter(|u| u.active)
        .ok_or(Error::Forbidden)?;

    if !ctx.gate.check(directory.as_ref(), &gate_key(&user.name), ttl) {
        return Err(Error::Forbidden);
    }
    Ok(user.name.clone())
}

/// Verifies `Authorization: Basic` credentials against the directory.
fn basic_auth(directory: &Directory, headers: &HeaderMap) -> Option<String> {
    let header = headers.get("Authorization")?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    directory
        .authenticate(username, password)
        .then(|| username.to_owned())
}

fn build_extras(
    ctx: &Context,
    vcs: Vcs,
    identity: &RepoIdentity,
    action: Action,
    username: &str,
    ip: IpAddr,
    query: &str,
    scheme: &str,
) -> OperationExtras {
    let config = &ctx.config;
    let mut extras = OperationExtras::new(
        ip.to_string(),
        username.to_owned(),
        action,
        identity.acl_name.clone(),
        vcs,
    );
    extras.server_url = config.server_url.clone();
    extras.is_shadow_repo = identity.is_shadow;
    extras.permission = Some(config.directory.permission(username, &identity.acl_name));

    match vcs {
        Vcs::Git => scm::git::create_config(&mut extras, config, scheme),
        Vcs::Hg => {
            extras.check_locking = scm::hg::check_locking(query);
            scm::hg::create_config(&mut extras, config);
        }
        Vcs::Svn => scm::svn::create_config(&mut extras, config),
    }
    extras
}

/// Delegates to the backend sub-application, in two phases: the callback
/// daemon is started (and its address injected) strictly before the backend
/// runs, and the upstream's status and headers are read before the response
/// is returned. The body is then relayed chunk by chunk; teardown (daemon
/// stop, push invalidation) runs once the relay stops, on success, failure
/// and client disconnect alike.
fn respond(
    ctx: &Context,
    vcs: Vcs,
    identity: &RepoIdentity,
    action: Action,
    mut extras: OperationExtras,
    request: &ForwardedRequest,
) -> Result<Response, Error> {
    let daemon = if daemon_required(vcs, request.method.as_str()) {
        let hooks: Arc<dyn Hooks> = Arc::new(GatewayHooks {
            directory: ctx.directory().clone(),
        });
        let daemon = CallbackDaemon::start(hooks)?;
        extras.hooks_uri = Some(daemon.uri().to_owned());
        Some(daemon)
    } else {
        None
    };
    tracing::debug!("hooks extras: {extras:?}");

    // The teardown closure keeps the daemon alive while the backend runs
    // and while the body streams.
    let directory = ctx.directory().clone();
    let invalidate = (action == Action::Push).then(|| identity.url_name.clone());
    let teardown = move || {
        if let Some(name) = invalidate {
            directory.mark_for_invalidation(&name);
        }
        drop(daemon);
    };

    match dispatch(ctx, vcs, identity, extras, request) {
        Ok(proxied) => build_response(proxied, teardown),
        Err(err) => {
            // Failed delegation still runs the teardown path.
            teardown();
            Err(err)
        }
    }
}

/// Hook execution needs the daemon for every Git and Mercurial call; for
/// SVN over HTTP only transaction-opening and -committing methods do.
fn daemon_required(vcs: Vcs, method: &str) -> bool {
    match vcs {
        Vcs::Git | Vcs::Hg => true,
        Vcs::Svn => scm::svn::needs_callback_daemon(method),
    }
}

fn dispatch(
    ctx: &Context,
    vcs: Vcs,
    identity: &RepoIdentity,
    extras: OperationExtras,
    request: &ForwardedRequest,
) -> Result<ProxiedResponse, Error> {
    match vcs {
        Vcs::Git | Vcs::Hg => {
            let base = ctx
                .config
                .vcs_http_server
                .clone()
                .ok_or_else(|| Error::Backend("no VCS execution service configured".to_owned()))?;
            ServiceApp::new(base, vcs, identity.url_name.clone(), extras).handle(request)
        }
        Vcs::Svn => match ctx.config.svn_http_server.clone() {
            Some(base) => {
                ProxyApp::new(base, identity.acl_name.clone(), extras, &ctx.txns).handle(request)
            }
            None => DisabledApp.handle(request),
        },
    }
}

fn build_response(
    proxied: ProxiedResponse,
    teardown: impl FnOnce() + Send + 'static,
) -> Result<Response, Error> {
    let status = StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for (name, value) in &proxied.headers {
        let name: HeaderName = name.as_str().try_into()?;
        headers.append(name, value.parse()?);
    }
    Ok((status, headers, proxied.body.stream(teardown)).into_response())
}
