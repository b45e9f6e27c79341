use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::access::Directory;
use crate::extras::OperationExtras;
use crate::scm::Action;

/// What hook calls land on. Hooks running inside the spawned VCS process
/// call back here synchronously to re-validate, audit, or abort the
/// operation.
pub trait Hooks: Send + Sync + 'static {
    fn call(&self, method: &str, extras: &serde_json::Value) -> serde_json::Value;
}

#[derive(Debug, Deserialize)]
struct HookCall {
    method: String,
    #[serde(default)]
    extras: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct HookResult {
    pub status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl HookResult {
    pub fn ok() -> Self {
        Self {
            status: 0,
            output: None,
        }
    }

    pub fn abort(output: impl Into<String>) -> Self {
        Self {
            status: 1,
            output: Some(output.into()),
        }
    }
}

/// The gateway's own hook endpoints: pre-hooks re-validate the permission
/// snapshot against the directory, post-hooks record the event.
pub struct GatewayHooks {
    pub directory: Arc<Directory>,
}

impl Hooks for GatewayHooks {
    fn call(&self, method: &str, extras: &serde_json::Value) -> serde_json::Value {
        let Some(extras) = serde_json::from_value::<OperationExtras>(extras.clone()).ok() else {
            return serde_json::json!({ "exception": "InvalidExtras" });
        };
        let result = match method {
            "pre_push" => self.revalidate(&extras, Action::Push),
            "pre_pull" => self.revalidate(&extras, Action::Pull),
            "post_push" | "post_pull" => {
                tracing::info!(
                    "{} by `{}` on `{}` completed",
                    method,
                    extras.username,
                    extras.repository
                );
                HookResult::ok()
            }
            other => {
                tracing::warn!("unknown hook method `{other}` called");
                return serde_json::json!({ "exception": "HookMethodNotFound" });
            }
        };
        serde_json::to_value(result).unwrap_or_default()
    }
}

impl GatewayHooks {
    fn revalidate(&self, extras: &OperationExtras, action: Action) -> HookResult {
        let level = self.directory.permission(&extras.username, &extras.repository);
        if level.allows(action) {
            HookResult::ok()
        } else {
            HookResult::abort(format!(
                "{} denied for user `{}` on `{}`",
                action, extras.username, extras.repository
            ))
        }
    }
}

async fn hook_handler(
    State(hooks): State<Arc<dyn Hooks>>,
    Json(call): Json<HookCall>,
) -> Json<serde_json::Value> {
    tracing::debug!("callback daemon received `{}`", call.method);
    Json(hooks.call(&call.method, &call.extras))
}

/// An ephemeral local HTTP endpoint, one per gateway operation, that hook
/// code inside the spawned VCS process can reach. The daemon is bound (and
/// therefore reachable) before `start` returns, and is torn down exactly
/// once: on `stop` or on drop, whichever comes first.
pub struct CallbackDaemon {
    uri: String,
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CallbackDaemon {
    pub fn start(hooks: Arc<dyn Hooks>) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        let addr: SocketAddr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown, rx) = oneshot::channel::<()>();

        let app = Router::new().route("/", post(hook_handler)).with_state(hooks);
        let thread = thread::Builder::new()
            .name("callback-daemon".to_owned())
            .spawn(move || {
                let serve = async {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            rx.await.ok();
                        })
                        .await
                };
                if let Err(err) = runtime.block_on(serve) {
                    tracing::error!("callback daemon failed: {err}");
                }
            })?;

        tracing::debug!("callback daemon listening on {addr}");
        Ok(Self {
            uri: addr.to_string(),
            port: addr.port(),
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    /// `host:port` to inject into the operation extras.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            tracing::debug!("callback daemon exiting now...");
            shutdown.send(()).ok();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

impl Drop for CallbackDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
