#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
pub mod access;
pub mod config;
pub mod error;
pub mod extras;
pub mod gateway;
pub mod hooks;
pub mod identity;
pub mod perms;
pub mod scm;
pub mod ssh;

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Body;
use axum::http::{Request, Response};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::config::Config;
use crate::gateway::Context;

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
    pub config: PathBuf,
    pub cache: Option<NonZeroUsize>,
}

/// Run the gateway server.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let config = Config::load(&options.config)
        .with_context(|| format!("loading config from `{}`", options.config.display()))?;
    let listen = options.listen;

    tracing::info!(
        "serving {} repositories from {}",
        config.directory.repositories.len(),
        config.repositories_root.display()
    );
    tracing::info!("listening on http://{listen}");

    let cache = options.cache.unwrap_or(perms::DEFAULT_CACHE_SIZE);
    let ctx = Context::new(Arc::new(config), cache);
    let id = Arc::new(AtomicU64::new(fastrand::u64(..)));

    let app = gateway::router(ctx)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |_request: &Request<Body>| {
                    tracing::info_span!("request", id = id.fetch_add(1, Ordering::SeqCst))
                })
                .on_response(
                    |response: &Response<Body>, latency: Duration, _span: &Span| {
                        tracing::info!("{} {:?}", response.status(), latency);
                    },
                ),
        )
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    axum::serve(listener, app).await.map_err(anyhow::Error::from)
}

pub mod logger {
    use tracing::dispatcher::Dispatch;

    pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::dispatcher::set_global_default(Dispatch::new(subscriber()))
    }

    #[cfg(feature = "logfmt")]
    pub fn subscriber() -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt as _;
        use tracing_subscriber::EnvFilter;

        tracing_subscriber::Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_logfmt::layer())
    }

    #[cfg(not(feature = "logfmt"))]
    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }

    /// Logger for the SSH wrapper, which must keep stdout clean for the
    /// tunneled protocol: everything goes to stderr.
    pub fn init_stderr() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::dispatcher::set_global_default(Dispatch::new(subscriber))
    }
}
