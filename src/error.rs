use axum::http;
use axum::http::header::WWW_AUTHENTICATE;
use axum::response::{IntoResponse, Response};

/// Errors produced by the HTTP gateway. Everything here is decided before
/// the first proxied byte is sent; failures after that point can only stop
/// the stream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The addressed repository does not exist (or must not be revealed).
    #[error("repository not found")]
    NotFound,

    /// Authenticated, but not allowed.
    #[error("access denied")]
    Forbidden,

    /// Credentials required or rejected; carries the realm for the
    /// basic-auth challenge.
    #[error("authentication required")]
    Unauthorized(String),

    /// Policy violation: SSL required, shadow-repo write, bad plugin data.
    #[error("request not acceptable: {0}")]
    NotAcceptable(String),

    /// The delegated VCS backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// HeaderName error.
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// HeaderValue error.
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}

impl Error {
    pub fn status(&self) -> http::StatusCode {
        match self {
            Error::NotFound => http::StatusCode::NOT_FOUND,
            Error::Forbidden => http::StatusCode::FORBIDDEN,
            Error::Unauthorized(_) => http::StatusCode::UNAUTHORIZED,
            Error::NotAcceptable(_) => http::StatusCode::NOT_ACCEPTABLE,
            _ => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::debug!("{}", self);

        match self {
            Error::Unauthorized(realm) => {
                let challenge = format!("Basic realm=\"{realm}\"");
                (
                    http::StatusCode::UNAUTHORIZED,
                    [(WWW_AUTHENTICATE, challenge)],
                )
                    .into_response()
            }
            Error::NotAcceptable(reason) => {
                (http::StatusCode::NOT_ACCEPTABLE, reason).into_response()
            }
            other => other.status().into_response(),
        }
    }
}
