//! Error taxonomy shared by the control surface and the HTTP layer.

use std::io;
use std::net::SocketAddr;

use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad control input (port, empty root set, malformed request body).
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Containment violation, or a kind mismatch such as a directory
    /// requested as a file.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error("range not satisfiable for {len} byte resource")]
    RangeNotSatisfiable { len: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A streaming write failed after headers were sent.
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,
}

impl Error {
    /// Map a filesystem error on `what` into the request taxonomy.
    ///
    /// Missing entries (and path components that are not directories) are
    /// `NotFound`; everything else stays an I/O fault.
    pub fn from_fs(err: io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                Error::NotFound(what.to_string())
            }
            io::ErrorKind::PermissionDenied => Error::Forbidden(what.to_string()),
            _ => Error::Io(err),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::Io(_)
            | Error::Bind { .. }
            | Error::ClientDisconnected
            | Error::AlreadyRunning
            | Error::NotRunning => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        // Filesystem details stay in the log, not in the response body.
        let body = match &self {
            Error::Io(_) => "internal error".to_string(),
            Error::NotFound(_) => "not found".to_string(),
            Error::Forbidden(_) => "forbidden".to_string(),
            other => other.to_string(),
        };

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        match &self {
            Error::MethodNotAllowed(_) => {
                headers.insert(header::ALLOW, HeaderValue::from_static("GET, POST"));
            }
            Error::RangeNotSatisfiable { len } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{len}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            _ => {}
        }
        response
    }
}
