//! Error handling for the bridge HTTP server.
//!
//! Errors raised while a request is processed by the bridge never reach this
//! type; the coordinator turns them into JSON responses itself. What remains
//! are server lifecycle failures and failures of the blocking worker a
//! request runs on.

use thiserror::Error;
use warp::Reply;

/// Result type for bsv-auth-http operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the bridge HTTP server.
#[derive(Error, Debug)]
pub enum Error {
    /// Binding or serving failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from the bridge.
    #[error("Bridge error: {0}")]
    Bridge(#[from] bsv_auth_node::Error),

    /// The blocking worker running a request panicked or was cancelled.
    #[error("Worker error: {0}")]
    Worker(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the HTTP status code that should be used for this error.
    pub fn status_code(&self) -> warp::http::StatusCode {
        use warp::http::StatusCode;

        match self {
            Error::Bridge(e) => e.status_code(),
            Error::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Http(_) | Error::Worker(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Creates an error response in the bridge's error body format.
    pub fn to_response(&self) -> warp::reply::Response {
        let code = match self {
            Error::Bridge(e) => e.code().as_str(),
            Error::Config(_) => "ERR_SERVER_MISCONFIGURED",
            Error::Http(_) | Error::Worker(_) | Error::Io(_) => "ERR_INTERNAL",
        };
        warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "status": "error",
                "code": code,
                "description": self.to_string(),
            })),
            self.status_code(),
        )
        .into_response()
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Worker(err.to_string())
    }
}

impl warp::reject::Reject for Error {}
