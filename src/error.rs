use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failures talking to an upstream site. Every variant carries the URL that
/// was attempted so error pages can show it.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("connection to {url} failed: {message}")]
    Connection { url: String, message: String },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

impl FetchError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout { url: url.to_string() }
        } else {
            FetchError::Connection {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            FetchError::Timeout { url }
            | FetchError::Connection { url, .. }
            | FetchError::Status { url, .. } => Some(url),
            FetchError::Build(_) => None,
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("HTML rewriting failed: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),
}

/// Request-level errors that map straight to a client error response.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing {0} parameter")]
    MissingParameter(&'static str),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingParameter(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
