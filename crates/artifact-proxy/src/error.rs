//! Error types for the artifact proxy

use artifact_store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ProxyError {
    Config(String),
    Mirrors {
        path: PathBuf,
        source: std::io::Error,
    },
    Store(StoreError),
    Http(Box<reqwest::Error>),
    Io(Box<std::io::Error>),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ProxyError::Mirrors { path, source } => {
                write!(f, "Cannot load mirrors from {}: {}", path.display(), source)
            }
            ProxyError::Store(err) => write!(f, "Store error: {}", err),
            ProxyError::Http(err) => write!(f, "HTTP client error: {}", err),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Mirrors { source, .. } => Some(source),
            ProxyError::Store(err) => Some(err),
            ProxyError::Http(err) => Some(err.as_ref()),
            ProxyError::Io(err) => Some(err.as_ref()),
            ProxyError::Config(_) => None,
        }
    }
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        ProxyError::Store(err)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Http(Box::new(err))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failure of an administrative request, rendered as `{"Error": ...}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Administrative request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, axum::Json(json!({ "Error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
