use serde::Deserialize;

use crate::errors::{AuthError, WsClientError};

/// Result type used by [`SchwabClient`](super::SchwabClient).
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the high level client API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Token acquisition, refresh or persistence failed.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    /// Errors that originate from the streaming session.
    #[error("ws error: {0}")]
    Ws(#[from] WsClientError),
    /// Configuration validation failure raised by a builder.
    #[error("invalid config: {field}: {why}")]
    InvalidConfig {
        field: &'static str,
        why: &'static str,
    },
    #[error("config file: {0}")]
    ConfigFile(String),
    /// Still 401 after the token was replaced once.
    #[error("unauthorized after token refresh: {body}")]
    Unauthorized { body: String },
    /// Structured server error response.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Raw HTTP error when no structured error could be parsed.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Unauthorized { .. } => Some(401),
            Error::Server { status, .. } | Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerErr {
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) errors: Vec<ServerErrDetail>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerErrDetail {
    #[serde(default)]
    pub(crate) detail: Option<String>,
    #[serde(default)]
    pub(crate) title: Option<String>,
}

impl ServerErr {
    pub(crate) fn into_message(self) -> Option<String> {
        if let Some(message) = self.message.filter(|m| !m.is_empty()) {
            return Some(message);
        }
        let parts: Vec<String> = self
            .errors
            .into_iter()
            .filter_map(|e| e.detail.or(e.title))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}
