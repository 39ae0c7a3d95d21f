use std::time::Duration;

use thiserror::Error;

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Errors raised while loading credentials or driving the OAuth2 token lifecycle.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials: {0}")]
    Config(String),
    #[error("token endpoint rejected the {grant} grant with status {status}: {body}")]
    Rejected {
        grant: &'static str,
        status: u16,
        body: String,
    },
    #[error("could not read an authorization code from the redirect url: {0}")]
    InvalidRedirect(String),
    #[error("authorization prompt timed out after {0:?}")]
    PromptTimedOut(Duration),
    #[error("authorization prompt failed: {0}")]
    Prompt(String),
    #[error("no access token is held")]
    NoToken,
    #[error("token cache error: {0}")]
    Cache(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AuthError {
    pub fn rejected(grant: &'static str, status: reqwest::StatusCode, body: &str) -> Self {
        AuthError::Rejected {
            grant,
            status: status.as_u16(),
            body: body.to_string(),
        }
    }
}

pub type WsResult<T> = std::result::Result<T, WsClientError>;

#[derive(Debug, Error)]
pub enum WsClientError {
    #[error("streamer info missing from user preferences: {0}")]
    MissingStreamerInfo(String),
    #[error("failed to fetch streamer info: {0}")]
    SessionInfo(String),
    #[error("stream is not active, request {0} was not sent")]
    Inactive(String),
    #[error("stream is not logged in")]
    NotLoggedIn,
    #[error("login rejected by streamer: {0}")]
    LoginRejected(String),
    #[error("no login response within {0:?}")]
    LoginTimedOut(Duration),
    #[error("connection closed before login response")]
    ClosedDuringLogin,
    #[error("stream failed after {uptime:?}, inside the {window:?} rapid failure window")]
    RapidFailure { uptime: Duration, window: Duration },
    #[error("max reconnection attempts ({0}) exceeded")]
    ReconnectExhausted(u32),
    #[error("failed to obtain access token: {0}")]
    Auth(String),
    #[error("invalid websocket message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<AuthError> for WsClientError {
    fn from(err: AuthError) -> Self {
        WsClientError::Auth(err.to_string())
    }
}
