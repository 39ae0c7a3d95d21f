pub mod config;
pub mod credentials;
pub mod errors;
pub mod prompt;
pub mod schwab_client;
pub mod token_cache;
pub mod types;
pub mod ws_client;

pub use config::ClientConfig;
pub use credentials::ClientIdentity;
pub use errors::{AuthError, AuthResult, WsClientError, WsResult};
pub use prompt::{extract_authorization_code, AuthorizationPrompt, ConsolePrompt};
pub use schwab_client::{
    ApiRequest, ApiResponse, Error as SchwabError, OrderPlaced, RequestPacing, RestClient,
    Result as SchwabResult, SchwabClient, SchwabClientBuilder, TokenManager, TokenStatus,
};
pub use token_cache::{TokenCache, TokenRecord};
pub use types::{AccountHash, OrderId, RequestId};
pub use ws_client::{
    SessionSource, SessionState, StreamClient, StreamCommand, StreamConfig, StreamEvent,
    StreamRequest, StreamerSessionInfo, WsReader,
};
