use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tokio::{
    net::TcpStream,
    sync::{watch, Mutex},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    errors::{WsClientError, WsResult},
    schwab_client::format_list,
    types::RequestId,
};

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsSocket, Message>;

/// Read half of an open streaming connection, handed to [`StreamClient::run`].
pub type WsReader = SplitStream<WsSocket>;

const ADMIN_SERVICE: &str = "ADMIN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Pause before each reconnect attempt.
    pub reconnect_delay_secs: u64,
    /// A session that fails sooner than this after login is not reconnected.
    pub rapid_failure_window_secs: u64,
    pub login_timeout_secs: u64,
    pub logout_timeout_ms: u64,
    /// First request id handed out by a session.
    pub request_id_seed: u64,
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 10,
            rapid_failure_window_secs: 70,
            login_timeout_secs: 30,
            logout_timeout_ms: 1000,
            request_id_seed: 0,
            max_reconnect_attempts: None,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn rapid_failure_window(&self) -> Duration {
        Duration::from_secs(self.rapid_failure_window_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_millis(self.logout_timeout_ms)
    }
}

/// Connection metadata from the user preferences endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerSessionInfo {
    #[serde(rename = "streamerSocketUrl")]
    pub socket_url: String,
    #[serde(rename = "schwabClientCustomerId")]
    pub customer_id: String,
    #[serde(rename = "schwabClientCorrelId")]
    pub correl_id: String,
    #[serde(rename = "schwabClientChannel")]
    pub client_channel: String,
    #[serde(rename = "schwabClientFunctionId")]
    pub function_id: String,
}

impl StreamerSessionInfo {
    /// Take the first entry of `streamerInfo` from a user preferences body.
    pub fn from_user_preferences(preferences: &Value) -> WsResult<Self> {
        let first = preferences
            .get("streamerInfo")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .ok_or_else(|| {
                WsClientError::MissingStreamerInfo("no streamerInfo entries".to_string())
            })?;
        serde_json::from_value(first.clone())
            .map_err(|err| WsClientError::MissingStreamerInfo(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamCommand {
    Login,
    Logout,
    Subs,
    Add,
    Unsubs,
    View,
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRequest {
    pub service: String,
    pub command: StreamCommand,
    #[serde(rename = "requestid")]
    pub request_id: RequestId,
    #[serde(rename = "SchwabClientCustomerId")]
    pub customer_id: String,
    #[serde(rename = "SchwabClientCorrelId")]
    pub correl_id: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ConnectedUnauthenticated,
    LoggedIn,
    Streaming,
    Reconnecting,
}

impl SessionState {
    pub fn is_logged_in(self) -> bool {
        matches!(self, SessionState::LoggedIn | SessionState::Streaming)
    }
}

/// Status code the streamer sends as either `"0"` or `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub i64);

impl<'de> Deserialize<'de> for ResponseCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(code) => Ok(ResponseCode(code)),
            Raw::Text(text) => text
                .trim()
                .parse()
                .map(ResponseCode)
                .map_err(|_| serde::de::Error::custom(format!("invalid response code {text:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseContent {
    #[serde(default)]
    pub code: Option<ResponseCode>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamResponse {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, rename = "requestid")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub code: Option<ResponseCode>,
    #[serde(default)]
    pub content: Option<ResponseContent>,
}

impl StreamResponse {
    pub fn code(&self) -> Option<i64> {
        self.code
            .or_else(|| self.content.as_ref().and_then(|content| content.code))
            .map(|code| code.0)
    }

    pub fn message(&self) -> Option<&str> {
        self.content.as_ref().and_then(|content| content.msg.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamData {
    pub service: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub content: Vec<Value>,
}

/// Decoded inbound frame.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Response(Vec<StreamResponse>),
    Data(Vec<StreamData>),
    Notify(Vec<Value>),
    Unknown(Value),
}

impl StreamEvent {
    pub fn from_value(value: Value) -> Self {
        if let Some(responses) = value.get("response") {
            if let Ok(parsed) = serde_json::from_value(responses.clone()) {
                return StreamEvent::Response(parsed);
            }
        }
        if let Some(data) = value.get("data") {
            if let Ok(parsed) = serde_json::from_value(data.clone()) {
                return StreamEvent::Data(parsed);
            }
        }
        if let Some(Value::Array(notify)) = value.get("notify") {
            return StreamEvent::Notify(notify.clone());
        }
        StreamEvent::Unknown(value)
    }
}

/// Check a login reply. Success means some response entry carries code 0.
pub fn check_login_response(frame: &Value) -> Result<(), String> {
    let responses: Vec<StreamResponse> = frame
        .get("response")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|err| format!("malformed login response: {err}"))?
        .ok_or_else(|| format!("login reply has no response entries: {frame}"))?;

    if responses.iter().any(|response| response.code() == Some(0)) {
        return Ok(());
    }

    let detail = responses
        .iter()
        .map(|response| match (response.code(), response.message()) {
            (Some(code), Some(msg)) => format!("code {code}: {msg}"),
            (Some(code), None) => format!("code {code}"),
            (None, Some(msg)) => msg.to_string(),
            (None, None) => "no code".to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ");
    Err(detail)
}

/// Supplies connection metadata and the bearer token each time a session is opened.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn session_info(&self) -> WsResult<StreamerSessionInfo>;
    async fn access_token(&self) -> WsResult<String>;
}

#[derive(Debug, Clone)]
struct Subscription {
    keys: Vec<String>,
    fields: String,
}

enum ReceiveOutcome {
    Stopped,
    Closed,
    Failed(String),
}

/// Streaming session handle. Clones share one connection.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn SessionSource>,
    config: StreamConfig,
    next_request_id: AtomicU64,
    active: AtomicBool,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    sink: Mutex<Option<WsSink>>,
    session: Mutex<Option<StreamerSessionInfo>>,
    subscriptions: Mutex<BTreeMap<String, Subscription>>,
    logged_in_at: Mutex<Option<Instant>>,
}

impl StreamClient {
    pub fn new(source: Arc<dyn SessionSource>, config: StreamConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                next_request_id: AtomicU64::new(config.request_id_seed),
                source,
                config,
                active: AtomicBool::new(false),
                state,
                shutdown,
                sink: Mutex::new(None),
                session: Mutex::new(None),
                subscriptions: Mutex::new(BTreeMap::new()),
                logged_in_at: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn session_info(&self) -> Option<StreamerSessionInfo> {
        self.inner.session.lock().await.clone()
    }

    /// Id the next request will carry.
    pub fn peek_request_id(&self) -> RequestId {
        RequestId::new(self.inner.next_request_id.load(Ordering::SeqCst))
    }

    /// Fetch fresh streamer connection info. Re-arms a stopped session.
    pub async fn start(&self) -> WsResult<StreamerSessionInfo> {
        self.inner.shutdown.send_replace(false);
        self.fetch_session_info().await
    }

    /// Open the socket for the info fetched by [`start`](Self::start).
    pub async fn connect(&self) -> WsResult<WsReader> {
        let info = self.session_info().await.ok_or_else(|| {
            WsClientError::MissingStreamerInfo("start() has not fetched session info".to_string())
        })?;
        self.set_state(SessionState::Connecting);

        let url = match Url::parse(&info.socket_url) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(url = %info.socket_url, error = %err, "invalid streamer url");
                self.set_state(SessionState::Disconnected);
                return Err(err.into());
            }
        };

        let (socket, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                tracing::error!(url = %url, error = %err, "failed to connect");
                self.set_state(SessionState::Disconnected);
                return Err(err.into());
            }
        };

        let (sink, reader) = socket.split();
        *self.inner.sink.lock().await = Some(sink);
        self.inner.active.store(true, Ordering::SeqCst);
        self.set_state(SessionState::ConnectedUnauthenticated);
        tracing::info!(url = %url, "connection established");
        Ok(reader)
    }

    /// Send LOGIN and wait for exactly one reply frame.
    pub async fn login(&self, reader: &mut WsReader) -> WsResult<()> {
        let info = self.require_session().await?;
        let token = self.inner.source.access_token().await?;

        let mut parameters = Map::new();
        parameters.insert("Authorization".to_string(), Value::String(token));
        parameters.insert(
            "SchwabClientChannel".to_string(),
            Value::String(info.client_channel.clone()),
        );
        parameters.insert(
            "SchwabClientFunctionId".to_string(),
            Value::String(info.function_id.clone()),
        );
        let request = self.build_request(&info, ADMIN_SERVICE, StreamCommand::Login, parameters);
        self.send_raw(&request).await?;

        let timeout = self.inner.config.login_timeout();
        let reply = match tokio::time::timeout(timeout, next_text_frame(reader)).await {
            Ok(reply) => reply,
            Err(_) => Err(WsClientError::LoginTimedOut(timeout)),
        };

        let verdict = reply.and_then(|text| {
            let frame: Value = serde_json::from_str(&text)
                .map_err(|err| WsClientError::LoginRejected(format!("undecodable reply: {err}")))?;
            check_login_response(&frame).map_err(WsClientError::LoginRejected)
        });

        match verdict {
            Ok(()) => {
                *self.inner.logged_in_at.lock().await = Some(Instant::now());
                self.set_state(SessionState::LoggedIn);
                tracing::info!(request_id = %request.request_id, "login successful");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "login failed");
                self.close_transport().await;
                self.set_state(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    /// `start` + `connect` + `login`.
    pub async fn open(&self) -> WsResult<WsReader> {
        self.inner.shutdown.send_replace(false);
        self.open_session().await
    }

    /// Resolves once the session is logged in.
    pub async fn wait_logged_in(&self, timeout: Duration) -> WsResult<()> {
        let mut state = self.watch_state();
        let outcome = match tokio::time::timeout(timeout, state.wait_for(|s| s.is_logged_in())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(WsClientError::NotLoggedIn),
            Err(_) => Err(WsClientError::LoginTimedOut(timeout)),
        };
        outcome
    }

    /// Build a request with the next request id.
    pub async fn request(
        &self,
        service: &str,
        command: StreamCommand,
        parameters: Map<String, Value>,
    ) -> WsResult<StreamRequest> {
        let info = self.require_session().await?;
        Ok(self.build_request(&info, service, command, parameters))
    }

    /// SUBS `keys` on `service`. Replaces any earlier subscription to that service
    /// and is replayed after a reconnect.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        service: &str,
        keys: &[S],
        fields: &[u32],
    ) -> WsResult<RequestId> {
        self.require_logged_in()?;
        let subscription = Subscription {
            keys: keys.iter().map(|key| key.as_ref().to_string()).collect(),
            fields: join_fields(fields),
        };
        let request = self
            .request(service, StreamCommand::Subs, subscription_parameters(&subscription))
            .await?;
        // Recorded first so a reconnect racing this send still replays it.
        self.inner
            .subscriptions
            .lock()
            .await
            .insert(request.service.clone(), subscription);
        self.send(&request).await?;
        Ok(request.request_id)
    }

    /// UNSUBS `keys` from `service`.
    pub async fn unsubscribe<S: AsRef<str>>(&self, service: &str, keys: &[S]) -> WsResult<RequestId> {
        self.require_logged_in()?;
        let keys: Vec<String> = keys.iter().map(|key| key.as_ref().to_string()).collect();
        let mut parameters = Map::new();
        parameters.insert("keys".to_string(), Value::String(format_list(&keys)));
        let request = self.request(service, StreamCommand::Unsubs, parameters).await?;
        self.send(&request).await?;

        let mut subscriptions = self.inner.subscriptions.lock().await;
        let service = service.to_ascii_uppercase();
        if let Some(existing) = subscriptions.get_mut(&service) {
            existing.keys.retain(|key| !keys.contains(key));
            if existing.keys.is_empty() {
                subscriptions.remove(&service);
            }
        }
        Ok(request.request_id)
    }

    /// Send one request. Rejected, not queued, while the session is inactive.
    pub async fn send(&self, request: &StreamRequest) -> WsResult<()> {
        if !self.is_active() {
            tracing::warn!(request_id = %request.request_id, "stream is not active, nothing sent");
            return Err(WsClientError::Inactive(request.request_id.to_string()));
        }
        self.send_raw(request).await
    }

    /// Send several requests in one `{"requests": [...]}` frame.
    pub async fn send_batch(&self, requests: &[StreamRequest]) -> WsResult<()> {
        let ids = requests
            .iter()
            .map(|request| request.request_id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        if !self.is_active() {
            tracing::warn!(request_ids = %ids, "stream is not active, nothing sent");
            return Err(WsClientError::Inactive(ids));
        }
        let payload = json!({ "requests": requests }).to_string();
        self.send_message(Message::Text(payload)).await
    }

    /// Drive the receive loop until the remote closes cleanly, [`stop`](Self::stop)
    /// is called, or a failure cannot be recovered.
    ///
    /// Transport failures reconnect after `reconnect_delay`, fetching new session
    /// info and logging in again; failures inside `rapid_failure_window` of the
    /// last login are returned as [`WsClientError::RapidFailure`].
    pub async fn run<F>(&self, reader: WsReader, mut handler: F) -> WsResult<()>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut reader = reader;

        loop {
            if *shutdown.borrow_and_update() {
                self.finish_stopped().await;
                return Ok(());
            }
            self.set_state(SessionState::Streaming);

            match self.receive(&mut reader, &mut handler, &mut shutdown).await {
                ReceiveOutcome::Stopped => {
                    self.finish_stopped().await;
                    return Ok(());
                }
                ReceiveOutcome::Closed => {
                    tracing::info!("stream has closed");
                    self.close_transport().await;
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                ReceiveOutcome::Failed(reason) => {
                    self.close_transport().await;
                    let uptime = self.uptime().await;
                    let window = self.inner.config.rapid_failure_window();
                    if uptime < window {
                        tracing::error!(?uptime, %reason, "stream failed too soon after login, giving up");
                        self.set_state(SessionState::Disconnected);
                        return Err(WsClientError::RapidFailure { uptime, window });
                    }

                    tracing::warn!(?uptime, %reason, "connection lost, reconnecting");
                    match self.reconnect(&mut shutdown).await {
                        Ok(Some(next)) => reader = next,
                        Ok(None) => {
                            self.finish_stopped().await;
                            return Ok(());
                        }
                        Err(err) => {
                            self.close_transport().await;
                            self.set_state(SessionState::Disconnected);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Best-effort LOGOUT, then close. Safe to call repeatedly or before login.
    pub async fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }

        if self.is_active() {
            if let Some(info) = self.session_info().await {
                let request =
                    self.build_request(&info, ADMIN_SERVICE, StreamCommand::Logout, Map::new());
                let timeout = self.inner.config.logout_timeout();
                match tokio::time::timeout(timeout, self.send_raw(&request)).await {
                    Ok(Ok(())) => tracing::debug!(request_id = %request.request_id, "logout sent"),
                    Ok(Err(err)) => tracing::debug!(error = %err, "logout not sent"),
                    Err(_) => tracing::debug!("logout send timed out"),
                }
            }
        }

        self.close_transport().await;
        self.set_state(SessionState::Disconnected);
        tracing::info!("connection closed");
    }

    fn is_stopped(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "session state");
        }
    }

    fn require_logged_in(&self) -> WsResult<()> {
        if self.state().is_logged_in() {
            Ok(())
        } else {
            tracing::warn!(state = ?self.state(), "request rejected before login");
            Err(WsClientError::NotLoggedIn)
        }
    }

    async fn require_session(&self) -> WsResult<StreamerSessionInfo> {
        self.session_info()
            .await
            .ok_or_else(|| WsClientError::MissingStreamerInfo("session not started".to_string()))
    }

    fn build_request(
        &self,
        info: &StreamerSessionInfo,
        service: &str,
        command: StreamCommand,
        parameters: Map<String, Value>,
    ) -> StreamRequest {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        StreamRequest {
            service: service.to_ascii_uppercase(),
            command,
            request_id: RequestId::new(id),
            customer_id: info.customer_id.clone(),
            correl_id: info.correl_id.clone(),
            parameters,
        }
    }

    async fn fetch_session_info(&self) -> WsResult<StreamerSessionInfo> {
        let info = match self.inner.source.session_info().await {
            Ok(info) => info,
            Err(err) => {
                tracing::error!(error = %err, "failed to get streamer info");
                return Err(err);
            }
        };
        *self.inner.session.lock().await = Some(info.clone());
        Ok(info)
    }

    async fn open_session(&self) -> WsResult<WsReader> {
        self.fetch_session_info().await?;
        let mut reader = self.connect().await?;
        self.login(&mut reader).await?;
        Ok(reader)
    }

    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> WsResult<Option<WsReader>> {
        let delay = self.inner.config.reconnect_delay();
        let mut attempts = 0u32;

        loop {
            if let Some(max) = self.inner.config.max_reconnect_attempts {
                if attempts >= max {
                    self.set_state(SessionState::Disconnected);
                    return Err(WsClientError::ReconnectExhausted(max));
                }
            }
            attempts += 1;
            self.set_state(SessionState::Reconnecting);

            tracing::warn!(attempt = attempts, ?delay, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stopped| *stopped) => return Ok(None),
            }

            let opened = tokio::select! {
                opened = self.open_session() => opened,
                _ = shutdown.wait_for(|stopped| *stopped) => return Ok(None),
            };

            match opened {
                Ok(reader) => {
                    if self.is_stopped() {
                        return Ok(None);
                    }
                    if let Err(err) = self.replay_subscriptions().await {
                        tracing::error!(attempt = attempts, error = %err, "restoring subscriptions failed");
                        self.close_transport().await;
                        continue;
                    }
                    tracing::info!(attempt = attempts, "reconnect completed");
                    return Ok(Some(reader));
                }
                Err(err @ WsClientError::LoginRejected(_)) => {
                    self.set_state(SessionState::Disconnected);
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(attempt = attempts, error = %err, "reconnection failed");
                }
            }
        }
    }

    /// Leave the session closed after a stop, whatever a racing reconnect left behind.
    async fn finish_stopped(&self) {
        self.close_transport().await;
        self.set_state(SessionState::Disconnected);
    }

    async fn replay_subscriptions(&self) -> WsResult<()> {
        let snapshot: Vec<(String, Subscription)> = self
            .inner
            .subscriptions
            .lock()
            .await
            .iter()
            .map(|(service, subscription)| (service.clone(), subscription.clone()))
            .collect();

        for (service, subscription) in snapshot {
            let request = self
                .request(&service, StreamCommand::Subs, subscription_parameters(&subscription))
                .await?;
            self.send(&request).await?;
            tracing::info!(%service, request_id = %request.request_id, "subscription restored");
        }
        Ok(())
    }

    async fn receive<F>(
        &self,
        reader: &mut WsReader,
        handler: &mut F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReceiveOutcome
    where
        F: FnMut(StreamEvent) + Send,
    {
        loop {
            let frame = tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => return ReceiveOutcome::Stopped,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => dispatch(&text, handler),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => dispatch(&text, handler),
                    Err(_) => tracing::warn!("dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = self.send_message(Message::Pong(payload)).await {
                        tracing::debug!(error = %err, "failed to answer ping");
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    if self.is_stopped() {
                        return ReceiveOutcome::Stopped;
                    }
                    return match frame {
                        Some(frame) if !is_clean_close(&frame) => ReceiveOutcome::Failed(format!(
                            "closed with code {}: {}",
                            u16::from(frame.code),
                            frame.reason
                        )),
                        _ => ReceiveOutcome::Closed,
                    };
                }
                Some(Err(err)) => {
                    if self.is_stopped() {
                        return ReceiveOutcome::Stopped;
                    }
                    return ReceiveOutcome::Failed(err.to_string());
                }
                None => {
                    if self.is_stopped() {
                        return ReceiveOutcome::Stopped;
                    }
                    return ReceiveOutcome::Failed("stream ended without a close frame".to_string());
                }
            }
        }
    }

    async fn uptime(&self) -> Duration {
        self.inner
            .logged_in_at
            .lock()
            .await
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    async fn send_raw(&self, request: &StreamRequest) -> WsResult<()> {
        let payload = serde_json::to_string(request)?;
        self.send_message(Message::Text(payload)).await?;
        tracing::debug!(
            service = %request.service,
            command = ?request.command,
            request_id = %request.request_id,
            "request sent"
        );
        Ok(())
    }

    async fn send_message(&self, message: Message) -> WsResult<()> {
        let mut sink = self.inner.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or_else(|| WsClientError::Inactive("no open connection".to_string()))?;
        sink.send(message).await?;
        Ok(())
    }

    async fn close_transport(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let timeout = self.inner.config.logout_timeout();
            if let Ok(Err(err)) = tokio::time::timeout(timeout, sink.close()).await {
                tracing::debug!(error = %err, "error while closing socket");
            }
        }
    }
}

async fn next_text_frame(reader: &mut WsReader) -> WsResult<String> {
    while let Some(message) = reader.next().await {
        match message? {
            Message::Text(text) => return Ok(text),
            Message::Binary(bytes) => {
                return String::from_utf8(bytes)
                    .map_err(|_| WsClientError::InvalidMessage("invalid utf8 payload".to_string()))
            }
            Message::Close(_) => return Err(WsClientError::ClosedDuringLogin),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Err(WsClientError::ClosedDuringLogin)
}

fn dispatch<F>(text: &str, handler: &mut F)
where
    F: FnMut(StreamEvent),
{
    match serde_json::from_str::<Value>(text) {
        Ok(value) => handler(StreamEvent::from_value(value)),
        Err(err) => {
            let preview: String = text.chars().take(100).collect();
            tracing::warn!(error = %err, frame = %preview, "dropping undecodable frame");
        }
    }
}

fn is_clean_close(frame: &CloseFrame<'_>) -> bool {
    matches!(frame.code, CloseCode::Normal | CloseCode::Away)
}

fn join_fields(fields: &[u32]) -> String {
    fields
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn subscription_parameters(subscription: &Subscription) -> Map<String, Value> {
    let mut parameters = Map::new();
    parameters.insert(
        "keys".to_string(),
        Value::String(format_list(&subscription.keys)),
    );
    if !subscription.fields.is_empty() {
        parameters.insert(
            "fields".to_string(),
            Value::String(subscription.fields.clone()),
        );
    }
    parameters
}
