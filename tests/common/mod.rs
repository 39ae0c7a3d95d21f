#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, Method, StatusCode},
    response::Response,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use schwab_client::{
    AuthResult, AuthorizationPrompt, ClientConfig, ClientIdentity, RequestPacing, SchwabClient,
    SessionSource, StreamConfig, StreamerSessionInfo, TokenCache, TokenRecord, WsResult,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use url::Url;

pub const CALLBACK: &str = "https://127.0.0.1/cb";

pub fn identity() -> ClientIdentity {
    ClientIdentity::new("appkey", "appsecret", CALLBACK, "T1").unwrap()
}

/// Counts and scripts for the mock OAuth + API server.
#[derive(Default)]
pub struct HttpState {
    pub token_calls: AtomicUsize,
    pub api_calls: AtomicUsize,
    pub grants: Mutex<Vec<HashMap<String, String>>>,
    pub issued: AtomicUsize,
    pub reject_refresh: AtomicBool,
    pub always_unauthorized: AtomicBool,
    pub streamer_url: Mutex<Option<String>>,
}

impl HttpState {
    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn api_calls(&self) -> usize {
        self.api_calls.load(Ordering::SeqCst)
    }

    pub fn grant_types(&self) -> Vec<String> {
        self.grants
            .lock()
            .unwrap()
            .iter()
            .map(|form| form.get("grant_type").cloned().unwrap_or_default())
            .collect()
    }
}

pub async fn spawn_http() -> (String, Arc<HttpState>) {
    let state = Arc::new(HttpState::default());
    let app = {
        let state = state.clone();
        Router::new().fallback(move |req: Request| {
            let state = state.clone();
            async move { handle(req, state).await }
        })
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), state)
}

fn json_response(status: StatusCode, body: Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

async fn handle(req: Request, state: Arc<HttpState>) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::POST && path == "/v1/oauth/token" {
        return token_endpoint(req, &state).await;
    }

    state.api_calls.fetch_add(1, Ordering::SeqCst);
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned);

    let authorized = match bearer.as_deref() {
        None => false,
        Some(token) => !token.starts_with("stale") && !state.always_unauthorized.load(Ordering::SeqCst),
    };
    if !authorized {
        return json_response(StatusCode::UNAUTHORIZED, json!({"message": "Unauthorized"}));
    }

    match (method, path.as_str()) {
        (m, "/marketdata/quotes") if m == Method::GET => json_response(
            StatusCode::OK,
            json!({"AAPL": {"quote": {"lastPrice": 190.5}}}),
        ),
        (m, "/marketdata/chains") if m == Method::GET => {
            json_response(StatusCode::OK, json!({"symbol": "AAPL", "status": "SUCCESS"}))
        }
        (m, "/marketdata/BRK%2FB/quotes") if m == Method::GET => {
            json_response(StatusCode::OK, json!({"BRK/B": {}}))
        }
        (m, "/accounts/HASH1/orders") if m == Method::POST => Response::builder()
            .status(StatusCode::CREATED)
            .header(header::LOCATION, "/accounts/HASH1/orders/12345")
            .body(Body::empty())
            .unwrap(),
        (m, "/accounts/NOLOC/orders") if m == Method::POST => empty_response(StatusCode::CREATED),
        (m, "/accounts/HASH1/orders/12345") if m == Method::DELETE => {
            empty_response(StatusCode::OK)
        }
        (m, "/accounts/HASH1/orders/999") if m == Method::GET => json_response(
            StatusCode::NOT_FOUND,
            json!({"errors": [{"title": "Not Found", "detail": "Order 999 not found"}]}),
        ),
        (m, "/text") if m == Method::GET => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("plain text"))
            .unwrap(),
        (m, "/userPreference") if m == Method::GET => {
            let url = state.streamer_url.lock().unwrap().clone().unwrap_or_default();
            json_response(
                StatusCode::OK,
                json!({
                    "accounts": [],
                    "streamerInfo": [{
                        "streamerSocketUrl": url,
                        "schwabClientCustomerId": "cust-1",
                        "schwabClientCorrelId": "corr-1",
                        "schwabClientChannel": "N9",
                        "schwabClientFunctionId": "APIAPP"
                    }]
                }),
            )
        }
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

async fn token_endpoint(req: Request, state: &HttpState) -> Response {
    let basic = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("Basic "))
        .unwrap_or(false);
    let body = to_bytes(req.into_body(), usize::MAX).await.unwrap();
    let form: HashMap<String, String> = url::form_urlencoded::parse(&body).into_owned().collect();

    state.token_calls.fetch_add(1, Ordering::SeqCst);
    let grant = form.get("grant_type").cloned().unwrap_or_default();
    state.grants.lock().unwrap().push(form);

    if !basic {
        return json_response(StatusCode::UNAUTHORIZED, json!({"error": "invalid_client"}));
    }
    if grant == "refresh_token" && state.reject_refresh.load(Ordering::SeqCst) {
        return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid_grant"}));
    }

    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    json_response(
        StatusCode::OK,
        json!({
            "access_token": format!("access-{n}"),
            "refresh_token": format!("refresh-{n}"),
            "expires_in": 1800,
            "token_type": "Bearer",
            "scope": "api"
        }),
    )
}

/// Operator stand-in that pastes back a fixed redirect URL.
pub struct ScriptedPrompt {
    redirect: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(redirect: impl Into<String>) -> Arc<Self> {
        Self::with_delay(redirect, Duration::ZERO)
    }

    pub fn with_delay(redirect: impl Into<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            redirect: redirect.into(),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorizationPrompt for ScriptedPrompt {
    async fn redirect_url(&self, consent_url: &Url) -> AuthResult<String> {
        assert!(consent_url.as_str().contains("response_type=code"));
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.redirect.clone())
    }
}

pub fn sandbox_config(base_url: &str, token_dir: &Path) -> ClientConfig {
    let mut config = ClientConfig::sandbox(base_url);
    config.token_dir = token_dir.to_path_buf();
    config.token_refresh_buffer_secs = 0;
    config.stream = fast_stream_config();
    config
}

pub async fn build_client(
    base_url: &str,
    token_dir: &Path,
    prompt: Arc<ScriptedPrompt>,
) -> SchwabClient {
    SchwabClient::builder()
        .identity(identity())
        .config(sandbox_config(base_url, token_dir))
        .prompt(prompt)
        .pacing(RequestPacing::disabled())
        .build()
        .await
        .unwrap()
}

pub async fn seed_token(token_dir: &Path, record: &TokenRecord) {
    TokenCache::new(token_dir, &identity())
        .save(record)
        .await
        .unwrap();
}

pub fn fast_stream_config() -> StreamConfig {
    StreamConfig {
        reconnect_delay_secs: 0,
        rapid_failure_window_secs: 0,
        login_timeout_secs: 5,
        logout_timeout_ms: 200,
        request_id_seed: 0,
        max_reconnect_attempts: Some(3),
    }
}

/// How the mock streamer treats one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    Normal,
    RejectLogin,
    DropAfterSubs,
    CloseAfterSubs,
    /// Drop the socket right after acknowledging LOGIN.
    DropAfterLogin,
    /// Send a frame that is not JSON ahead of each SUBS reply.
    GarbageBeforeData,
}

#[derive(Default)]
pub struct WsState {
    pub received: Mutex<Vec<Value>>,
    pub connections: AtomicUsize,
}

impl WsState {
    pub fn commands(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|request| request["command"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn request_ids(&self) -> Vec<u64> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|request| request["requestid"].as_str().unwrap().parse().unwrap())
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }
}

pub struct MockStreamer {
    addr: SocketAddr,
    pub state: Arc<WsState>,
}

impl MockStreamer {
    /// Connection `n` is served with `modes[n]`, or the last mode once exhausted.
    pub async fn start(modes: Vec<ConnMode>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(WsState::default());

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = shared.connections.fetch_add(1, Ordering::SeqCst);
                let mode = modes
                    .get(index)
                    .or(modes.last())
                    .copied()
                    .unwrap_or(ConnMode::Normal);
                tokio::spawn(serve_connection(stream, mode, shared.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn info(&self) -> StreamerSessionInfo {
        StreamerSessionInfo {
            socket_url: self.url(),
            customer_id: "cust-1".to_string(),
            correl_id: "corr-1".to_string(),
            client_channel: "N9".to_string(),
            function_id: "APIAPP".to_string(),
        }
    }

    pub async fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut(&WsState) -> bool,
    {
        for _ in 0..200 {
            if condition(&self.state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("mock streamer condition not reached: {:?}", self.state.commands());
    }
}

async fn serve_connection(stream: TcpStream, mode: ConnMode, state: Arc<WsState>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let requests = match frame.get("requests") {
            Some(Value::Array(requests)) => requests.clone(),
            _ => vec![frame],
        };

        for request in requests {
            state.received.lock().unwrap().push(request.clone());
            let command = request["command"].as_str().unwrap_or_default().to_string();
            let request_id = request["requestid"].clone();

            match command.as_str() {
                "LOGIN" => {
                    let code = if mode == ConnMode::RejectLogin { "3" } else { "0" };
                    let reply = json!({"response": [{
                        "service": "ADMIN",
                        "command": "LOGIN",
                        "requestid": request_id,
                        "timestamp": 1,
                        "content": {"code": code, "msg": "login"}
                    }]});
                    let _ = ws.send(Message::Text(reply.to_string())).await;
                    if mode == ConnMode::DropAfterLogin {
                        return;
                    }
                }
                "SUBS" => {
                    if mode == ConnMode::GarbageBeforeData {
                        let _ = ws.send(Message::Text("not json".to_string())).await;
                    }
                    let ack = json!({"response": [{
                        "service": request["service"],
                        "command": "SUBS",
                        "requestid": request_id,
                        "content": {"code": 0, "msg": "SUBS command succeeded"}
                    }]});
                    let data = json!({"data": [{
                        "service": request["service"],
                        "timestamp": 2,
                        "command": "SUBS",
                        "content": [{"key": "AAPL", "1": 190.5, "2": 190.6}]
                    }]});
                    let _ = ws.send(Message::Text(ack.to_string())).await;
                    let _ = ws.send(Message::Text(data.to_string())).await;

                    match mode {
                        ConnMode::DropAfterSubs => return,
                        ConnMode::CloseAfterSubs => {
                            let _ = ws
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "done".into(),
                                })))
                                .await;
                        }
                        _ => {}
                    }
                }
                "LOGOUT" => {
                    let _ = ws.close(None).await;
                }
                _ => {}
            }
        }
    }
}

/// Session source pointing at a mock streamer, skipping the REST lookup.
pub struct StaticSource {
    info: StreamerSessionInfo,
    later_lookup_delay: Duration,
    pub info_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(info: StreamerSessionInfo) -> Arc<Self> {
        Self::slow_after_first(info, Duration::ZERO)
    }

    /// Every lookup after the first takes `delay`.
    pub fn slow_after_first(info: StreamerSessionInfo, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            info,
            later_lookup_delay: delay,
            info_calls: AtomicUsize::new(0),
            token_calls: AtomicUsize::new(0),
        })
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionSource for StaticSource {
    async fn session_info(&self) -> WsResult<StreamerSessionInfo> {
        let n = self.info_calls.fetch_add(1, Ordering::SeqCst);
        if n > 0 && !self.later_lookup_delay.is_zero() {
            tokio::time::sleep(self.later_lookup_delay).await;
        }
        Ok(self.info.clone())
    }

    async fn access_token(&self) -> WsResult<String> {
        let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("stream-token-{n}"))
    }
}
