use std::{sync::Arc, time::Duration};

use rand::Rng;
use reqwest::{header::LOCATION, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::{
    auth::TokenManager,
    errors::{Error, Result, ServerErr},
    params::QueryParams,
};
use crate::{errors::AuthError, types::OrderId};

/// Outcome of a successful REST call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Json(Value),
    /// 201 on an order path with a `Location` header.
    OrderPlaced(OrderPlaced),
    /// Empty body, or a 201 order response that lacked `Location`.
    NoContent,
    /// 2xx body that was not JSON.
    Text(String),
}

impl ApiResponse {
    pub fn into_json(self) -> Option<Value> {
        match self {
            ApiResponse::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn order_placed(&self) -> Option<&OrderPlaced> {
        match self {
            ApiResponse::OrderPlaced(placed) => Some(placed),
            _ => None,
        }
    }

    pub fn is_no_content(&self) -> bool {
        matches!(self, ApiResponse::NoContent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub success: bool,
}

/// A single REST call. Rebuilt on the wire for the 401 retry.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    url: Url,
    query: QueryParams,
    body: Option<Value>,
    probe: bool,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            query: QueryParams::default(),
            body: None,
            probe: false,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: Url) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Skip the pre-flight token check. Used to probe whether the held token still works.
    pub fn probe(mut self) -> Self {
        self.probe = true;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

/// Random pause inserted before every request.
#[derive(Debug, Clone, Copy)]
pub struct RequestPacing {
    min: Duration,
    max: Duration,
}

impl RequestPacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    fn delay(&self) -> Duration {
        if self.max.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

impl Default for RequestPacing {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(1500))
    }
}

/// Bearer-authenticated REST executor.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    pacing: RequestPacing,
}

impl RestClient {
    pub(crate) fn new(http: reqwest::Client, tokens: Arc<TokenManager>, pacing: RequestPacing) -> Self {
        Self {
            http,
            tokens,
            pacing,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub async fn execute(
        &self,
        method: Method,
        url: Url,
        params: Option<QueryParams>,
        body: Option<Value>,
    ) -> Result<ApiResponse> {
        let mut request = ApiRequest::new(method, url);
        if let Some(params) = params {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await
    }

    /// Run `request`, replacing the token and retrying exactly once on 401.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let delay = self.pacing.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !request.probe {
            self.tokens.ensure_valid().await?;
        }

        let token = self.held_token().await?;
        tracing::debug!(method = %request.method, url = %request.url, "sending request");
        let mut response = self.dispatch(&request, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(url = %request.url, "token rejected during request, replacing it");
            self.tokens.replace_rejected(&token).await?;
            let token = self.held_token().await?;
            response = self.dispatch(&request, &token).await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(url = %request.url, "request still unauthorized after token replacement");
                return Err(Error::Unauthorized { body });
            }
        }

        interpret(&request.url, response).await
    }

    async fn held_token(&self) -> Result<String> {
        self.tokens
            .current_token()
            .await
            .ok_or(Error::Auth(AuthError::NoToken))
    }

    async fn dispatch(&self, request: &ApiRequest, token: &str) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .bearer_auth(token);
        if !request.query.is_empty() {
            builder = builder.query(request.query.pairs());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }
}

async fn interpret(url: &Url, response: reqwest::Response) -> Result<ApiResponse> {
    let status = response.status();

    if status == StatusCode::CREATED && is_order_path(url.path()) {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        return Ok(match location.as_deref().and_then(order_id_from_location) {
            Some(order_id) => {
                tracing::debug!(%order_id, "order placed");
                ApiResponse::OrderPlaced(OrderPlaced {
                    order_id,
                    success: true,
                })
            }
            None => {
                tracing::error!(url = %url, "201 response without a location header");
                ApiResponse::NoContent
            }
        });
    }

    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(http_error(status, &body));
    }

    if body.is_empty() {
        tracing::debug!(url = %url, "empty response content");
        return Ok(ApiResponse::NoContent);
    }

    match serde_json::from_slice::<Value>(&body) {
        Ok(value) => Ok(ApiResponse::Json(value)),
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "response body is not json");
            Ok(ApiResponse::Text(String::from_utf8_lossy(&body).into_owned()))
        }
    }
}

fn http_error(status: StatusCode, body: &[u8]) -> Error {
    if let Ok(parsed) = serde_json::from_slice::<ServerErr>(body) {
        if let Some(message) = parsed.into_message() {
            return Error::Server {
                status: status.as_u16(),
                message,
            };
        }
    }
    Error::Http {
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

/// `.../accounts/{hash}/orders[/...]`
pub(crate) fn is_order_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments
        .iter()
        .position(|segment| *segment == "accounts")
        .map(|at| segments.iter().skip(at + 2).any(|segment| *segment == "orders"))
        .unwrap_or(false)
}

pub(crate) fn order_id_from_location(location: &str) -> Option<OrderId> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(OrderId::new)
}
