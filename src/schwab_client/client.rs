use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use url::Url;

use super::{
    auth::{OAuthEndpoints, TokenManager},
    errors::{Error, Result},
    params::{
        ContractType, FrequencyType, PeriodType, Projection, QueryParams, TimeFormat,
    },
    rest::{ApiRequest, ApiResponse, RequestPacing, RestClient},
};
use crate::{
    config::ClientConfig,
    credentials::ClientIdentity,
    errors::{WsClientError, WsResult},
    prompt::{AuthorizationPrompt, ConsolePrompt},
    token_cache::TokenCache,
    types::{AccountHash, OrderId},
    ws_client::{SessionSource, StreamClient, StreamConfig, StreamerSessionInfo},
};

/// Schwab Trader API client: accounts, orders, market data and streaming.
///
/// Every call goes through one [`RestClient`], which keeps the OAuth2 token
/// valid and replaces it once when the server answers 401.
#[derive(Clone)]
pub struct SchwabClient {
    rest: RestClient,
    tokens: Arc<TokenManager>,
    config: ClientConfig,
}

impl SchwabClient {
    /// Create a new builder used to configure a [`SchwabClient`].
    pub fn builder() -> SchwabClientBuilder {
        SchwabClientBuilder {
            identity: None,
            config: ClientConfig::default(),
            prompt: None,
            pacing: None,
            http: None,
        }
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Access account REST helpers.
    pub fn accounts(&self) -> AccountsHandle<'_> {
        AccountsHandle { c: self }
    }

    /// Access order REST helpers.
    pub fn orders(&self) -> OrdersHandle<'_> {
        OrdersHandle { c: self }
    }

    /// Access market data REST helpers.
    pub fn market_data(&self) -> MarketDataHandle<'_> {
        MarketDataHandle { c: self }
    }

    pub async fn user_preferences(&self) -> Result<Value> {
        let url = self.config.trader_url("userPreference")?;
        self.get(url, QueryParams::new()).await
    }

    pub async fn streamer_info(&self) -> Result<StreamerSessionInfo> {
        let preferences = self.user_preferences().await?;
        Ok(StreamerSessionInfo::from_user_preferences(&preferences)?)
    }

    /// Check the held token.
    ///
    /// Without `force` only the local expiry is consulted and no request is
    /// made. With `force` a cheap market data call is sent, going through the
    /// usual 401 replacement.
    pub async fn validate_token(&self, force: bool) -> bool {
        if !force {
            return matches!(
                self.tokens.current_record().await,
                Some(record) if record.is_valid_at(Utc::now())
            );
        }

        let url = match self.config.market_data_url("chains") {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(error = %err, "cannot build probe url");
                return false;
            }
        };
        let request = ApiRequest::get(url)
            .query(QueryParams::new().push("symbol", "AAPL"))
            .probe();
        match self.rest.send(request).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "token validation failed");
                false
            }
        }
    }

    /// Streaming session using the configured [`StreamConfig`].
    pub fn stream(&self) -> StreamClient {
        self.stream_with(self.config.stream.clone())
    }

    pub fn stream_with(&self, config: StreamConfig) -> StreamClient {
        let source = RestSessionSource {
            client: self.clone(),
        };
        StreamClient::new(Arc::new(source), config)
    }

    async fn get(&self, url: Url, params: QueryParams) -> Result<Value> {
        let response = self.rest.send(ApiRequest::get(url).query(params)).await?;
        Ok(into_value(response))
    }

    fn account_url(&self, hash: &AccountHash, tail: &[&str]) -> Result<Url> {
        let mut url = self.config.trader_url("accounts")?;
        push_segments(&mut url, std::iter::once(hash.as_str()).chain(tail.iter().copied()))?;
        Ok(url)
    }
}

/// Session metadata and bearer tokens for a [`StreamClient`], served by the REST client.
struct RestSessionSource {
    client: SchwabClient,
}

#[async_trait]
impl SessionSource for RestSessionSource {
    async fn session_info(&self) -> WsResult<StreamerSessionInfo> {
        match self.client.streamer_info().await {
            Ok(info) => Ok(info),
            Err(Error::Ws(err)) => Err(err),
            Err(err) => Err(WsClientError::SessionInfo(err.to_string())),
        }
    }

    async fn access_token(&self) -> WsResult<String> {
        Ok(self.client.tokens.access_token().await?)
    }
}

pub struct AccountsHandle<'a> {
    c: &'a SchwabClient,
}

impl<'a> AccountsHandle<'a> {
    /// Plain account numbers paired with the hashes every other call takes.
    pub async fn numbers(&self) -> Result<Value> {
        let url = self.c.config.trader_url("accounts/accountNumbers")?;
        self.c.get(url, QueryParams::new()).await
    }

    pub async fn all(&self, fields: Option<&str>) -> Result<Value> {
        let url = self.c.config.trader_url("accounts")?;
        self.c.get(url, QueryParams::new().push_opt("fields", fields)).await
    }

    pub async fn get(&self, hash: &AccountHash, fields: Option<&str>) -> Result<Value> {
        let url = self.c.account_url(hash, &[])?;
        self.c.get(url, QueryParams::new().push_opt("fields", fields)).await
    }

    pub async fn transactions(
        &self,
        hash: &AccountHash,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        types: &[&str],
        symbol: Option<&str>,
    ) -> Result<Value> {
        let url = self.c.account_url(hash, &["transactions"])?;
        let params = QueryParams::new()
            .push_time("startDate", Some(start), TimeFormat::Iso8601)
            .push_time("endDate", Some(end), TimeFormat::Iso8601)
            .push_list("types", types)
            .push_opt("symbol", symbol);
        self.c.get(url, params).await
    }

    pub async fn transaction(&self, hash: &AccountHash, transaction_id: &str) -> Result<Value> {
        let url = self.c.account_url(hash, &["transactions", transaction_id])?;
        self.c.get(url, QueryParams::new()).await
    }
}

/// Filters for order listings.
#[derive(Debug, Clone, Default)]
pub struct OrderQuery<'q> {
    pub max_results: Option<u32>,
    pub status: Option<&'q str>,
}

pub struct OrdersHandle<'a> {
    c: &'a SchwabClient,
}

impl<'a> OrdersHandle<'a> {
    /// Place an order. A `201` with a `Location` header yields
    /// [`ApiResponse::OrderPlaced`].
    pub async fn place(&self, hash: &AccountHash, order: Value) -> Result<ApiResponse> {
        let url = self.c.account_url(hash, &["orders"])?;
        self.c.rest.send(ApiRequest::post(url).json(order)).await
    }

    pub async fn get(&self, hash: &AccountHash, order_id: &OrderId) -> Result<Value> {
        let url = self.c.account_url(hash, &["orders", order_id.as_str()])?;
        self.c.get(url, QueryParams::new()).await
    }

    pub async fn list(
        &self,
        hash: &AccountHash,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        query: OrderQuery<'_>,
    ) -> Result<Value> {
        let url = self.c.account_url(hash, &["orders"])?;
        self.c.get(url, order_params(from, to, &query)).await
    }

    /// Orders across every linked account.
    pub async fn list_all(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        query: OrderQuery<'_>,
    ) -> Result<Value> {
        let url = self.c.config.trader_url("orders")?;
        self.c.get(url, order_params(from, to, &query)).await
    }

    pub async fn cancel(&self, hash: &AccountHash, order_id: &OrderId) -> Result<ApiResponse> {
        let url = self.c.account_url(hash, &["orders", order_id.as_str()])?;
        self.c.rest.send(ApiRequest::delete(url)).await
    }

    pub async fn replace(
        &self,
        hash: &AccountHash,
        order_id: &OrderId,
        order: Value,
    ) -> Result<ApiResponse> {
        let url = self.c.account_url(hash, &["orders", order_id.as_str()])?;
        self.c.rest.send(ApiRequest::put(url).json(order)).await
    }

    pub async fn preview(&self, hash: &AccountHash, order: Value) -> Result<Value> {
        let url = self.c.account_url(hash, &["previewOrder"])?;
        let response = self.c.rest.send(ApiRequest::post(url).json(order)).await?;
        Ok(into_value(response))
    }
}

fn order_params(from: DateTime<Utc>, to: DateTime<Utc>, query: &OrderQuery<'_>) -> QueryParams {
    QueryParams::new()
        .push_time("fromEnteredTime", Some(from), TimeFormat::Iso8601)
        .push_time("toEnteredTime", Some(to), TimeFormat::Iso8601)
        .push_opt("maxResults", query.max_results)
        .push_opt("status", query.status)
}

/// Price history window. Unset fields are left to the server defaults.
#[derive(Debug, Clone, Default)]
pub struct PriceHistoryQuery {
    pub period_type: Option<PeriodType>,
    pub period: Option<u32>,
    pub frequency_type: Option<FrequencyType>,
    pub frequency: Option<u32>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub need_extended_hours_data: Option<bool>,
    pub need_previous_close: Option<bool>,
}

pub struct MarketDataHandle<'a> {
    c: &'a SchwabClient,
}

impl<'a> MarketDataHandle<'a> {
    pub async fn quotes<S: AsRef<str>>(
        &self,
        symbols: &[S],
        fields: Option<&str>,
        indicative: Option<bool>,
    ) -> Result<Value> {
        let url = self.c.config.market_data_url("quotes")?;
        let params = QueryParams::new()
            .push_list("symbols", symbols)
            .push_opt("fields", fields)
            .push_opt("indicative", indicative);
        self.c.get(url, params).await
    }

    pub async fn quote(&self, symbol: &str, fields: Option<&str>) -> Result<Value> {
        let mut url = self.c.config.market_data_url("")?;
        push_segments(&mut url, [symbol, "quotes"])?;
        self.c.get(url, QueryParams::new().push_opt("fields", fields)).await
    }

    pub async fn option_chain(
        &self,
        symbol: &str,
        contract_type: Option<ContractType>,
        strike_count: Option<u32>,
    ) -> Result<Value> {
        let url = self.c.config.market_data_url("chains")?;
        let params = QueryParams::new()
            .push("symbol", symbol)
            .push_opt("contractType", contract_type)
            .push_opt("strikeCount", strike_count);
        self.c.get(url, params).await
    }

    pub async fn price_history(&self, symbol: &str, query: PriceHistoryQuery) -> Result<Value> {
        let url = self.c.config.market_data_url("pricehistory")?;
        let params = QueryParams::new()
            .push("symbol", symbol)
            .push_opt("periodType", query.period_type)
            .push_opt("period", query.period)
            .push_opt("frequencyType", query.frequency_type)
            .push_opt("frequency", query.frequency)
            .push_time("startDate", query.start, TimeFormat::EpochMillis)
            .push_time("endDate", query.end, TimeFormat::EpochMillis)
            .push_opt("needExtendedHoursData", query.need_extended_hours_data)
            .push_opt("needPreviousClose", query.need_previous_close);
        self.c.get(url, params).await
    }

    pub async fn movers(
        &self,
        index: &str,
        sort: Option<&str>,
        frequency: Option<u32>,
    ) -> Result<Value> {
        let mut url = self.c.config.market_data_url("movers")?;
        push_segments(&mut url, [index])?;
        let params = QueryParams::new()
            .push_opt("sort", sort)
            .push_opt("frequency", frequency);
        self.c.get(url, params).await
    }

    pub async fn market_hours<S: AsRef<str>>(
        &self,
        markets: &[S],
        date: Option<NaiveDate>,
    ) -> Result<Value> {
        let url = self.c.config.market_data_url("markets")?;
        let params = QueryParams::new()
            .push_list("markets", markets)
            .push_opt("date", date.map(|d| d.format("%Y-%m-%d").to_string()));
        self.c.get(url, params).await
    }

    pub async fn instruments(&self, symbol: &str, projection: Projection) -> Result<Value> {
        let url = self.c.config.market_data_url("instruments")?;
        let params = QueryParams::new()
            .push("symbol", symbol)
            .push("projection", projection);
        self.c.get(url, params).await
    }

    pub async fn instrument_by_cusip(&self, cusip: &str) -> Result<Value> {
        let mut url = self.c.config.market_data_url("instruments")?;
        push_segments(&mut url, [cusip])?;
        self.c.get(url, QueryParams::new()).await
    }
}

pub struct SchwabClientBuilder {
    identity: Option<ClientIdentity>,
    config: ClientConfig,
    prompt: Option<Arc<dyn AuthorizationPrompt>>,
    pacing: Option<RequestPacing>,
    http: Option<reqwest::Client>,
}

impl SchwabClientBuilder {
    pub fn identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the stdin prompt used for the authorization-code flow.
    pub fn prompt(mut self, prompt: Arc<dyn AuthorizationPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Override the pacing window from the config.
    pub fn pacing(mut self, pacing: RequestPacing) -> Self {
        self.pacing = Some(pacing);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the client and load any persisted token for its identity.
    ///
    /// No token exchange happens here; the first request, or an explicit
    /// [`TokenManager::ensure_valid`], does that.
    pub async fn build(self) -> Result<SchwabClient> {
        let identity = self.identity.ok_or(Error::InvalidConfig {
            field: "identity",
            why: "must be provided",
        })?;
        let config = self.config;
        config.validate()?;

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(config.request_timeout())
                .build()?,
        };

        let endpoints = OAuthEndpoints {
            authorize_url: config.authorize_url()?,
            token_url: config.token_url()?,
        };
        let prompt = self
            .prompt
            .unwrap_or_else(|| Arc::new(ConsolePrompt::new(config.prompt_timeout())));
        let cache = TokenCache::new(&config.token_dir, &identity);

        let tokens = Arc::new(
            TokenManager::new(identity, endpoints, cache, prompt, http.clone())
                .with_refresh_buffer(config.token_refresh_buffer()),
        );
        tokens.load().await;

        let pacing = self.pacing.unwrap_or_else(|| {
            let (min, max) = config.pacing();
            RequestPacing::new(min, max)
        });
        let rest = RestClient::new(http, Arc::clone(&tokens), pacing);

        Ok(SchwabClient {
            rest,
            tokens,
            config,
        })
    }
}

fn into_value(response: ApiResponse) -> Value {
    match response {
        ApiResponse::Json(value) => value,
        ApiResponse::NoContent => Value::Null,
        ApiResponse::Text(text) => Value::String(text),
        ApiResponse::OrderPlaced(placed) => {
            serde_json::to_value(placed).unwrap_or(Value::Null)
        }
    }
}

/// Append percent-encoded path segments, so symbols like `$SPX` or `BRK/B` stay one segment.
fn push_segments<'s>(url: &mut Url, segments: impl IntoIterator<Item = &'s str>) -> Result<()> {
    let mut path = url.path_segments_mut().map_err(|_| Error::InvalidConfig {
        field: "api_base_url",
        why: "cannot be a base url",
    })?;
    path.pop_if_empty();
    for segment in segments {
        path.push(segment);
    }
    Ok(())
}
