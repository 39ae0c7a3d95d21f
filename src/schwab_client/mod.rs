mod auth;
mod client;
mod errors;
mod params;
mod rest;

pub use auth::{OAuthEndpoints, TokenManager, TokenStatus};
pub use client::{
    AccountsHandle, MarketDataHandle, OrderQuery, OrdersHandle, PriceHistoryQuery, SchwabClient,
    SchwabClientBuilder,
};
pub use errors::{Error, Result};
pub use params::{
    convert_time, format_list, ContractType, FrequencyType, PeriodType, Projection, QueryParams,
    TimeFormat,
};
pub use rest::{ApiRequest, ApiResponse, OrderPlaced, RequestPacing, RestClient};
