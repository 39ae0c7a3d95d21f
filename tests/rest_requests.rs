mod common;

use std::sync::atomic::Ordering;

use chrono::Utc;
use common::{build_client, seed_token, spawn_http, ScriptedPrompt};
use reqwest::Method;
use schwab_client::{
    AccountHash, ApiResponse, OrderId, SchwabClient, SchwabError, TokenRecord,
};
use serde_json::json;

const REDIRECT: &str = "https://127.0.0.1/cb?code=unused";

async fn client_with_token(access: &str) -> (SchwabClient, std::sync::Arc<common::HttpState>, tempfile::TempDir) {
    let (base, server) = spawn_http().await;
    let dir = tempfile::tempdir().unwrap();
    seed_token(
        dir.path(),
        &TokenRecord::new(access, "refresh-0", Utc::now(), chrono::Duration::hours(1)),
    )
    .await;
    let client = build_client(&base, dir.path(), ScriptedPrompt::new(REDIRECT)).await;
    (client, server, dir)
}

#[tokio::test]
async fn quotes_use_the_held_bearer_token() {
    let (client, server, _dir) = client_with_token("good").await;

    let quotes = client
        .market_data()
        .quotes(&["AAPL"], Some("quote"), None)
        .await
        .unwrap();

    assert_eq!(quotes["AAPL"]["quote"]["lastPrice"], json!(190.5));
    assert_eq!(server.api_calls(), 1);
    assert_eq!(server.token_calls(), 0);
}

#[tokio::test]
async fn unauthorized_response_replaces_token_and_retries_once() {
    let (client, server, _dir) = client_with_token("stale-1").await;

    let quotes = client
        .market_data()
        .quotes(&["AAPL"], None, None)
        .await
        .unwrap();

    assert!(quotes.get("AAPL").is_some());
    assert_eq!(server.api_calls(), 2);
    assert_eq!(server.grant_types(), vec!["refresh_token".to_string()]);
    assert_eq!(client.tokens().current_token().await.as_deref(), Some("access-1"));
}

#[tokio::test]
async fn second_unauthorized_response_is_an_error() {
    let (client, server, _dir) = client_with_token("good").await;
    server.always_unauthorized.store(true, Ordering::SeqCst);

    let err = client
        .market_data()
        .quotes(&["AAPL"], None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, SchwabError::Unauthorized { .. }));
    assert_eq!(err.status(), Some(401));
    assert_eq!(server.api_calls(), 2);
    assert_eq!(server.token_calls(), 1);
}

#[tokio::test]
async fn placed_order_id_comes_from_location() {
    let (client, _server, _dir) = client_with_token("good").await;
    let order = json!({"orderType": "MARKET", "session": "NORMAL", "duration": "DAY"});

    let placed = client
        .orders()
        .place(&AccountHash::from("HASH1"), order.clone())
        .await
        .unwrap();
    let placed = placed.order_placed().unwrap();
    assert_eq!(placed.order_id, OrderId::new("12345"));
    assert!(placed.success);

    let missing = client
        .orders()
        .place(&AccountHash::from("NOLOC"), order)
        .await
        .unwrap();
    assert!(missing.is_no_content());
}

#[tokio::test]
async fn empty_body_is_no_content() {
    let (client, _server, _dir) = client_with_token("good").await;

    let cancelled = client
        .orders()
        .cancel(&AccountHash::from("HASH1"), &OrderId::new("12345"))
        .await
        .unwrap();
    assert_eq!(cancelled, ApiResponse::NoContent);
}

#[tokio::test]
async fn non_json_body_is_returned_as_text() {
    let (client, _server, _dir) = client_with_token("good").await;
    let url = client.config().trader_url("text").unwrap();

    let response = client.rest().execute(Method::GET, url, None, None).await.unwrap();
    assert_eq!(response, ApiResponse::Text("plain text".to_string()));
}

#[tokio::test]
async fn structured_errors_surface_the_detail() {
    let (client, _server, _dir) = client_with_token("good").await;

    let err = client
        .orders()
        .get(&AccountHash::from("HASH1"), &OrderId::new("999"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchwabError::Server { status: 404, ref message } if message == "Order 999 not found"));
}

#[tokio::test]
async fn symbols_with_slashes_stay_one_segment() {
    let (client, _server, _dir) = client_with_token("good").await;
    let quote = client.market_data().quote("BRK/B", None).await.unwrap();
    assert!(quote.get("BRK/B").is_some());
}

#[tokio::test]
async fn validate_token_checks_locally_unless_forced() {
    let (client, server, _dir) = client_with_token("good").await;
    assert!(client.validate_token(false).await);
    assert_eq!(server.api_calls(), 0);

    assert!(client.validate_token(true).await);
    assert_eq!(server.api_calls(), 1);

    server.always_unauthorized.store(true, Ordering::SeqCst);
    assert!(client.validate_token(false).await);
    assert!(!client.validate_token(true).await);
}

#[tokio::test]
async fn expired_token_is_invalid_without_a_request() {
    let (base, server) = spawn_http().await;
    let dir = tempfile::tempdir().unwrap();
    seed_token(
        dir.path(),
        &TokenRecord::new(
            "good",
            "refresh-0",
            Utc::now() - chrono::Duration::hours(2),
            chrono::Duration::minutes(30),
        ),
    )
    .await;
    let client = build_client(&base, dir.path(), ScriptedPrompt::new(REDIRECT)).await;

    assert!(!client.validate_token(false).await);
    assert_eq!(server.api_calls(), 0);
    assert_eq!(server.token_calls(), 0);
}
