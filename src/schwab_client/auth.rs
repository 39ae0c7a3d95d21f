use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{watch, Mutex, MutexGuard};
use url::Url;

use crate::{
    credentials::ClientIdentity,
    errors::{AuthError, AuthResult},
    prompt::{extract_authorization_code, AuthorizationPrompt},
    token_cache::{TokenCache, TokenRecord},
};

/// Where the token manager sits in the OAuth2 lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    NoToken,
    Valid,
    Expired,
    Refreshing,
    AuthRequired,
}

/// OAuth2 endpoints used by [`TokenManager`].
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: Url,
    pub token_url: Url,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TokenResponse {
    fn into_record(self, issued_at: DateTime<Utc>, previous_refresh: Option<&str>) -> TokenRecord {
        let refresh_token = self
            .refresh_token
            .filter(|token| !token.is_empty())
            .or_else(|| previous_refresh.map(str::to_owned))
            .unwrap_or_default();
        let mut record = TokenRecord::new(
            self.access_token,
            refresh_token,
            issued_at,
            chrono::Duration::seconds(self.expires_in),
        );
        record.token_type = self.token_type;
        record.scope = self.scope;
        record.id_token = self.id_token;
        record
    }
}

enum Grant<'a> {
    AuthorizationCode { code: &'a str, redirect_uri: &'a str },
    RefreshToken { refresh_token: &'a str },
}

impl Grant<'_> {
    fn name(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode { .. } => "authorization_code",
            Grant::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// Owns the current [`TokenRecord`] and every transition between token states.
///
/// Refresh and interactive authorization run under one async lock, so at most
/// one exchange (and at most one operator prompt) is in flight.
pub struct TokenManager {
    identity: ClientIdentity,
    endpoints: OAuthEndpoints,
    http: reqwest::Client,
    cache: TokenCache,
    prompt: Arc<dyn AuthorizationPrompt>,
    refresh_buffer: chrono::Duration,
    record: Mutex<Option<TokenRecord>>,
    status: watch::Sender<TokenStatus>,
}

impl TokenManager {
    pub fn new(
        identity: ClientIdentity,
        endpoints: OAuthEndpoints,
        cache: TokenCache,
        prompt: Arc<dyn AuthorizationPrompt>,
        http: reqwest::Client,
    ) -> Self {
        let (status, _) = watch::channel(TokenStatus::NoToken);
        Self {
            identity,
            endpoints,
            http,
            cache,
            prompt,
            refresh_buffer: chrono::Duration::zero(),
            record: Mutex::new(None),
            status,
        }
    }

    /// Refresh this long before the recorded expiry.
    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer =
            chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn status(&self) -> TokenStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<TokenStatus> {
        self.status.subscribe()
    }

    /// `true` iff `now < expires_at`.
    pub fn is_valid(record: &TokenRecord, now: DateTime<Utc>) -> bool {
        record.is_valid_at(now)
    }

    fn is_usable(&self, record: &TokenRecord, now: DateTime<Utc>) -> bool {
        record.is_valid_at(now + self.refresh_buffer)
    }

    /// Read the persisted record for this identity into memory.
    pub async fn load(&self) -> TokenStatus {
        let loaded = self.cache.load().await;
        let mut guard = self.record.lock().await;
        *guard = loaded;
        let status = match guard.as_ref() {
            None => TokenStatus::NoToken,
            Some(record) if self.is_usable(record, Utc::now()) => TokenStatus::Valid,
            Some(_) => TokenStatus::Expired,
        };
        self.status.send_replace(status);
        tracing::info!(?status, "token loaded");
        status
    }

    /// Make sure a usable token is held, refreshing or authorizing as needed.
    pub async fn ensure_valid(&self) -> AuthResult<()> {
        self.ensure_valid_at(Utc::now()).await
    }

    pub async fn ensure_valid_at(&self, now: DateTime<Utc>) -> AuthResult<()> {
        let mut guard = self.record.lock().await;
        let refreshable = match guard.as_ref() {
            Some(record) if self.is_usable(record, now) => {
                self.status.send_replace(TokenStatus::Valid);
                return Ok(());
            }
            Some(record) => record.has_refresh_token(),
            None => false,
        };

        if refreshable {
            tracing::info!("access token expired, refreshing");
            self.status.send_replace(TokenStatus::Expired);
            self.refresh_locked(&mut guard).await
        } else {
            self.authorize_locked(&mut guard).await
        }
    }

    /// Exchange the stored refresh token, falling back to [`authorize`](Self::authorize)
    /// when the token endpoint rejects it.
    pub async fn refresh(&self) -> AuthResult<()> {
        let mut guard = self.record.lock().await;
        self.refresh_locked(&mut guard).await
    }

    /// Run the interactive authorization-code flow.
    pub async fn authorize(&self) -> AuthResult<()> {
        let mut guard = self.record.lock().await;
        self.authorize_locked(&mut guard).await
    }

    /// Replace a token the server refused. Skipped when another caller
    /// already replaced `rejected` while this one waited for the lock.
    pub async fn replace_rejected(&self, rejected: &str) -> AuthResult<()> {
        let mut guard = self.record.lock().await;
        if let Some(record) = guard.as_ref() {
            if record.access_token != rejected {
                tracing::debug!("token already replaced by a concurrent caller");
                return Ok(());
            }
        }
        self.status.send_replace(TokenStatus::Expired);
        self.refresh_locked(&mut guard).await
    }

    /// A valid bearer token, refreshing first when needed.
    pub async fn access_token(&self) -> AuthResult<String> {
        self.ensure_valid().await?;
        self.current_token()
            .await
            .ok_or_else(|| AuthError::Cache("token missing after validation".to_string()))
    }

    /// Snapshot of the held access token without any validation.
    pub async fn current_token(&self) -> Option<String> {
        let guard = self.record.lock().await;
        guard.as_ref().map(|record| record.access_token.clone())
    }

    pub async fn current_record(&self) -> Option<TokenRecord> {
        self.record.lock().await.clone()
    }

    pub async fn expires_in(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let guard = self.record.lock().await;
        guard.as_ref().map(|record| record.expires_in(now))
    }

    /// Browser consent URL for the authorization-code flow.
    pub fn consent_url(&self) -> Url {
        let mut url = self.endpoints.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", self.identity.app_key())
            .append_pair("redirect_uri", self.identity.callback_url().as_str())
            .append_pair("response_type", "code");
        url
    }

    async fn refresh_locked(&self, slot: &mut MutexGuard<'_, Option<TokenRecord>>) -> AuthResult<()> {
        let refresh_token = slot
            .as_ref()
            .filter(|record| record.has_refresh_token())
            .map(|record| record.refresh_token.clone());
        let Some(refresh_token) = refresh_token else {
            return self.authorize_locked(slot).await;
        };

        self.status.send_replace(TokenStatus::Refreshing);
        let grant = Grant::RefreshToken {
            refresh_token: &refresh_token,
        };
        match self.exchange(grant, Some(&refresh_token)).await {
            Ok(record) => {
                tracing::info!(expires_at = %record.expires_at, "access token refreshed");
                self.install(slot, record).await;
                Ok(())
            }
            Err(AuthError::Rejected { status, .. }) => {
                tracing::warn!(status, "refresh token rejected, starting authorization");
                self.authorize_locked(slot).await
            }
            Err(err) => {
                tracing::error!(error = %err, "token refresh failed");
                self.status.send_replace(TokenStatus::Expired);
                Err(err)
            }
        }
    }

    async fn authorize_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<TokenRecord>>,
    ) -> AuthResult<()> {
        self.status.send_replace(TokenStatus::AuthRequired);
        tracing::info!("starting interactive authorization");

        let consent_url = self.consent_url();
        let pasted = self.prompt.redirect_url(&consent_url).await?;
        let code = extract_authorization_code(&pasted)?;

        let grant = Grant::AuthorizationCode {
            code: &code,
            redirect_uri: self.identity.callback_url().as_str(),
        };
        let record = self.exchange(grant, None).await?;
        tracing::info!(expires_at = %record.expires_at, "authorization complete");
        self.install(slot, record).await;
        Ok(())
    }

    async fn install(&self, slot: &mut MutexGuard<'_, Option<TokenRecord>>, record: TokenRecord) {
        if let Err(err) = self.cache.save(&record).await {
            // The exchange already consumed the old grant; keep the token in memory.
            tracing::error!(error = %err, path = %self.cache.path().display(), "failed to persist token");
        }
        **slot = Some(record);
        self.status.send_replace(TokenStatus::Valid);
    }

    async fn exchange(&self, grant: Grant<'_>, previous_refresh: Option<&str>) -> AuthResult<TokenRecord> {
        let form: Vec<(&str, &str)> = match &grant {
            Grant::AuthorizationCode { code, redirect_uri } => vec![
                ("grant_type", "authorization_code"),
                ("code", *code),
                ("redirect_uri", *redirect_uri),
            ],
            Grant::RefreshToken { refresh_token } => vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", *refresh_token),
            ],
        };

        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .basic_auth(self.identity.app_key(), Some(self.identity.app_secret()))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::rejected(grant.name(), status, &body));
        }

        let issued_at = Utc::now();
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        Ok(parsed.into_record(issued_at, previous_refresh))
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("identity", &self.identity)
            .field("status", &self.status())
            .field("cache", &self.cache.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    struct NoPrompt;

    #[async_trait::async_trait]
    impl AuthorizationPrompt for NoPrompt {
        async fn redirect_url(&self, _consent_url: &Url) -> AuthResult<String> {
            Err(AuthError::Prompt("no operator in tests".to_string()))
        }
    }

    fn manager() -> TokenManager {
        let identity =
            ClientIdentity::new("appkey", "appsecret", "https://127.0.0.1/cb", "T1").unwrap();
        let endpoints = OAuthEndpoints {
            authorize_url: Url::parse("https://api.example.com/v1/oauth/authorize").unwrap(),
            token_url: Url::parse("https://api.example.com/v1/oauth/token").unwrap(),
        };
        TokenManager::new(
            identity,
            endpoints,
            TokenCache::at_path("/nonexistent/tokens.json"),
            Arc::new(NoPrompt),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn consent_url_carries_client_and_redirect() {
        let url = manager().consent_url();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("client_id".to_string(), "appkey".to_string()),
                ("redirect_uri".to_string(), "https://127.0.0.1/cb".to_string()),
                ("response_type".to_string(), "code".to_string()),
            ]
        );
    }

    #[test]
    fn token_response_keeps_previous_refresh_token_when_omitted() {
        let issued = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a2","expires_in":1800,"token_type":"Bearer"}"#)
                .unwrap();
        let record = response.into_record(issued, Some("r1"));
        assert_eq!(record.refresh_token, "r1");
        assert_eq!(record.expires_at, issued + chrono::Duration::seconds(1800));
        assert_eq!(record.token_type.as_deref(), Some("Bearer"));
    }

    #[test]
    fn buffer_makes_near_expiry_tokens_unusable() {
        let issued = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = TokenRecord::new("a", "r", issued, chrono::Duration::seconds(600));
        let buffered = manager().with_refresh_buffer(Duration::from_secs(300));
        let now = issued + chrono::Duration::seconds(400);

        assert!(TokenManager::is_valid(&record, now));
        assert!(!buffered.is_usable(&record, now));
    }

    #[tokio::test]
    async fn load_without_file_reports_no_token() {
        let manager = manager();
        assert_eq!(manager.load().await, TokenStatus::NoToken);
        assert_eq!(manager.status(), TokenStatus::NoToken);
    }

    #[tokio::test]
    async fn prompt_failure_surfaces_without_token() {
        let manager = manager();
        let err = manager.ensure_valid().await.unwrap_err();
        assert!(matches!(err, AuthError::Prompt(_)));
        assert_eq!(manager.status(), TokenStatus::AuthRequired);
    }
}
