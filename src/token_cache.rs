use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    credentials::ClientIdentity,
    errors::{AuthError, AuthResult},
};

/// Access/refresh token pair with its expiry.
///
/// `expires_at` is fixed when the token response arrives and never recomputed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl TokenRecord {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            issued_at,
            expires_at: issued_at + expires_in,
            token_type: None,
            scope: None,
            id_token: None,
        }
    }

    /// Strict check: `now == expires_at` is already expired.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    pub fn expires_in(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.has_refresh_token())
            .finish_non_exhaustive()
    }
}

/// Durable JSON storage for one identity's [`TokenRecord`].
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(dir: impl AsRef<Path>, identity: &ClientIdentity) -> Self {
        let file_name = format!("schwab_token_data_{}.json", identity.instance_label());
        Self {
            path: dir.as_ref().join(file_name),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored record. A missing or unreadable file is "no token".
    pub async fn load(&self) -> Option<TokenRecord> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no stored token");
                return None;
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to read token file");
                return None;
            }
        };

        match serde_json::from_slice::<TokenRecord>(&data) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "malformed token file ignored");
                None
            }
        }
    }

    /// Write the record to a sibling temp file, then rename it over the target.
    pub async fn save(&self, record: &TokenRecord) -> AuthResult<()> {
        let payload = serde_json::to_vec_pretty(record)?;
        let tmp = self.temp_path()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(&tmp, &payload).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }

        tracing::info!(path = %self.path.display(), expires_at = %record.expires_at, "token saved");
        Ok(())
    }

    fn temp_path(&self) -> AuthResult<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| AuthError::Cache(format!("invalid token path {}", self.path.display())))?;
        Ok(self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", process::id())))
    }
}
