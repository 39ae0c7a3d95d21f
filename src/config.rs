use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    schwab_client::{Error, Result},
    ws_client::StreamConfig,
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.schwabapi.com";

/// Endpoint layout and client-side policies.
///
/// Every field has a default, so a TOML file only needs the values it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub trader_path: String,
    pub market_data_path: String,
    pub oauth_authorize_path: String,
    pub oauth_token_path: String,
    pub request_timeout_secs: u64,
    /// Lower bound of the random pause before each REST call.
    pub pacing_min_ms: u64,
    /// Upper bound of the random pause before each REST call.
    pub pacing_max_ms: u64,
    /// Tokens are refreshed this long before `expires_at`.
    pub token_refresh_buffer_secs: u64,
    pub token_dir: PathBuf,
    pub prompt_timeout_secs: u64,
    pub stream: StreamConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            trader_path: "/trader/v1".to_string(),
            market_data_path: "/marketdata/v1".to_string(),
            oauth_authorize_path: "/v1/oauth/authorize".to_string(),
            oauth_token_path: "/v1/oauth/token".to_string(),
            request_timeout_secs: 30,
            pacing_min_ms: 500,
            pacing_max_ms: 1500,
            token_refresh_buffer_secs: 300,
            token_dir: PathBuf::from("."),
            prompt_timeout_secs: 600,
            stream: StreamConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Point every endpoint at a local mock server with flat paths.
    pub fn sandbox(base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: base_url.into(),
            trader_path: String::new(),
            market_data_path: "/marketdata".to_string(),
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|err| Error::ConfigFile(format!("failed to read {}: {err}", path.display())))?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(data)
            .map_err(|err| Error::ConfigFile(format!("failed to parse TOML config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        if self.pacing_min_ms > self.pacing_max_ms {
            return Err(Error::InvalidConfig {
                field: "pacing_min_ms",
                why: "must not exceed pacing_max_ms",
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig {
                field: "request_timeout_secs",
                why: "must be positive",
            });
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.api_base_url)?)
    }

    pub fn trader_url(&self, path: &str) -> Result<Url> {
        self.join(&self.trader_path, path)
    }

    pub fn market_data_url(&self, path: &str) -> Result<Url> {
        self.join(&self.market_data_path, path)
    }

    pub fn authorize_url(&self) -> Result<Url> {
        self.join(&self.oauth_authorize_path, "")
    }

    pub fn token_url(&self) -> Result<Url> {
        self.join(&self.oauth_token_path, "")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pacing(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.pacing_min_ms),
            Duration::from_millis(self.pacing_max_ms),
        )
    }

    pub fn token_refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.token_refresh_buffer_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    fn join(&self, prefix: &str, path: &str) -> Result<Url> {
        let base = self.api_base_url.trim_end_matches('/');
        let prefix = prefix.trim_matches('/');
        let path = path.trim_start_matches('/');
        let mut full = String::from(base);
        for part in [prefix, path] {
            if !part.is_empty() {
                full.push('/');
                full.push_str(part);
            }
        }
        Ok(Url::parse(&full)?)
    }
}
