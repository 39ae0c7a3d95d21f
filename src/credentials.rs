use std::{env, fmt};

use url::Url;

use crate::errors::{AuthError, AuthResult};

const CALLBACK_URL_VAR: &str = "CALLBACK_URL";

/// App credentials plus the label that namespaces persisted tokens.
///
/// Built once at startup and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    app_key: String,
    app_secret: String,
    callback_url: Url,
    instance_label: String,
}

impl ClientIdentity {
    /// Validate and assemble an identity.
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        callback_url: &str,
        instance_label: impl Into<String>,
    ) -> AuthResult<Self> {
        let app_key = app_key.into();
        let app_secret = app_secret.into();
        let instance_label = instance_label.into();

        validate_secret("app key", &app_key)?;
        validate_secret("app secret", &app_secret)?;
        validate_label(&instance_label)?;

        let callback_url = Url::parse(callback_url.trim())
            .map_err(|err| AuthError::Config(format!("callback url {callback_url:?}: {err}")))?;

        Ok(Self {
            app_key,
            app_secret,
            callback_url,
            instance_label,
        })
    }

    /// Load credentials for `instance_label` from the process environment,
    /// reading a `.env` file first when one exists.
    ///
    /// Looks up `SCHWAB_APP_KEY_<LABEL>`, `SCHWAB_APP_SECRET_<LABEL>` and
    /// `CALLBACK_URL`.
    pub fn from_env(instance_label: &str) -> AuthResult<Self> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "failed to read .env file");
            }
        }

        let key_var = format!("SCHWAB_APP_KEY_{instance_label}");
        let secret_var = format!("SCHWAB_APP_SECRET_{instance_label}");
        let app_key = required_var(&key_var)?;
        let app_secret = required_var(&secret_var)?;
        let callback_url = required_var(CALLBACK_URL_VAR)?;

        let identity = Self::new(app_key, app_secret, &callback_url, instance_label)?;
        tracing::info!(instance = %identity.instance_label, "credentials loaded");
        Ok(identity)
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }

    pub fn callback_url(&self) -> &Url {
        &self.callback_url
    }

    pub fn instance_label(&self) -> &str {
        &self.instance_label
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .field("callback_url", &self.callback_url.as_str())
            .field("instance_label", &self.instance_label)
            .finish()
    }
}

fn required_var(name: &str) -> AuthResult<String> {
    env::var(name).map_err(|_| AuthError::Config(format!("{name} is not set")))
}

fn validate_secret(field: &str, value: &str) -> AuthResult<()> {
    if value.is_empty() {
        return Err(AuthError::Config(format!("{field} is empty")));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(AuthError::Config(format!("{field} contains whitespace")));
    }
    Ok(())
}

// The label ends up in token file names.
fn validate_label(label: &str) -> AuthResult<()> {
    if label.is_empty() {
        return Err(AuthError::Config("instance label is empty".to_string()));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AuthError::Config(format!(
            "instance label {label:?} may only contain ASCII letters, digits, '_' or '-'"
        )));
    }
    Ok(())
}
