use deskmirror_core::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Connection settings for the remote helpdesk.
#[derive(Clone, PartialEq)]
pub struct RemoteConfig {
    /// Account base URL, e.g. `https://acme.freshdesk.com`.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_millis(20_000),
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup("DESKMIRROR_REMOTE_URL")
            .ok_or_else(|| Error::InvalidInput("DESKMIRROR_REMOTE_URL is required".to_string()))?;
        let api_key = lookup("DESKMIRROR_API_KEY")
            .ok_or_else(|| Error::InvalidInput("DESKMIRROR_API_KEY is required".to_string()))?;
        let timeout_ms = lookup("DESKMIRROR_HTTP_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(20_000);

        let cfg = Self {
            base_url,
            api_key,
            timeout: Duration::from_millis(timeout_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(Error::InvalidInput("base_url is empty".to_string()));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(Error::InvalidInput(format!(
                "base_url must be an http(s) URL: {url}"
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidInput("api_key is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput("timeout must be > 0".to_string()));
        }
        Ok(())
    }
}
