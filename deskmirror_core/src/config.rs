use crate::refresh::DEFAULT_STALE_AFTER_SECS;
use crate::sync::engine::DEFAULT_PAGE_SIZE;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Local side of the mirror: where it lives and how it pages and refreshes.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    /// SQLite file holding the mirror.
    pub db_path: PathBuf,
    /// `per_page` sent on every list request.
    pub page_size: usize,
    /// Age after which a ticket is refetched on read.
    pub stale_after: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mirror.db"),
            page_size: DEFAULT_PAGE_SIZE,
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS as u64),
        }
    }
}

impl MirrorConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source (the process environment in
    /// `from_env`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let db_path = lookup("DESKMIRROR_DB_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let page_size = match lookup("DESKMIRROR_PAGE_SIZE") {
            Some(v) => v.trim().parse::<usize>().map_err(|_| {
                Error::InvalidInput(format!("DESKMIRROR_PAGE_SIZE is not a number: {v}"))
            })?,
            None => defaults.page_size,
        };
        let stale_after = match lookup("DESKMIRROR_STALE_AFTER_SECS") {
            Some(v) => Duration::from_secs(v.trim().parse::<u64>().map_err(|_| {
                Error::InvalidInput(format!("DESKMIRROR_STALE_AFTER_SECS is not a number: {v}"))
            })?),
            None => defaults.stale_after,
        };

        let cfg = Self {
            db_path,
            page_size,
            stale_after,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("db_path is empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("page_size must be > 0".to_string()));
        }
        if self.page_size > 100 {
            return Err(Error::InvalidInput(
                "page_size must be <= 100 (remote per_page limit)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stale_after_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX)
    }
}
