use crate::remote::error::RemoteError;
use std::error::Error as StdError;

/// Common error type for `deskmirror_core`.
///
/// Store implementations should preserve the underlying error chain via
/// `Error::backend`. Failures reported by the remote helpdesk arrive as
/// `Error::Remote` and keep their taxonomy so callers can surface them.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("remote: {0}")]
    Remote(#[from] RemoteError),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "deskmirror.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap a sqlx failure with "sqlite" context.
    pub fn backend_sqlx(source: sqlx::Error) -> Self {
        Self::Backend {
            context: "sqlite".into(),
            source: Box::new(source),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
