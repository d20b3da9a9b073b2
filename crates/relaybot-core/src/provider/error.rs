//! Provider errors and their fallback classification.

use std::time::Duration;
use thiserror::Error;

/// How the fallback engine should react to a failed completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Quota or rate limit: cool the model down and try the next one.
    RateLimit,
    /// Bad credentials: no other model can succeed either.
    Auth,
    /// Anything else: count it against the model and try the next one.
    Other,
}

/// Error surfaced by a completion backend.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited ({status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("completion API error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("completion call timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to parse completion response: {0}")]
    Parse(String),

    #[error("completion API returned no choices")]
    EmptyResponse,
}

impl ProviderError {
    /// Build an error from a non-success HTTP status and the extracted body message.
    ///
    /// 429 is a rate limit and 401/403 are authentication failures. Some
    /// upstreams report these conditions with other status codes, so the
    /// message wording is checked as well.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 => Self::RateLimited { status, message },
            401 | 403 => Self::Auth { status, message },
            _ if looks_like_rate_limit(&message) => Self::RateLimited { status, message },
            _ if looks_like_auth_failure(&message) => Self::Auth { status, message },
            _ => Self::Http { status, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Auth { .. } => ErrorKind::Auth,
            _ => ErrorKind::Other,
        }
    }
}

fn looks_like_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("rate-limit") || lower.contains("quota")
}

fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("invalid api key") || lower.contains("unauthorized") || lower.contains("no auth credentials")
}
