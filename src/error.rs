//! Error taxonomy: transport-level failures and the caller-facing delivery
//! outcome.

use std::time::Duration;

/// Errors returned by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The Bot API answered with `ok: false`. `code` carries the remote
    /// `error_code`; 429 means rate limited.
    #[error("telegram api error (code {code}): {description}")]
    Api { code: i64, description: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed api response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// True when the remote endpoint rejected the call for rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Api { code: 429, .. })
    }

    /// The remote `error_code`, when the endpoint produced one.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Caller-facing delivery failure.
///
/// `Clone` because several concurrent callers can share one pending delivery
/// and each receives the outcome. Rate-limit rejections never surface here;
/// they are retried and show up only as latency, or as `RetriesExhausted`
/// once the retry budget is spent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport failure (code {code:?}): {message}")]
    Transport { code: Option<i64>, message: String },

    #[error("rate limited: gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The notifier was dropped while this delivery was still parked.
    #[error("delivery dropped before completion")]
    Dropped,
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
