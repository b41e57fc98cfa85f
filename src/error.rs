//! Network error taxonomy.
//!
//! ERROR HANDLING
//! ==============
//! `ApiError` carries strings instead of `reqwest::Error` so it is `Clone`:
//! deduplicated requests hand the same outcome to every waiting caller.
//! `FailureKind` is the single classification the backoff loop and the
//! orchestrator both consult.

use reqwest::StatusCode;

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;

/// Coarse error classes used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403/422: authentication or validation rejection.
    Auth,
    /// Any other 4xx.
    Client,
    /// 5xx.
    Server,
    /// No response at all.
    Transport,
    /// Undecodable body, bad request construction, and the like.
    Other,
}

impl FailureKind {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Server | Self::Transport)
    }

    /// Classify an HTTP status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 | 422 => Self::Auth,
            500..=599 => Self::Server,
            400..=499 => Self::Client,
            _ => Self::Other,
        }
    }
}

/// Anything the backoff loop can classify.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// Errors from HTTP calls against the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Backend answered with a non-success status.
    #[error("HTTP {status}: {status_text}")]
    Http { status: u16, status_text: String },

    /// Request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// Response body did not match the expected shape.
    #[error("response decode failed: {0}")]
    Decode(String),

    /// Request could not be built (bad URL, bad header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        Self::Http {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Classified, user-facing text for `AuthState.error`. Transport and
    /// client-side details stay out of it.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Http { .. } => self.to_string(),
            Self::Network(_) => "network error".to_owned(),
            Self::Decode(_) => "response decode failed".to_owned(),
            Self::InvalidRequest(_) => "invalid request".to_owned(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::from_status(status)
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl Classify for ApiError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Http { status, .. } => FailureKind::from_status(*status),
            Self::Network(_) => FailureKind::Transport,
            Self::Decode(_) | Self::InvalidRequest(_) => FailureKind::Other,
        }
    }
}
