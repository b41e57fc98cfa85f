//! Published authentication state and the small enums it is built from.
//!
//! SYSTEM CONTEXT
//! ==============
//! `AuthState` is the one snapshot every consumer reads. The orchestrator
//! replaces it wholesale on each committed transition and hands out
//! `Arc<AuthState>` clones, so subscribers can hold a snapshot without
//! ever observing a half-updated value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;

// =============================================================================
// AUTH MODE
// =============================================================================

/// Credential transport in use for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// `HttpOnly` session cookies carried by the HTTP client's jar.
    Cookie,
    /// Bearer token read from the token store and sent in `Authorization`.
    Header,
}

impl AuthMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cookie => "cookie",
            Self::Header => "header",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized auth mode string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown auth mode '{0}' (expected 'cookie' or 'header')")]
pub struct ParseAuthModeError(pub String);

impl FromStr for AuthMode {
    type Err = ParseAuthModeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cookie" | "cookies" => Ok(Self::Cookie),
            "header" | "bearer" => Ok(Self::Header),
            other => Err(ParseAuthModeError(other.to_owned())),
        }
    }
}

// =============================================================================
// AUTH SOURCE
// =============================================================================

/// Where the current identity was established from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthSource {
    Cookie,
    Header,
    #[default]
    Missing,
}

impl From<AuthMode> for AuthSource {
    fn from(mode: AuthMode) -> Self {
        match mode {
            AuthMode::Cookie => Self::Cookie,
            AuthMode::Header => Self::Header,
        }
    }
}

impl AuthSource {
    /// Lenient parse of the backend's `source` field. Unknown values map to `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cookie" => Some(Self::Cookie),
            "header" | "bearer" => Some(Self::Header),
            "missing" | "none" => Some(Self::Missing),
            _ => None,
        }
    }
}

// =============================================================================
// AUTH STATE
// =============================================================================

/// Identity of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

/// Canonical authentication state. Only the orchestrator constructs new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthState {
    pub is_authenticated: bool,
    /// A full identity round trip validated the session end-to-end.
    pub session_ready: bool,
    pub user: Option<AuthUser>,
    pub source: AuthSource,
    /// Last identity check succeeded at the transport level and was consistent.
    pub whoami_ok: bool,
    /// Bumped on every committed transition; never decreases.
    pub version: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl AuthState {
    /// State before the first identity check has committed.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            is_authenticated: false,
            session_ready: false,
            user: None,
            source: AuthSource::Missing,
            whoami_ok: false,
            version: 0,
            last_checked: None,
            is_loading: true,
            error: None,
        }
    }

    /// Signed-out state with an optional classified error message.
    #[must_use]
    pub fn signed_out(error: Option<String>) -> Self {
        Self { is_loading: false, error, ..Self::initial() }
    }

    /// Authenticated AND identity-validated. Channels and privileged calls key off this.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_authenticated && self.session_ready && self.user.is_some()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::initial()
    }
}
