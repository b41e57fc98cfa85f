//! Typed configuration parsed from environment variables.
//!
//! Every field has a default, so `AuthConfig::from_env()` only fails on a
//! mode variable that is set to something other than `cookie`/`header`.
//! Numeric values that fail to parse fall back to their defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::state::{AuthMode, ParseAuthModeError};

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_CHECK_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_MISMATCH_RETRY_MS: u64 = 500;
/// Mismatch retry delay suited to accelerated test runs.
pub const FAST_MISMATCH_RETRY_MS: u64 = 100;
pub const DEFAULT_WS_CONNECT_TIMEOUT_MS: u64 = 4_000;
pub const DEFAULT_WS_PATH_PREFIX: &str = "/ws";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {source}")]
    InvalidMode {
        var: &'static str,
        #[source]
        source: ParseAuthModeError,
    },
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// Backend paths, relative to `AuthConfig::base_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub identity: String,
    pub config: String,
    pub login: String,
    pub logout: String,
    pub refresh: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            identity: "/identity".to_owned(),
            config: "/config".to_owned(),
            login: "/auth/login".to_owned(),
            logout: "/auth/logout".to_owned(),
            refresh: "/auth/refresh".to_owned(),
        }
    }
}

// =============================================================================
// TIMING
// =============================================================================

/// Orchestrator timing knobs. Injected so tests can shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorTiming {
    /// `check_auth` calls within this window after a completed check are dropped.
    pub check_debounce: Duration,
    /// Delay before the single retry of an `authenticated=true` response with no user id.
    pub mismatch_retry_delay: Duration,
}

impl Default for OrchestratorTiming {
    fn default() -> Self {
        Self {
            check_debounce: Duration::from_millis(DEFAULT_CHECK_DEBOUNCE_MS),
            mismatch_retry_delay: Duration::from_millis(DEFAULT_MISMATCH_RETRY_MS),
        }
    }
}

impl OrchestratorTiming {
    /// Shortened mismatch delay for accelerated contexts.
    #[must_use]
    pub fn accelerated() -> Self {
        Self { mismatch_retry_delay: Duration::from_millis(FAST_MISMATCH_RETRY_MS), ..Self::default() }
    }
}

/// WebSocket hub settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// How long one connect attempt may take before it counts as failed.
    pub connect_timeout: Duration,
    /// Channel `music` lives at `<prefix>/music`.
    pub path_prefix: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_WS_CONNECT_TIMEOUT_MS),
            path_prefix: DEFAULT_WS_PATH_PREFIX.to_owned(),
        }
    }
}

// =============================================================================
// AUTH CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub base_url: String,
    /// Page URL whose `auth_mode` query parameter is an explicit override.
    pub page_url: Option<String>,
    /// Debug flag override, checked after the page URL.
    pub debug_mode: Option<AuthMode>,
    /// Build/environment mode that skips probing entirely.
    pub forced_mode: Option<AuthMode>,
    /// Tie-break when probing finds both or neither transport working.
    pub preferred_mode: AuthMode,
    pub endpoints: Endpoints,
    pub timing: OrchestratorTiming,
    pub hub: HubConfig,
    /// Durable token/mode file. `None` keeps tokens in memory only.
    pub token_store_path: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            page_url: None,
            debug_mode: None,
            forced_mode: None,
            preferred_mode: AuthMode::Cookie,
            endpoints: Endpoints::default(),
            timing: OrchestratorTiming::default(),
            hub: HubConfig::default(),
            token_store_path: None,
        }
    }
}

impl AuthConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `AUTHGATE_BASE_URL`: default `http://127.0.0.1:3000`
    /// - `AUTHGATE_PAGE_URL`: URL carrying an `auth_mode` override
    /// - `AUTHGATE_DEBUG_AUTH_MODE`: `cookie` or `header`
    /// - `AUTHGATE_AUTH_MODE`: environment-forced mode
    /// - `AUTHGATE_PREFERRED_MODE`: probe tie-break, default `cookie`
    /// - `AUTHGATE_CHECK_DEBOUNCE_MS`: default 1000
    /// - `AUTHGATE_MISMATCH_RETRY_MS`: default 500
    /// - `AUTHGATE_WS_CONNECT_TIMEOUT_MS`: default 4000
    /// - `AUTHGATE_WS_PATH_PREFIX`: default `/ws`
    /// - `AUTHGATE_TOKEN_STORE`: path of the durable token file
    ///
    /// # Errors
    ///
    /// Returns an error if a mode variable holds an unknown mode.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("AUTHGATE_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let page_url = env_nonempty("AUTHGATE_PAGE_URL");
        let debug_mode = env_mode("AUTHGATE_DEBUG_AUTH_MODE")?;
        let forced_mode = env_mode("AUTHGATE_AUTH_MODE")?;
        let preferred_mode = env_mode("AUTHGATE_PREFERRED_MODE")?.unwrap_or(AuthMode::Cookie);

        let timing = OrchestratorTiming {
            check_debounce: Duration::from_millis(env_parse("AUTHGATE_CHECK_DEBOUNCE_MS", DEFAULT_CHECK_DEBOUNCE_MS)),
            mismatch_retry_delay: Duration::from_millis(env_parse(
                "AUTHGATE_MISMATCH_RETRY_MS",
                DEFAULT_MISMATCH_RETRY_MS,
            )),
        };
        let hub = HubConfig {
            connect_timeout: Duration::from_millis(env_parse(
                "AUTHGATE_WS_CONNECT_TIMEOUT_MS",
                DEFAULT_WS_CONNECT_TIMEOUT_MS,
            )),
            path_prefix: env_nonempty("AUTHGATE_WS_PATH_PREFIX").unwrap_or_else(|| DEFAULT_WS_PATH_PREFIX.to_owned()),
        };
        let token_store_path = env_nonempty("AUTHGATE_TOKEN_STORE").map(PathBuf::from);

        Ok(Self {
            base_url,
            page_url,
            debug_mode,
            forced_mode,
            preferred_mode,
            endpoints: Endpoints::default(),
            timing,
            hub,
            token_store_path,
        })
    }

    /// Join an endpoint path onto the base URL.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// WebSocket URL for a named channel, derived from the HTTP base URL.
    #[must_use]
    pub fn channel_url(&self, channel: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        let prefix = self.hub.path_prefix.trim_end_matches('/');
        join_url(&ws_base, &format!("{prefix}/{channel}"))
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_mode(var: &'static str) -> Result<Option<AuthMode>, ConfigError> {
    env_nonempty(var)
        .map(|raw| raw.parse::<AuthMode>())
        .transpose()
        .map_err(|source| ConfigError::InvalidMode { var, source })
}
