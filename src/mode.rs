//! Credential mode resolution.
//!
//! DESIGN
//! ======
//! Decides once per session whether cookies or bearer headers carry
//! credentials. First match wins:
//!
//! 1. explicit override: `auth_mode` query parameter of the page URL, then
//!    the debug flag
//! 2. server preference from `GET /config` (failures count as "none")
//! 3. environment-forced mode
//! 4. capability probing: a cookie-transport identity round trip plus a
//!    header-transport one when a token is stored; both or neither
//!    working picks the preferred mode
//! 5. last-known-good mode from the durable store
//! 6. cookie
//!
//! Every step is best-effort; `resolve` always returns a mode and never
//! errors. The result is cached in the session store and only changes
//! through `force`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::ApiError;
use crate::state::AuthMode;
use crate::store::{KeyValueStore, LAST_GOOD_MODE_KEY, MODE_KEY};

#[cfg(test)]
#[path = "mode_test.rs"]
mod tests;

/// Query parameter carrying an explicit mode override.
pub const OVERRIDE_QUERY_PARAM: &str = "auth_mode";

/// Network capabilities the resolver consults.
#[async_trait]
pub trait ModeProbe: Send + Sync {
    /// Server-advertised mode, `None` on any failure.
    async fn server_preference(&self) -> Option<AuthMode>;

    /// Cookie-transport identity round trip. `Err` only when no answer came back.
    async fn cookie_works(&self) -> Result<bool, ApiError>;

    fn has_header_token(&self) -> bool;

    /// Header-transport identity round trip using the stored token.
    async fn header_works(&self) -> Result<bool, ApiError>;
}

/// Which rule produced the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Override,
    Server,
    Environment,
    Probe,
    LastKnownGood,
    Default,
    Cached,
    Forced,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Override => "override",
            Self::Server => "server",
            Self::Environment => "environment",
            Self::Probe => "probe",
            Self::LastKnownGood => "last_known_good",
            Self::Default => "default",
            Self::Cached => "cached",
            Self::Forced => "forced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeResolution {
    pub mode: AuthMode,
    pub source: ResolutionSource,
}

/// Inputs that bypass probing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeOverrides {
    pub page_url: Option<String>,
    pub debug_mode: Option<AuthMode>,
    pub forced_mode: Option<AuthMode>,
    pub preferred_mode: Option<AuthMode>,
}

impl ModeOverrides {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            page_url: config.page_url.clone(),
            debug_mode: config.debug_mode,
            forced_mode: config.forced_mode,
            preferred_mode: Some(config.preferred_mode),
        }
    }
}

pub struct ModeResolver {
    probe: Arc<dyn ModeProbe>,
    overrides: ModeOverrides,
    session: Arc<dyn KeyValueStore>,
    durable: Arc<dyn KeyValueStore>,
    resolved: Mutex<Option<ModeResolution>>,
}

impl ModeResolver {
    #[must_use]
    pub fn new(
        probe: Arc<dyn ModeProbe>,
        overrides: ModeOverrides,
        session: Arc<dyn KeyValueStore>,
        durable: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self { probe, overrides, session, durable, resolved: Mutex::new(None) }
    }

    /// Resolve the session mode, reusing the cached result.
    pub async fn resolve(&self) -> AuthMode {
        self.resolve_detailed().await.mode
    }

    /// Like [`ModeResolver::resolve`] but reports which rule decided.
    pub async fn resolve_detailed(&self) -> ModeResolution {
        let mut resolved = self.resolved.lock().await;
        if let Some(existing) = *resolved {
            return existing;
        }

        let resolution = match self.session.get(MODE_KEY).and_then(|raw| raw.parse::<AuthMode>().ok()) {
            Some(mode) => ModeResolution { mode, source: ResolutionSource::Cached },
            None => self.derive().await,
        };
        self.session.set(MODE_KEY, resolution.mode.as_str());
        info!(mode = %resolution.mode, source = %resolution.source, "auth mode resolved");
        *resolved = Some(resolution);
        resolution
    }

    /// Replace the session mode mid-session.
    pub async fn force(&self, mode: AuthMode) -> ModeResolution {
        let resolution = ModeResolution { mode, source: ResolutionSource::Forced };
        self.session.set(MODE_KEY, mode.as_str());
        *self.resolved.lock().await = Some(resolution);
        info!(%mode, "auth mode forced");
        resolution
    }

    /// Remember `mode` as having produced an authenticated session.
    pub fn record_known_good(&self, mode: AuthMode) {
        self.durable.set(LAST_GOOD_MODE_KEY, mode.as_str());
    }

    /// Mode currently cached, without resolving.
    pub async fn current(&self) -> Option<AuthMode> {
        self.resolved.lock().await.map(|r| r.mode)
    }

    async fn derive(&self) -> ModeResolution {
        if let Some(mode) = self.explicit_override() {
            return ModeResolution { mode, source: ResolutionSource::Override };
        }
        if let Some(mode) = self.probe.server_preference().await {
            return ModeResolution { mode, source: ResolutionSource::Server };
        }
        if let Some(mode) = self.overrides.forced_mode {
            return ModeResolution { mode, source: ResolutionSource::Environment };
        }
        if let Some(mode) = self.probe_capabilities().await {
            return ModeResolution { mode, source: ResolutionSource::Probe };
        }
        if let Some(mode) = self
            .durable
            .get(LAST_GOOD_MODE_KEY)
            .and_then(|raw| raw.parse::<AuthMode>().ok())
        {
            return ModeResolution { mode, source: ResolutionSource::LastKnownGood };
        }
        ModeResolution { mode: AuthMode::Cookie, source: ResolutionSource::Default }
    }

    fn explicit_override(&self) -> Option<AuthMode> {
        let from_url = self.overrides.page_url.as_deref().and_then(query_override);
        from_url.or(self.overrides.debug_mode)
    }

    async fn probe_capabilities(&self) -> Option<AuthMode> {
        let preferred = self.overrides.preferred_mode.unwrap_or(AuthMode::Cookie);
        let cookie = self.probe.cookie_works().await;
        let header = if self.probe.has_header_token() { self.probe.header_works().await } else { Ok(false) };
        debug!(?cookie, ?header, %preferred, "capability probe finished");

        match (cookie, header) {
            (Ok(true), Ok(true)) | (Ok(false), Ok(false)) => Some(preferred),
            (Ok(true), _) => Some(AuthMode::Cookie),
            (_, Ok(true)) => Some(AuthMode::Header),
            (cookie, header) => {
                warn!(?cookie, ?header, "capability probe inconclusive");
                None
            }
        }
    }
}

/// Extract a valid `auth_mode` override from a page URL.
#[must_use]
pub fn query_override(page_url: &str) -> Option<AuthMode> {
    let url = reqwest::Url::parse(page_url).ok()?;
    let raw = url
        .query_pairs()
        .find(|(key, _)| key == OVERRIDE_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())?;
    match raw.parse() {
        Ok(mode) => Some(mode),
        Err(e) => {
            warn!(error = %e, "ignoring invalid auth_mode override");
            None
        }
    }
}
