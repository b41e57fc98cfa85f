//! Composition root: wires stores, mode resolution, the credential
//! strategy, the API client, the orchestrator, and the hub into one
//! long-lived session object.
//!
//! LIFECYCLE
//! =========
//! `create` resolves the transport once and builds everything else around
//! it. Login and token hand-off run under the bootstrap guard so no
//! identity check reads half-written credentials, then force a refresh to
//! reconcile. `dispose` closes channels and detaches subscribers.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::api::{ApiClient, HttpModeProbe};
use crate::bootstrap::BootstrapManager;
use crate::config::AuthConfig;
use crate::credentials::{SessionCookieJar, TokenPair, build_strategy};
use crate::error::ApiError;
use crate::hub::{ChannelConnector, TungsteniteConnector, WebSocketHub};
use crate::mode::{ModeOverrides, ModeResolution, ModeResolver};
use crate::orchestrator::{AuthOrchestrator, RefreshOptions, Subscription};
use crate::state::{AuthMode, AuthState};
use crate::store::{FileStore, KeyValueStore, MemoryStore};

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Durable token store could not be opened.
    #[error("token store {}: {source}", .path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Result of [`AuthSession::logout`]. Local sign-out always happens;
/// `backend_error` reports whether the backend saw it.
#[derive(Debug)]
pub struct LogoutOutcome {
    pub state: Arc<AuthState>,
    pub backend_error: Option<ApiError>,
}

pub struct AuthSession {
    config: AuthConfig,
    jar: Arc<SessionCookieJar>,
    tokens: Arc<dyn KeyValueStore>,
    resolver: Arc<ModeResolver>,
    api: ApiClient,
    orchestrator: AuthOrchestrator,
    hub: WebSocketHub,
    _known_good: Subscription,
}

impl AuthSession {
    /// Build a session against the live backend in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable store cannot be opened or the HTTP
    /// client cannot be built. Mode resolution itself never fails.
    pub async fn create(config: AuthConfig) -> Result<Self, SessionError> {
        Self::create_with(config, |api| -> Arc<dyn ChannelConnector> { Arc::new(TungsteniteConnector::new(api.clone())) })
            .await
    }

    /// Like [`AuthSession::create`] with a caller-supplied channel connector.
    ///
    /// # Errors
    ///
    /// Same as [`AuthSession::create`].
    pub async fn create_with<F>(config: AuthConfig, connector: F) -> Result<Self, SessionError>
    where
        F: FnOnce(&ApiClient) -> Arc<dyn ChannelConnector>,
    {
        let tokens: Arc<dyn KeyValueStore> = match &config.token_store_path {
            Some(path) => Arc::new(
                FileStore::open(path).map_err(|source| SessionError::Store { path: path.clone(), source })?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        let session_store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let jar = Arc::new(SessionCookieJar::new());

        let probe = HttpModeProbe::new(config.clone(), Arc::clone(&jar), Arc::clone(&tokens));
        let resolver = Arc::new(ModeResolver::new(
            Arc::new(probe),
            ModeOverrides::from_config(&config),
            session_store,
            Arc::clone(&tokens),
        ));
        let mode = resolver.resolve().await;

        let strategy = build_strategy(mode, Arc::clone(&jar), Arc::clone(&tokens))?;
        let api = ApiClient::new(config.clone(), strategy);
        let orchestrator = AuthOrchestrator::new(Arc::new(api.clone()), BootstrapManager::new(), config.timing);

        let known_good = {
            let resolver = Arc::clone(&resolver);
            let api = api.clone();
            orchestrator.subscribe(move |state| {
                if state.is_ready() {
                    resolver.record_known_good(api.strategy().mode());
                }
            })
        };

        let hub = WebSocketHub::new(connector(&api), orchestrator.watch(), &config.hub);
        info!(base_url = %config.base_url, %mode, "auth session created");

        Ok(Self { config, jar, tokens, resolver, api, orchestrator, hub, _known_good: known_good })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    #[must_use]
    pub fn orchestrator(&self) -> &AuthOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn hub(&self) -> &WebSocketHub {
        &self.hub
    }

    #[must_use]
    pub fn mode(&self) -> AuthMode {
        self.api.strategy().mode()
    }

    #[must_use]
    pub fn state(&self) -> Arc<AuthState> {
        self.orchestrator.state()
    }

    /// Resolved mode and the rule that picked it.
    pub async fn resolution(&self) -> ModeResolution {
        self.resolver.resolve_detailed().await
    }

    /// Password login followed by a forced identity check.
    ///
    /// # Errors
    ///
    /// Returns the login failure; auth state is left as it was.
    pub async fn login(&self, email: &str, password: &str) -> Result<Arc<AuthState>, ApiError> {
        {
            let _finishing = self.orchestrator.bootstrap().begin_auth_finish();
            self.api.login(json!({ "email": email, "password": password })).await?;
        }
        Ok(self.orchestrator.refresh_auth(RefreshOptions::FORCE).await)
    }

    /// Accept tokens delivered out of band (e.g. an OAuth callback) and
    /// reconcile auth state.
    pub async fn finish_login(&self, tokens: &TokenPair) -> Arc<AuthState> {
        {
            let _finishing = self.orchestrator.bootstrap().begin_auth_finish();
            self.api.strategy().set_tokens(tokens);
        }
        self.orchestrator.refresh_auth(RefreshOptions::FORCE).await
    }

    /// Sign out locally and on the backend. Local credentials are cleared
    /// and channels closed even if the backend call fails.
    pub async fn logout(&self) -> LogoutOutcome {
        let backend_error = self.api.logout().await.err();
        self.hub.stop_all();
        LogoutOutcome { state: self.orchestrator.mark_signed_out(), backend_error }
    }

    /// Switch transport mid-session: clear the old credentials, swap the
    /// strategy, and force a fresh identity check.
    ///
    /// # Errors
    ///
    /// Returns an error if the new strategy's HTTP client cannot be built.
    pub async fn switch_mode(&self, mode: AuthMode) -> Result<Arc<AuthState>, ApiError> {
        let previous = self.api.strategy();
        if previous.mode() != mode {
            previous.clear();
        }
        let strategy = build_strategy(mode, Arc::clone(&self.jar), Arc::clone(&self.tokens))?;
        self.resolver.force(mode).await;
        self.api.set_strategy(strategy);
        Ok(self.orchestrator.refresh_auth(RefreshOptions::FORCE).await)
    }

    pub fn dispose(&self) {
        self.hub.stop_all();
        self.orchestrator.dispose();
    }
}
