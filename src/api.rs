//! HTTP layer: identity round trips and privileged API calls.
//!
//! ARCHITECTURE
//! ============
//! `ApiClient` sends every request through the active [`CredentialStrategy`].
//! Privileged calls get three opt-in behaviors via [`RequestOptions`]:
//! one refresh-and-replay on 401 (`auth`), coalescing of identical
//! in-flight GETs (`dedupe`), and exponential backoff (`retry`).
//!
//! The identity call is deliberately outside that machinery. It is the
//! call that decides whether we are authenticated, so a 401 from it is an
//! answer, not something to refresh around.
//!
//! ERROR HANDLING
//! ==============
//! All failures are `ApiError`. Nothing here touches `AuthState`; the
//! orchestrator folds identity errors into state, other callers get the
//! error back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backoff::with_backoff;
use crate::config::AuthConfig;
use crate::credentials::{CookieStrategy, CredentialStrategy, HeaderStrategy, SessionCookieJar, TokenPair};
use crate::error::ApiError;
use crate::mode::ModeProbe;
use crate::state::AuthMode;
use crate::store::KeyValueStore;

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;

/// Header telling the backend which transport the identity call uses.
pub const AUTH_MODE_HEADER: &str = "x-auth-mode";

// =============================================================================
// IDENTITY WIRE TYPES
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IdentityUser {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Body of `GET /identity`.
///
/// Ids may arrive as strings or numbers, under `user_id`, `userId`, or a
/// nested `user.id`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IdentityResponse {
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default, alias = "userId")]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub session_ready: Option<bool>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub user: Option<IdentityUser>,
}

impl IdentityResponse {
    /// First usable identifier, or `None` when the backend sent none.
    #[must_use]
    pub fn resolved_user_id(&self) -> Option<String> {
        self.user_id
            .as_ref()
            .and_then(id_to_string)
            .or_else(|| self.user.as_ref().and_then(|u| u.id.as_ref()).and_then(id_to_string))
    }

    #[must_use]
    pub fn resolved_email(&self) -> Option<String> {
        self.email
            .clone()
            .or_else(|| self.user.as_ref().and_then(|u| u.email.clone()))
            .filter(|e| !e.is_empty())
    }

    /// Authenticated with a usable identifier.
    #[must_use]
    pub fn is_consistent_login(&self) -> bool {
        self.is_authenticated && self.resolved_user_id().is_some()
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() && s != "null" && s != "undefined" => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ServerConfigResponse {
    #[serde(default)]
    auth_mode: Option<String>,
}

// =============================================================================
// IDENTITY API SEAM
// =============================================================================

/// The identity round trip as the orchestrator sees it.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// One identity request with no refresh/dedupe/backoff around it.
    async fn whoami(&self) -> Result<IdentityResponse, ApiError>;

    /// Transport the next `whoami` will use.
    fn mode(&self) -> AuthMode;
}

/// Issue one identity request through `strategy`.
///
/// # Errors
///
/// Returns `ApiError::Http` for non-2xx, `Network` for transport failures,
/// `Decode` for a malformed body.
pub async fn fetch_identity(strategy: &dyn CredentialStrategy, url: &str) -> Result<IdentityResponse, ApiError> {
    let request = strategy
        .client()
        .get(url)
        .header(AUTH_MODE_HEADER, strategy.mode().as_str());
    let response = strategy.authorize(request).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::from_status(status));
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

// =============================================================================
// API CLIENT
// =============================================================================

/// Per-request behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Refresh credentials and replay once on 401.
    pub auth: bool,
    /// Share one network call among identical concurrent GETs.
    pub dedupe: bool,
    /// Retry transient failures with exponential backoff.
    pub retry: bool,
}

impl RequestOptions {
    /// Options for the identity call: none of the generic machinery.
    pub const IDENTITY: Self = Self { auth: false, dedupe: false, retry: false };
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { auth: true, dedupe: true, retry: false }
    }
}

type SharedResponse = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

/// HTTP client bound to the active credential strategy. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ApiInner>,
}

struct ApiInner {
    config: AuthConfig,
    strategy: RwLock<Arc<dyn CredentialStrategy>>,
    inflight: Mutex<HashMap<String, SharedResponse>>,
}

impl ApiClient {
    #[must_use]
    pub fn new(config: AuthConfig, strategy: Arc<dyn CredentialStrategy>) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                config,
                strategy: RwLock::new(strategy),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn strategy(&self) -> Arc<dyn CredentialStrategy> {
        Arc::clone(&self.inner.strategy.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap the active strategy. Requests already sent keep their transport.
    pub fn set_strategy(&self, strategy: Arc<dyn CredentialStrategy>) {
        let mut slot = self.inner.strategy.write().unwrap_or_else(PoisonError::into_inner);
        info!(from = %slot.mode(), to = %strategy.mode(), "credential strategy swapped");
        *slot = strategy;
    }

    /// Privileged JSON request. Empty bodies decode to `Value::Null`.
    ///
    /// # Errors
    ///
    /// Returns the classified `ApiError` of the final attempt.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        if options.dedupe && method == Method::GET && body.is_none() {
            let key = format!("GET {path}");
            let this = self.clone();
            let path = path.to_owned();
            return self
                .deduplicated(key, async move { this.send_with_options(Method::GET, &path, None, options).await }.boxed())
                .await;
        }
        self.send_with_options(method, path, body, options).await
    }

    /// Typed wrapper around [`ApiClient::request_json`].
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Decode` if the body does not match `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let value = self.request_json(method, path, body, options).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `POST /auth/login`. Header-mode token payloads are stored.
    ///
    /// # Errors
    ///
    /// Returns the login failure unchanged; nothing is retried.
    pub async fn login(&self, credentials: Value) -> Result<Value, ApiError> {
        let path = self.inner.config.endpoints.login.clone();
        let body = self.send_once(Method::POST, &path, Some(credentials)).await?;
        self.store_token_payload(&body);
        Ok(body)
    }

    /// `POST /auth/logout`, then clear local credentials even if the call failed.
    ///
    /// # Errors
    ///
    /// Returns the logout request failure after credentials are cleared.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let path = self.inner.config.endpoints.logout.clone();
        let result = self.send_once(Method::POST, &path, None).await;
        self.strategy().clear();
        if let Err(e) = &result {
            warn!(error = %e, "logout request failed; local credentials cleared anyway");
        }
        result.map(|_| ())
    }

    /// `POST /auth/refresh`. Concurrent callers share one refresh.
    ///
    /// # Errors
    ///
    /// Returns the refresh failure; the caller's original 401 stands.
    pub async fn refresh_tokens(&self) -> Result<(), ApiError> {
        let this = self.clone();
        let key = "POST refresh".to_owned();
        self.deduplicated(
            key,
            async move {
                let strategy = this.strategy();
                let body = strategy
                    .refresh_token()
                    .map(|token| serde_json::json!({ "refresh_token": token }));
                let path = this.inner.config.endpoints.refresh.clone();
                let response = this.send_once(Method::POST, &path, body).await?;
                this.store_token_payload(&response);
                Ok(Value::Null)
            }
            .boxed(),
        )
        .await
        .map(|_| ())
    }

    fn store_token_payload(&self, body: &Value) {
        let strategy = self.strategy();
        if strategy.mode() != AuthMode::Header {
            return;
        }
        match serde_json::from_value::<TokenPair>(body.clone()) {
            Ok(tokens) => strategy.set_tokens(&tokens),
            Err(_) => debug!("response carried no token pair"),
        }
    }

    async fn send_with_options(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        if options.retry {
            with_backoff(|| self.send_authed(method.clone(), path, body.clone(), options.auth), path).await
        } else {
            self.send_authed(method, path, body, options.auth).await
        }
    }

    async fn send_authed(&self, method: Method, path: &str, body: Option<Value>, auth: bool) -> Result<Value, ApiError> {
        match self.send_once(method.clone(), path, body.clone()).await {
            Err(e) if auth && e.is_unauthorized() => {
                debug!(path, "401; refreshing credentials and replaying once");
                self.refresh_tokens().await?;
                self.send_once(method, path, body).await
            }
            other => other,
        }
    }

    async fn send_once(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        let strategy = self.strategy();
        let url = self.inner.config.url(path);
        let mut request = strategy.authorize(strategy.client().request(method, url));
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(status));
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn deduplicated(
        &self,
        key: String,
        request: BoxFuture<'static, Result<Value, ApiError>>,
    ) -> Result<Value, ApiError> {
        let shared = {
            let mut inflight = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = inflight.get(&key) {
                debug!(%key, "joining in-flight request");
                existing.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let cleanup_key = key.clone();
                let shared = async move {
                    let result = request.await;
                    inner
                        .inflight
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&cleanup_key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }
}

#[async_trait]
impl IdentityApi for ApiClient {
    async fn whoami(&self) -> Result<IdentityResponse, ApiError> {
        let strategy = self.strategy();
        let url = self.inner.config.url(&self.inner.config.endpoints.identity);
        fetch_identity(strategy.as_ref(), &url).await
    }

    fn mode(&self) -> AuthMode {
        self.strategy().mode()
    }
}

// =============================================================================
// MODE PROBE
// =============================================================================

/// Network side of mode resolution, built on throwaway strategies that
/// share the session's cookie jar and token store.
#[derive(Debug, Clone)]
pub struct HttpModeProbe {
    config: AuthConfig,
    jar: Arc<SessionCookieJar>,
    tokens: Arc<dyn KeyValueStore>,
}

impl HttpModeProbe {
    #[must_use]
    pub fn new(config: AuthConfig, jar: Arc<SessionCookieJar>, tokens: Arc<dyn KeyValueStore>) -> Self {
        Self { config, jar, tokens }
    }

    fn identity_url(&self) -> String {
        self.config.url(&self.config.endpoints.identity)
    }
}

#[async_trait]
impl ModeProbe for HttpModeProbe {
    async fn server_preference(&self) -> Option<AuthMode> {
        let client = reqwest::Client::new();
        let url = self.config.url(&self.config.endpoints.config);
        let response = client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: ServerConfigResponse = response.json().await.ok()?;
        body.auth_mode.and_then(|raw| raw.parse().ok())
    }

    async fn cookie_works(&self) -> Result<bool, ApiError> {
        let strategy = CookieStrategy::new(Arc::clone(&self.jar))?;
        match fetch_identity(&strategy, &self.identity_url()).await {
            Ok(identity) => Ok(identity.is_consistent_login()),
            Err(ApiError::Http { .. } | ApiError::Decode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn has_header_token(&self) -> bool {
        self.tokens
            .get(crate::store::ACCESS_TOKEN_KEY)
            .is_some_and(|t| !t.is_empty())
    }

    async fn header_works(&self) -> Result<bool, ApiError> {
        if !self.has_header_token() {
            return Ok(false);
        }
        let strategy = HeaderStrategy::new(Arc::clone(&self.tokens))?;
        match fetch_identity(&strategy, &self.identity_url()).await {
            Ok(identity) => Ok(identity.is_consistent_login()),
            Err(ApiError::Http { .. } | ApiError::Decode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
