//! Credential strategies: how proof of identity travels with a request.
//!
//! ARCHITECTURE
//! ============
//! `CookieStrategy` relies on `HttpOnly` cookies the backend sets; its HTTP
//! client carries a [`SessionCookieJar`] and nothing is attached by hand.
//! `HeaderStrategy` keeps access/refresh tokens in a [`KeyValueStore`] and
//! sends `Authorization: Bearer <token>`. Both are stateless with respect
//! to identity: they never know who the user is, only how to prove it.
//!
//! Only the active strategy mutates its credential storage, so the cookie
//! jar and the token store are never written concurrently by two
//! strategies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use cookie::Cookie;
use reqwest::RequestBuilder;
use reqwest::Url;
use reqwest::cookie::CookieStore;
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AuthMode;
use crate::store::{ACCESS_TOKEN_KEY, KeyValueStore, REFRESH_TOKEN_KEY};

#[cfg(test)]
#[path = "credentials_test.rs"]
mod tests;

/// Token payload returned by login/refresh in header mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub trait CredentialStrategy: Send + Sync + fmt::Debug {
    fn mode(&self) -> AuthMode;

    /// HTTP client configured for this transport.
    fn client(&self) -> &reqwest::Client;

    /// Attach credentials to an outgoing request.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder;

    /// Store tokens from a login/refresh payload. Cookie mode ignores them.
    fn set_tokens(&self, tokens: &TokenPair);

    fn refresh_token(&self) -> Option<String>;

    /// Whether any credential is present locally. Says nothing about validity.
    fn has_credentials(&self) -> bool;

    fn clear(&self);

    /// Headers for a websocket upgrade request to `url`.
    fn handshake_headers(&self, url: &str) -> HeaderMap;
}

/// Build the strategy for `mode`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be constructed.
pub fn build_strategy(
    mode: AuthMode,
    jar: Arc<SessionCookieJar>,
    tokens: Arc<dyn KeyValueStore>,
) -> Result<Arc<dyn CredentialStrategy>, ApiError> {
    Ok(match mode {
        AuthMode::Cookie => Arc::new(CookieStrategy::new(jar)?),
        AuthMode::Header => Arc::new(HeaderStrategy::new(tokens)?),
    })
}

// =============================================================================
// COOKIE JAR
// =============================================================================

#[derive(Debug, Clone)]
struct StoredCookie {
    value: String,
    secure: bool,
    path: String,
    expires_at: Option<OffsetDateTime>,
}

impl StoredCookie {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Clearable cookie jar for the cookie-mode client.
///
/// `Set-Cookie` values are parsed with the `cookie` crate. A cookie is
/// deleted by `Max-Age<=0` or an `Expires` date in the past, and dropped
/// from requests once its expiry passes. `Secure` and `Path` limit where
/// it is sent. The jar serves a single backend origin, so `Domain` is not
/// matched.
#[derive(Debug, Default)]
pub struct SessionCookieJar {
    cookies: Mutex<BTreeMap<String, StoredCookie>>,
}

impl SessionCookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        !self
            .cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|c| c.is_live(now))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .filter(|c| c.is_live(OffsetDateTime::now_utc()))
            .map(|c| c.value.clone())
    }

    /// Apply one `Set-Cookie` header value. Unparseable values are ignored.
    pub fn apply_set_cookie(&self, raw: &str) {
        let cookie = match Cookie::parse(raw) {
            Ok(cookie) => cookie,
            Err(e) => {
                debug!(error = %e, "ignoring malformed set-cookie");
                return;
            }
        };

        let now = OffsetDateTime::now_utc();
        let expires_at = match cookie.max_age() {
            Some(age) => now.checked_add(age),
            None => cookie.expires_datetime(),
        };

        let mut cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        if expires_at.is_some_and(|at| at <= now) {
            cookies.remove(cookie.name());
            return;
        }
        cookies.insert(
            cookie.name().to_owned(),
            StoredCookie {
                value: cookie.value().to_owned(),
                secure: cookie.secure().unwrap_or(false),
                path: cookie.path().filter(|p| p.starts_with('/')).unwrap_or("/").to_owned(),
                expires_at,
            },
        );
    }

    fn header_for(&self, url: &Url) -> Option<HeaderValue> {
        let secure_transport = matches!(url.scheme(), "https" | "wss");
        let now = OffsetDateTime::now_utc();
        let cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let joined = cookies
            .iter()
            .filter(|(_, c)| c.is_live(now))
            .filter(|(_, c)| secure_transport || !c.secure)
            .filter(|(_, c)| path_matches(&c.path, url.path()))
            .map(|(name, c)| format!("{name}={}", c.value))
            .collect::<Vec<_>>()
            .join("; ");
        if joined.is_empty() {
            return None;
        }
        HeaderValue::from_str(&joined).ok()
    }
}

/// RFC 6265 path-match.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    match request_path.strip_prefix(cookie_path) {
        Some(rest) => rest.is_empty() || cookie_path.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

impl CookieStore for SessionCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, _url: &Url) {
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                self.apply_set_cookie(raw);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.header_for(url)
    }
}

// =============================================================================
// COOKIE STRATEGY
// =============================================================================

#[derive(Debug)]
pub struct CookieStrategy {
    client: reqwest::Client,
    jar: Arc<SessionCookieJar>,
}

impl CookieStrategy {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(jar: Arc<SessionCookieJar>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .build()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        Ok(Self { client, jar })
    }
}

impl CredentialStrategy for CookieStrategy {
    fn mode(&self) -> AuthMode {
        AuthMode::Cookie
    }

    fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
    }

    fn set_tokens(&self, _tokens: &TokenPair) {
        debug!("cookie mode ignores token payloads");
    }

    fn refresh_token(&self) -> Option<String> {
        None
    }

    fn has_credentials(&self) -> bool {
        !self.jar.is_empty()
    }

    fn clear(&self) {
        self.jar.clear();
    }

    fn handshake_headers(&self, url: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = Url::parse(url).ok().and_then(|url| self.jar.header_for(&url)) {
            headers.insert(COOKIE, value);
        }
        headers
    }
}

// =============================================================================
// HEADER STRATEGY
// =============================================================================

#[derive(Debug)]
pub struct HeaderStrategy {
    client: reqwest::Client,
    tokens: Arc<dyn KeyValueStore>,
}

impl HeaderStrategy {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(tokens: Arc<dyn KeyValueStore>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        Ok(Self { client, tokens })
    }

    fn access_token(&self) -> Option<String> {
        self.tokens.get(ACCESS_TOKEN_KEY).filter(|t| !t.is_empty())
    }
}

impl CredentialStrategy for HeaderStrategy {
    fn mode(&self) -> AuthMode {
        AuthMode::Header
    }

    fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.access_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn set_tokens(&self, tokens: &TokenPair) {
        self.tokens.set(ACCESS_TOKEN_KEY, &tokens.access_token);
        if let Some(refresh) = &tokens.refresh_token {
            self.tokens.set(REFRESH_TOKEN_KEY, refresh);
        }
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.get(REFRESH_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    fn has_credentials(&self) -> bool {
        self.access_token().is_some()
    }

    fn clear(&self) {
        self.tokens.remove(ACCESS_TOKEN_KEY);
        self.tokens.remove(REFRESH_TOKEN_KEY);
    }

    fn handshake_headers(&self, _url: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = self
            .access_token()
            .and_then(|token| HeaderValue::from_str(&format!("Bearer {token}")).ok())
        {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }
}
