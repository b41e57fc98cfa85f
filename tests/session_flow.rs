//! End-to-end flows against an in-process backend speaking the identity,
//! config, auth, and channel contracts over real HTTP and websockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use authgate::config::{HubConfig, OrchestratorTiming};
use authgate::store::{ACCESS_TOKEN_KEY, FileStore, KeyValueStore};
use authgate::{
    AuthConfig, AuthMode, AuthSession, ConnectionStatus, HubEvent, RefreshOptions, RequestOptions, ResolutionSource,
};
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde_json::{Value, json};
use tokio::sync::broadcast;

const SESSION_COOKIE: &str = "session_token";
const EMAIL: &str = "ada@example.test";
const PASSWORD: &str = "hunter2";
const USER_ID: &str = "user-1";

// =============================================================================
// BACKEND
// =============================================================================

#[derive(Default)]
struct Backend {
    /// access token -> email
    sessions: Mutex<HashMap<String, String>>,
    /// refresh token -> email
    refresh: Mutex<HashMap<String, String>>,
    next_token: AtomicU32,
    preferred_mode: Mutex<Option<&'static str>>,
    omit_user_id: AtomicU32,
    identity_hits: AtomicU32,
    ws_hits: AtomicU32,
    config_enabled: AtomicBool,
}

impl Backend {
    fn issue(&self, email: &str) -> (String, String) {
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        let access = format!("access-{n}");
        let refresh = format!("refresh-{n}");
        self.sessions.lock().unwrap().insert(access.clone(), email.to_owned());
        self.refresh.lock().unwrap().insert(refresh.clone(), email.to_owned());
        (access, refresh)
    }

    fn user_for(&self, token: Option<String>) -> Option<String> {
        token.and_then(|t| self.sessions.lock().unwrap().get(&t).cloned())
    }

    fn identity_hits(&self) -> u32 {
        self.identity_hits.load(Ordering::SeqCst)
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn cookie_token(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|c| c.value().to_owned())
}

fn any_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    bearer(headers).or_else(|| cookie_token(jar))
}

fn session_cookie(value: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}

async fn identity(State(backend): State<Arc<Backend>>, jar: CookieJar, headers: HeaderMap) -> Json<Value> {
    backend.identity_hits.fetch_add(1, Ordering::SeqCst);
    let mode = headers
        .get("x-auth-mode")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("cookie")
        .to_owned();
    let token = if mode == "header" { bearer(&headers) } else { cookie_token(&jar) };

    let Some(email) = backend.user_for(token) else {
        return Json(json!({ "is_authenticated": false }));
    };
    if backend
        .omit_user_id
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Json(json!({ "is_authenticated": true, "session_ready": true }));
    }
    Json(json!({
        "is_authenticated": true,
        "user_id": USER_ID,
        "email": email,
        "session_ready": true,
        "source": mode,
    }))
}

async fn server_config(State(backend): State<Arc<Backend>>) -> Response {
    if !backend.config_enabled.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let mode = *backend.preferred_mode.lock().unwrap();
    Json(json!({ "auth_mode": mode })).into_response()
}

async fn login(State(backend): State<Arc<Backend>>, jar: CookieJar, Json(body): Json<Value>) -> Response {
    if body["email"] != EMAIL || body["password"] != PASSWORD {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let (access, refresh) = backend.issue(EMAIL);
    let jar = jar.add(session_cookie(access.clone()));
    (jar, Json(json!({ "access_token": access, "refresh_token": refresh }))).into_response()
}

async fn logout(State(backend): State<Arc<Backend>>, jar: CookieJar, headers: HeaderMap) -> Response {
    if let Some(token) = any_token(&jar, &headers) {
        backend.sessions.lock().unwrap().remove(&token);
    }
    let cleared = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::ZERO);
    (jar.add(cleared), StatusCode::NO_CONTENT).into_response()
}

async fn refresh(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    let email = body["refresh_token"]
        .as_str()
        .and_then(|t| backend.refresh.lock().unwrap().get(t).cloned());
    let Some(email) = email else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let (access, refresh) = backend.issue(&email);
    Json(json!({ "access_token": access, "refresh_token": refresh })).into_response()
}

async fn me(State(backend): State<Arc<Backend>>, jar: CookieJar, headers: HeaderMap) -> Response {
    match backend.user_for(any_token(&jar, &headers)) {
        Some(email) => Json(json!({ "id": USER_ID, "email": email })).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn channel(
    State(backend): State<Arc<Backend>>,
    Path(name): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    backend.ws_hits.fetch_add(1, Ordering::SeqCst);
    if backend.user_for(any_token(&jar, &headers)).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_channel(socket, name))
}

async fn serve_channel(mut socket: WebSocket, name: String) {
    if socket.send(Message::Text(format!("welcome:{name}").into())).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                let reply = format!("echo:{}", text.as_str());
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn spawn_backend() -> (String, Arc<Backend>) {
    let backend = Arc::new(Backend::default());
    let router = Router::new()
        .route("/identity", get(identity))
        .route("/config", get(server_config))
        .route("/me", get(me))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/refresh", post(refresh))
        .route("/ws/{name}", get(channel))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), backend)
}

fn config(base_url: &str, mode: Option<AuthMode>) -> AuthConfig {
    AuthConfig {
        base_url: base_url.to_owned(),
        forced_mode: mode,
        timing: OrchestratorTiming::accelerated(),
        hub: HubConfig { connect_timeout: Duration::from_secs(2), ..HubConfig::default() },
        ..AuthConfig::default()
    }
}

async fn next_event(events: &mut broadcast::Receiver<HubEvent>) -> HubEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("hub event")
        .unwrap()
}

// =============================================================================
// LOGIN FLOWS
// =============================================================================

#[tokio::test]
async fn cookie_login_logout_round_trip() {
    let (base, _backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(AuthMode::Cookie))).await.unwrap();

    let anonymous = session.orchestrator().refresh_auth(RefreshOptions::default()).await;
    assert!(!anonymous.is_authenticated);
    assert!(anonymous.whoami_ok);

    let state = session.login(EMAIL, PASSWORD).await.unwrap();
    assert!(state.is_ready());
    assert_eq!(state.user_id(), Some(USER_ID));
    assert_eq!(state.user.as_ref().unwrap().email.as_deref(), Some(EMAIL));
    assert_eq!(state.source, authgate::AuthSource::Cookie);

    let signed_out = session.logout().await;
    assert!(!signed_out.state.is_authenticated);
    assert!(signed_out.backend_error.is_none());

    let after = session.orchestrator().refresh_auth(RefreshOptions::FORCE).await;
    assert!(!after.is_authenticated, "cookie must be gone after logout");
}

#[tokio::test]
async fn header_login_stores_bearer_tokens() {
    let (base, _backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(AuthMode::Header))).await.unwrap();

    let state = session.login(EMAIL, PASSWORD).await.unwrap();
    assert!(state.is_ready());
    assert_eq!(state.source, authgate::AuthSource::Header);
    assert!(session.api().strategy().has_credentials());
}

#[tokio::test]
async fn wrong_password_leaves_state_untouched() {
    let (base, backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(AuthMode::Cookie))).await.unwrap();
    let hits = backend.identity_hits();

    let err = session.login(EMAIL, "wrong").await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert_eq!(session.state().version, 0);
    assert_eq!(backend.identity_hits(), hits);
    assert!(!session.orchestrator().bootstrap().is_blocked());
}

// =============================================================================
// IDENTITY CHECKS
// =============================================================================

#[tokio::test]
async fn concurrent_refreshes_make_one_identity_call() {
    let (base, backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(AuthMode::Cookie))).await.unwrap();
    session.login(EMAIL, PASSWORD).await.unwrap();
    let before = backend.identity_hits();

    let orch = session.orchestrator();
    let results = futures::future::join_all((0..8).map(|_| orch.refresh_auth(RefreshOptions::default()))).await;

    assert_eq!(backend.identity_hits(), before + 1);
    assert!(results.iter().all(|s| s.version == results[0].version && s.is_ready()));
}

#[tokio::test]
async fn persistent_mismatch_downgrades_session() {
    let (base, backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(AuthMode::Cookie))).await.unwrap();
    session.login(EMAIL, PASSWORD).await.unwrap();

    backend.omit_user_id.store(2, Ordering::SeqCst);
    let mut events = session.orchestrator().events();
    let state = session.orchestrator().refresh_auth(RefreshOptions::default()).await;

    assert!(!state.is_authenticated);
    assert_eq!(state.source, authgate::AuthSource::Missing);
    assert!(state.error.as_deref().unwrap().contains("no userId after retry"));
    assert_eq!(
        events.try_recv().unwrap(),
        authgate::AuthEvent::IdentityMismatch { mode: AuthMode::Cookie }
    );
}

#[tokio::test]
async fn transient_mismatch_recovers_on_retry() {
    let (base, backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(AuthMode::Header))).await.unwrap();
    session.login(EMAIL, PASSWORD).await.unwrap();

    backend.omit_user_id.store(1, Ordering::SeqCst);
    let state = session.orchestrator().refresh_auth(RefreshOptions::default()).await;
    assert!(state.is_ready());
    assert_eq!(state.user_id(), Some(USER_ID));
}

// =============================================================================
// MODE RESOLUTION
// =============================================================================

#[tokio::test]
async fn server_preference_picks_the_mode() {
    let (base, backend) = spawn_backend().await;
    backend.config_enabled.store(true, Ordering::SeqCst);
    *backend.preferred_mode.lock().unwrap() = Some("header");

    let session = AuthSession::create(config(&base, None)).await.unwrap();
    let resolution = session.resolution().await;
    assert_eq!(resolution.mode, AuthMode::Header);
    assert_eq!(resolution.source, ResolutionSource::Server);
}

#[tokio::test]
async fn probe_finds_working_stored_bearer_token() {
    let (base, backend) = spawn_backend().await;
    let (access, _refresh) = backend.issue(EMAIL);

    let path = std::env::temp_dir().join(format!("authgate-flow-{}.json", uuid::Uuid::new_v4()));
    FileStore::open(&path).unwrap().set(ACCESS_TOKEN_KEY, &access);

    let session = AuthSession::create(AuthConfig { token_store_path: Some(path.clone()), ..config(&base, None) })
        .await
        .unwrap();
    let resolution = session.resolution().await;
    assert_eq!(resolution.mode, AuthMode::Header);
    assert_eq!(resolution.source, ResolutionSource::Probe);

    let state = session.orchestrator().refresh_auth(RefreshOptions::default()).await;
    assert!(state.is_ready());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn nothing_works_defaults_to_cookie() {
    let (base, _backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, None)).await.unwrap();
    let resolution = session.resolution().await;
    assert_eq!(resolution.mode, AuthMode::Cookie);
    assert_eq!(resolution.source, ResolutionSource::Probe);
}

// =============================================================================
// PRIVILEGED REQUESTS
// =============================================================================

#[tokio::test]
async fn expired_access_token_is_refreshed_and_replayed() {
    let (base, backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(AuthMode::Header))).await.unwrap();
    session.login(EMAIL, PASSWORD).await.unwrap();

    backend.sessions.lock().unwrap().clear();
    let me = session
        .api()
        .request_json(reqwest::Method::GET, "/me", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(me["id"], USER_ID);
}

// =============================================================================
// CHANNELS
// =============================================================================

async fn channel_round_trip(mode: AuthMode) {
    let (base, backend) = spawn_backend().await;
    let session = AuthSession::create(config(&base, Some(mode))).await.unwrap();
    let hub = session.hub();
    let mut events = hub.events();

    hub.start([("music", true)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.ws_hits.load(Ordering::SeqCst), 0);
    assert_eq!(hub.get_connection_status("music"), ConnectionStatus::Idle);

    session.login(EMAIL, PASSWORD).await.unwrap();
    hub.start([("music", true)]);
    assert_eq!(next_event(&mut events).await, HubEvent::Connected { channel: "music".into() });
    assert_eq!(
        next_event(&mut events).await,
        HubEvent::Message { channel: "music".into(), text: "welcome:music".into() }
    );

    hub.send("music", "hello").unwrap();
    assert_eq!(
        next_event(&mut events).await,
        HubEvent::Message { channel: "music".into(), text: "echo:hello".into() }
    );
    assert_eq!(backend.ws_hits.load(Ordering::SeqCst), 1);

    let identity_hits = backend.identity_hits();
    session.orchestrator().mark_signed_out();
    assert!(matches!(next_event(&mut events).await, HubEvent::Disconnected { .. }));
    assert_eq!(hub.get_connection_status("music"), ConnectionStatus::Disconnected);
    assert_eq!(backend.identity_hits(), identity_hits);
}

#[tokio::test]
async fn cookie_channel_round_trip() {
    channel_round_trip(AuthMode::Cookie).await;
}

#[tokio::test]
async fn header_channel_round_trip() {
    channel_round_trip(AuthMode::Header).await;
}
