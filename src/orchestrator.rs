//! Auth orchestrator: the single owner of `AuthState`.
//!
//! SYSTEM CONTEXT
//! ==============
//! UI hooks, the websocket hub, and privileged API callers all read auth
//! state from here and never run their own identity checks. The
//! orchestrator turns any number of logically concurrent "who am I?"
//! requests into at most one identity round trip at a time and publishes
//! one committed transition per logical check.
//!
//! DESIGN
//! ======
//! - `check_auth` is the opportunistic entry point: it drops the call when
//!   a check is in flight or finished within the debounce window.
//! - `refresh_auth` is authoritative: concurrent callers share one spawned
//!   check through a `Shared` future. `force` starts a new check that
//!   queues behind any in-flight round trip instead of joining it.
//! - Both are no-ops while the bootstrap gate reports an auth-finish
//!   sequence in progress.
//! - A response claiming `is_authenticated=true` without a user id is not
//!   committed. One retry runs after `mismatch_retry_delay`; if the id is
//!   still missing the state is hard-downgraded to signed out and an
//!   `IdentityMismatch` event is raised.
//!
//! Commits replace the snapshot wholesale, bump `version`, and fan out to
//! subscribers in version order. Each subscriber remembers the highest
//! version it has seen, so a replay racing a delivery can never hand it
//! an older snapshot.
//!
//! ERROR HANDLING
//! ==============
//! Nothing here returns an error. Transport and HTTP failures become a
//! committed signed-out state with `error` set; callers read state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{IdentityApi, IdentityResponse};
use crate::bootstrap::BootstrapManager;
use crate::config::OrchestratorTiming;
use crate::error::ApiError;
use crate::state::{AuthMode, AuthSource, AuthState, AuthUser};

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;

/// Error recorded when the mismatch retry still has no user id.
pub const MISMATCH_DOWNGRADE_ERROR: &str = "auth gate: is_authenticated=true but no userId after retry";

const EVENT_CAPACITY: usize = 32;

/// Out-of-band signals that are not part of `AuthState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    /// Backend kept claiming an authenticated session without a user id.
    IdentityMismatch { mode: AuthMode },
    /// Identity round trip got no usable answer.
    CheckFailed { error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Start a fresh round trip instead of joining the in-flight one.
    pub force: bool,
}

impl RefreshOptions {
    pub const FORCE: Self = Self { force: true };
}

type Callback = Box<dyn Fn(&Arc<AuthState>) + Send + Sync>;
type SharedCheck = Shared<BoxFuture<'static, Arc<AuthState>>>;

struct Subscriber {
    id: u64,
    /// Highest delivered `version + 1`; zero means nothing delivered yet.
    delivered: AtomicU64,
    callback: Callback,
}

impl Subscriber {
    fn deliver(&self, snapshot: &Arc<AuthState>) {
        let mark = snapshot.version + 1;
        if self.delivered.fetch_max(mark, Ordering::AcqRel) < mark {
            (self.callback)(snapshot);
        }
    }
}

struct InflightCheck {
    generation: u64,
    outcome: SharedCheck,
}

struct Core {
    state: Arc<AuthState>,
    pending: VecDeque<Arc<AuthState>>,
    delivering: bool,
}

struct Inner {
    api: Arc<dyn IdentityApi>,
    bootstrap: BootstrapManager,
    timing: OrchestratorTiming,
    core: Mutex<Core>,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_subscriber: AtomicU64,
    watch_tx: watch::Sender<Arc<AuthState>>,
    events: broadcast::Sender<AuthEvent>,
    inflight: Mutex<Option<InflightCheck>>,
    generation: AtomicU64,
    round_trip: tokio::sync::Mutex<()>,
    last_completed: Mutex<Option<Instant>>,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the orchestrator service. Clones share one state machine.
#[derive(Clone)]
pub struct AuthOrchestrator {
    inner: Arc<Inner>,
}

impl AuthOrchestrator {
    #[must_use]
    pub fn new(api: Arc<dyn IdentityApi>, bootstrap: BootstrapManager, timing: OrchestratorTiming) -> Self {
        let initial = Arc::new(AuthState::initial());
        let (watch_tx, _rx) = watch::channel(Arc::clone(&initial));
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                bootstrap,
                timing,
                core: Mutex::new(Core { state: initial, pending: VecDeque::new(), delivering: false }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                watch_tx,
                events,
                inflight: Mutex::new(None),
                generation: AtomicU64::new(0),
                round_trip: tokio::sync::Mutex::new(()),
                last_completed: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn state(&self) -> Arc<AuthState> {
        Arc::clone(&lock(&self.inner.core).state)
    }

    /// Whether an identity check is running right now.
    #[must_use]
    pub fn is_checking(&self) -> bool {
        lock(&self.inner.inflight).is_some()
    }

    #[must_use]
    pub fn bootstrap(&self) -> &BootstrapManager {
        &self.inner.bootstrap
    }

    /// Async view of the state, always holding the latest snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<AuthState>> {
        self.inner.watch_tx.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Register `callback`, invoking it immediately with the current state.
    ///
    /// The callback runs on whichever task commits, so it must not block.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<AuthState>) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber { id, delivered: AtomicU64::new(0), callback: Box::new(callback) });
        if !self.inner.disposed.load(Ordering::Acquire) {
            lock(&self.inner.subscribers).push(Arc::clone(&subscriber));
        }
        subscriber.deliver(&self.state());
        Subscription { id, inner: Arc::downgrade(&self.inner) }
    }

    /// Debounced, opportunistic identity check.
    ///
    /// Returns the current snapshot without any network call when gated,
    /// when a check is in flight, or when one finished within the debounce
    /// window.
    pub async fn check_auth(&self) -> Arc<AuthState> {
        if self.short_circuit("check_auth") {
            return self.state();
        }
        if self.is_checking() {
            debug!("check_auth: check already in flight");
            return self.state();
        }
        let last = *lock(&self.inner.last_completed);
        if last.is_some_and(|at| at.elapsed() < self.inner.timing.check_debounce) {
            debug!("check_auth: inside debounce window");
            return self.state();
        }
        self.refresh_auth(RefreshOptions::default()).await
    }

    /// Authoritative identity check. Concurrent non-forced callers share one round trip.
    pub async fn refresh_auth(&self, options: RefreshOptions) -> Arc<AuthState> {
        if self.short_circuit("refresh_auth") {
            return self.state();
        }

        let outcome = {
            let mut inflight = lock(&self.inner.inflight);
            match inflight.as_ref() {
                Some(check) if !options.force => {
                    debug!(generation = check.generation, "joining in-flight identity check");
                    check.outcome.clone()
                }
                _ => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let outcome = self.spawn_check(generation);
                    *inflight = Some(InflightCheck { generation, outcome: outcome.clone() });
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Commit a signed-out state without a network call (local logout).
    pub fn mark_signed_out(&self) -> Arc<AuthState> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return self.state();
        }
        commit(&self.inner, AuthState::signed_out(None))
    }

    /// Drop all subscribers and turn later calls into no-ops.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            lock(&self.inner.subscribers).clear();
            info!("auth orchestrator disposed");
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn short_circuit(&self, op: &'static str) -> bool {
        if self.inner.disposed.load(Ordering::Acquire) {
            debug!(op, "orchestrator disposed; ignoring");
            return true;
        }
        if self.inner.bootstrap.is_blocked() {
            debug!(op, "auth finish in progress; identity check suppressed");
            return true;
        }
        false
    }

    fn spawn_check(&self, generation: u64) -> SharedCheck {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let state = run_check(&inner).await;
            let mut inflight = lock(&inner.inflight);
            if inflight.as_ref().is_some_and(|c| c.generation == generation) {
                *inflight = None;
            }
            state
        });

        let fallback = Arc::downgrade(&self.inner);
        async move {
            match handle.await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, generation, "identity check task aborted");
                    match fallback.upgrade() {
                        Some(inner) => {
                            let state = Arc::clone(&lock(&inner.core).state);
                            state
                        }
                        None => Arc::new(AuthState::signed_out(None)),
                    }
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Unsubscribes on `unsubscribe()` or drop.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.subscribers).retain(|s| s.id != self.id);
        }
    }
}

// =============================================================================
// CHECK PIPELINE
// =============================================================================

async fn run_check(inner: &Inner) -> Arc<AuthState> {
    let _round_trip = inner.round_trip.lock().await;
    let mode = inner.api.mode();

    let next = match inner.api.whoami().await {
        Err(e) => failure_state(inner, &e),
        Ok(identity) if is_mismatch(&identity) => {
            warn!(
                %mode,
                delay_ms = u64::try_from(inner.timing.mismatch_retry_delay.as_millis()).unwrap_or(u64::MAX),
                "identity reports authenticated without user id; retrying once"
            );
            tokio::time::sleep(inner.timing.mismatch_retry_delay).await;
            match inner.api.whoami().await {
                Ok(retry) if is_mismatch(&retry) => {
                    warn!(%mode, "identity mismatch persisted; downgrading to signed out");
                    let _ = inner.events.send(AuthEvent::IdentityMismatch { mode });
                    mismatch_downgrade()
                }
                Ok(retry) => candidate_state(&retry, mode),
                Err(e) => failure_state(inner, &e),
            }
        }
        Ok(identity) => candidate_state(&identity, mode),
    };

    let committed = commit(inner, next);
    *lock(&inner.last_completed) = Some(Instant::now());
    committed
}

fn is_mismatch(identity: &IdentityResponse) -> bool {
    identity.is_authenticated && identity.resolved_user_id().is_none()
}

/// Map a consistent identity response onto a state draft.
pub(crate) fn candidate_state(identity: &IdentityResponse, mode: AuthMode) -> AuthState {
    if !identity.is_authenticated {
        return AuthState { whoami_ok: true, ..AuthState::signed_out(None) };
    }

    let user = identity
        .resolved_user_id()
        .map(|id| AuthUser { id, email: identity.resolved_email() });
    let source = identity
        .source
        .as_deref()
        .and_then(AuthSource::parse)
        .filter(|s| *s != AuthSource::Missing)
        .unwrap_or_else(|| AuthSource::from(mode));
    AuthState {
        is_authenticated: true,
        session_ready: identity.session_ready.unwrap_or(true) && user.is_some(),
        user,
        source,
        whoami_ok: true,
        ..AuthState::signed_out(None)
    }
}

fn mismatch_downgrade() -> AuthState {
    AuthState::signed_out(Some(MISMATCH_DOWNGRADE_ERROR.to_owned()))
}

fn failure_state(inner: &Inner, error: &ApiError) -> AuthState {
    warn!(error = %error, "identity check failed");
    let _ = inner.events.send(AuthEvent::CheckFailed { error: error.to_string() });
    AuthState::signed_out(Some(error.summary()))
}

/// Replace the snapshot, bump the version, and deliver in version order.
fn commit(inner: &Inner, mut next: AuthState) -> Arc<AuthState> {
    let (snapshot, drain) = {
        let mut core = lock(&inner.core);
        next.version = core.state.version + 1;
        next.last_checked = Some(OffsetDateTime::now_utc());
        next.is_loading = false;
        let snapshot = Arc::new(next);
        core.state = Arc::clone(&snapshot);
        core.pending.push_back(Arc::clone(&snapshot));
        inner.watch_tx.send_replace(Arc::clone(&snapshot));
        let drain = !core.delivering;
        core.delivering = true;
        (snapshot, drain)
    };

    info!(
        version = snapshot.version,
        is_authenticated = snapshot.is_authenticated,
        session_ready = snapshot.session_ready,
        source = ?snapshot.source,
        error = snapshot.error.as_deref().unwrap_or(""),
        "auth state committed"
    );

    if drain {
        drain_pending(inner);
    }
    snapshot
}

fn drain_pending(inner: &Inner) {
    loop {
        let next = {
            let mut core = lock(&inner.core);
            if let Some(next) = core.pending.pop_front() {
                next
            } else {
                core.delivering = false;
                return;
            }
        };
        let subscribers = lock(&inner.subscribers).clone();
        for subscriber in subscribers {
            subscriber.deliver(&next);
        }
    }
}
