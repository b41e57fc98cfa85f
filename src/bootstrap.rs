//! Process-wide gate that suspends identity checks during an auth-finish sequence.
//!
//! While a login completion is writing credentials, an identity check would
//! read half-written state and report a false negative. The orchestrator
//! consults the gate and turns every check into a no-op until it clears.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

#[cfg(test)]
#[path = "bootstrap_test.rs"]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BootstrapState {
    /// Raw flag written by [`BootstrapManager::set_auth_finish_in_progress`].
    pub auth_finish_in_progress: bool,
    /// Live [`AuthFinishGuard`]s.
    pub pending_finishes: usize,
}

impl BootstrapState {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.auth_finish_in_progress || self.pending_finishes > 0
    }
}

/// Shared handle; clones observe the same gate.
#[derive(Debug, Clone)]
pub struct BootstrapManager {
    tx: Arc<watch::Sender<BootstrapState>>,
}

impl BootstrapManager {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BootstrapState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn set_auth_finish_in_progress(&self, in_progress: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if state.auth_finish_in_progress == in_progress {
                return false;
            }
            state.auth_finish_in_progress = in_progress;
            true
        });
        if changed {
            debug!(in_progress, "auth finish flag changed");
        }
    }

    #[must_use]
    pub fn state(&self) -> BootstrapState {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.state().is_blocked()
    }

    /// Receiver that yields on every gate change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.tx.subscribe()
    }

    /// Hold the gate closed until the returned guard is dropped. Overlapping
    /// guards nest: the gate reopens only when the last one is dropped.
    #[must_use = "the gate reopens as soon as the guard is dropped"]
    pub fn begin_auth_finish(&self) -> AuthFinishGuard {
        self.tx.send_modify(|state| state.pending_finishes += 1);
        debug!(pending = self.tx.borrow().pending_finishes, "auth finish started");
        AuthFinishGuard { manager: self.clone() }
    }

    fn end_auth_finish(&self) {
        self.tx.send_modify(|state| state.pending_finishes = state.pending_finishes.saturating_sub(1));
        debug!(pending = self.tx.borrow().pending_finishes, "auth finish ended");
    }
}

impl Default for BootstrapManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct AuthFinishGuard {
    manager: BootstrapManager,
}

impl Drop for AuthFinishGuard {
    fn drop(&mut self) {
        self.manager.end_auth_finish();
    }
}
