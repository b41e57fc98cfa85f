//! WebSocket hub: one long-lived connection per named channel, gated on auth.
//!
//! SYSTEM CONTEXT
//! ==============
//! Channels ("music", "care", ...) are opened only while the orchestrator
//! reports a ready session. The hub reads auth state through a
//! `watch::Receiver` and holds no handle that could start an identity
//! check, so socket trouble can never feed back into session state.
//!
//! DESIGN
//! ======
//! - `start` spawns one task per enabled channel. The task connects under
//!   `connect_timeout`, pumps inbound text into `HubEvent::Message`, and on
//!   a close or failed attempt spends the channel's single reconnect. A
//!   successful connect refills it, so every close of a live socket gets
//!   one retry. A reconnect that itself fails is terminal: status `Failed`
//!   plus a `ConnectionFailed` event. Only another `start` revives the
//!   channel.
//! - A watcher task closes every channel the moment auth state reports
//!   signed out.
//! - Status writes carry the channel's epoch; a task from a stopped or
//!   restarted channel cannot overwrite the newer status.
//!
//! TRADE-OFFS
//! ==========
//! Connection failure is reported as its own event and status instead of
//! touching auth state. A flaky network therefore never logs the user out,
//! at the cost of the UI having to show two independent signals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::backoff::BackoffPolicy;
use crate::config::HubConfig;
use crate::state::AuthState;

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Handshake or transport failure while opening a channel.
    #[error("connect failed: {0}")]
    Connect(String),

    /// No open connection for the named channel.
    #[error("channel '{0}' is not connected")]
    NotConnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Never started.
    Idle,
    Connecting,
    Connected,
    /// Closed on purpose: `stop`, sign-out, or a close while signed out.
    Disconnected,
    /// Reconnect budget spent. Terminal until the next `start`.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Connected { channel: String },
    Message { channel: String, text: String },
    Disconnected { channel: String, reason: String },
    ConnectionFailed { channel: String, error: String },
}

// =============================================================================
// CONNECTOR SEAM
// =============================================================================

/// An open channel. Dropping `outbound` closes the underlying socket;
/// `inbound` yields `None` once the peer is gone.
#[derive(Debug)]
pub struct ChannelLink {
    pub inbound: mpsc::UnboundedReceiver<String>,
    pub outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, channel: &str) -> Result<ChannelLink, HubError>;
}

/// Live connector: `ws[s]://<host><prefix>/<channel>`, authenticated with
/// whatever the active credential strategy puts on the handshake.
#[derive(Clone)]
pub struct TungsteniteConnector {
    api: ApiClient,
}

impl TungsteniteConnector {
    #[must_use]
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ChannelConnector for TungsteniteConnector {
    async fn connect(&self, channel: &str) -> Result<ChannelLink, HubError> {
        let url = self.api.config().channel_url(channel);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| HubError::Connect(e.to_string()))?;
        let strategy = self.api.strategy();
        request.headers_mut().extend(strategy.handshake_headers(&url));

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| HubError::Connect(e.to_string()))?;
        debug!(%url, mode = %strategy.mode(), "channel socket open");

        let (mut write, mut read) = stream.split();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(text) = outgoing else {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        };
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "channel socket read failed");
                            break;
                        }
                    },
                }
            }
        });

        Ok(ChannelLink { inbound: in_rx, outbound: out_tx })
    }
}

// =============================================================================
// HUB
// =============================================================================

struct ChannelSlot {
    status: ConnectionStatus,
    epoch: u64,
    task: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct HubInner {
    connector: Arc<dyn ChannelConnector>,
    auth: watch::Receiver<Arc<AuthState>>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    next_epoch: Mutex<u64>,
    events: broadcast::Sender<HubEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HubInner {
    fn is_ready(&self) -> bool {
        self.auth.borrow().is_ready()
    }

    fn emit(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    /// Write `status` if the slot still belongs to `epoch`.
    fn set_status(&self, channel: &str, epoch: u64, status: ConnectionStatus) -> bool {
        let mut channels = lock(&self.channels);
        match channels.get_mut(channel) {
            Some(slot) if slot.epoch == epoch => {
                slot.status = status;
                if status != ConnectionStatus::Connected {
                    slot.outbound = None;
                }
                true
            }
            _ => false,
        }
    }

    fn attach(&self, channel: &str, epoch: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut channels = lock(&self.channels);
        match channels.get_mut(channel) {
            Some(slot) if slot.epoch == epoch => {
                slot.status = ConnectionStatus::Connected;
                slot.outbound = Some(outbound);
                true
            }
            _ => false,
        }
    }

    fn close(&self, channel: &str, reason: &str) {
        let closed = {
            let mut channels = lock(&self.channels);
            match channels.get_mut(channel) {
                Some(slot) if matches!(slot.status, ConnectionStatus::Connecting | ConnectionStatus::Connected) => {
                    if let Some(task) = slot.task.take() {
                        task.abort();
                    }
                    slot.outbound = None;
                    slot.status = ConnectionStatus::Disconnected;
                    true
                }
                _ => false,
            }
        };
        if closed {
            info!(channel, reason, "channel closed");
            self.emit(HubEvent::Disconnected { channel: channel.to_owned(), reason: reason.to_owned() });
        }
    }

    fn close_all(&self, reason: &str) {
        let names: Vec<String> = lock(&self.channels).keys().cloned().collect();
        for name in names {
            self.close(&name, reason);
        }
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        for slot in lock(&self.channels).values_mut() {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }
    }
}

/// Channel manager. Clones share the same connections.
#[derive(Clone)]
pub struct WebSocketHub {
    inner: Arc<HubInner>,
}

impl WebSocketHub {
    /// Build a hub bound to an auth state feed.
    ///
    /// Must be called inside a tokio runtime: the sign-out watcher is
    /// spawned immediately.
    #[must_use]
    pub fn new(connector: Arc<dyn ChannelConnector>, auth: watch::Receiver<Arc<AuthState>>, config: &HubConfig) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(HubInner {
            connector,
            auth: auth.clone(),
            connect_timeout: config.connect_timeout,
            reconnect_delay: BackoffPolicy::default().delay_after(1),
            channels: Mutex::new(HashMap::new()),
            next_epoch: Mutex::new(0),
            events,
            watcher: Mutex::new(None),
        });
        let watcher = tokio::spawn(watch_auth(Arc::downgrade(&inner), auth));
        *lock(&inner.watcher) = Some(watcher);
        Self { inner }
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    /// Open every channel mapped to `true` and close every one mapped to
    /// `false`. A no-op while the session is not ready: no attempt is made.
    pub fn start<I, N>(&self, channels: I)
    where
        I: IntoIterator<Item = (N, bool)>,
        N: Into<String>,
    {
        if !self.inner.is_ready() {
            debug!("hub start ignored: session not ready");
            return;
        }
        for (name, enabled) in channels {
            let name = name.into();
            if enabled {
                self.open(name);
            } else {
                self.inner.close(&name, "disabled");
            }
        }
    }

    /// Close the named channels. Never triggers an identity check.
    pub fn stop<I, N>(&self, channels: I)
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        for name in channels {
            self.inner.close(name.as_ref(), "stopped");
        }
    }

    pub fn stop_all(&self) {
        self.inner.close_all("stopped");
    }

    #[must_use]
    pub fn get_connection_status(&self, channel: &str) -> ConnectionStatus {
        lock(&self.inner.channels)
            .get(channel)
            .map_or(ConnectionStatus::Idle, |slot| slot.status)
    }

    /// Queue `text` on an open channel.
    ///
    /// # Errors
    ///
    /// Returns `HubError::NotConnected` if the channel has no live socket.
    pub fn send(&self, channel: &str, text: impl Into<String>) -> Result<(), HubError> {
        let channels = lock(&self.inner.channels);
        let outbound = channels
            .get(channel)
            .and_then(|slot| slot.outbound.as_ref())
            .ok_or_else(|| HubError::NotConnected(channel.to_owned()))?;
        outbound
            .send(text.into())
            .map_err(|_| HubError::NotConnected(channel.to_owned()))
    }

    fn open(&self, name: String) {
        let epoch = {
            let mut next = lock(&self.inner.next_epoch);
            *next += 1;
            *next
        };

        let mut channels = lock(&self.inner.channels);
        if let Some(slot) = channels.get(&name) {
            if matches!(slot.status, ConnectionStatus::Connecting | ConnectionStatus::Connected) {
                debug!(channel = %name, "channel already open");
                return;
            }
        }
        let task = tokio::spawn(run_channel(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.connector),
            self.inner.events.clone(),
            name.clone(),
            epoch,
        ));
        channels.insert(
            name,
            ChannelSlot { status: ConnectionStatus::Connecting, epoch, task: Some(task), outbound: None },
        );
    }
}

// =============================================================================
// TASKS
// =============================================================================

async fn watch_auth(hub: Weak<HubInner>, mut auth: watch::Receiver<Arc<AuthState>>) {
    while auth.changed().await.is_ok() {
        let signed_in = auth.borrow_and_update().is_authenticated;
        let Some(inner) = hub.upgrade() else {
            return;
        };
        if !signed_in {
            inner.close_all("signed out");
        }
    }
}

async fn run_channel(
    hub: Weak<HubInner>,
    connector: Arc<dyn ChannelConnector>,
    events: broadcast::Sender<HubEvent>,
    channel: String,
    epoch: u64,
) {
    let Some((connect_timeout, reconnect_delay)) = hub.upgrade().map(|h| (h.connect_timeout, h.reconnect_delay))
    else {
        return;
    };
    let mut reconnects_left = 1_u32;

    loop {
        let outcome = match tokio::time::timeout(connect_timeout, connector.connect(&channel)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Connect(format!("timed out after {}ms", connect_timeout.as_millis()))),
        };

        let failure = match outcome {
            Ok(mut link) => {
                let Some(inner) = hub.upgrade() else {
                    return;
                };
                if !inner.attach(&channel, epoch, link.outbound.clone()) {
                    return;
                }
                drop(inner);
                reconnects_left = 1;
                info!(%channel, "channel connected");
                let _ = events.send(HubEvent::Connected { channel: channel.clone() });

                while let Some(text) = link.inbound.recv().await {
                    let _ = events.send(HubEvent::Message { channel: channel.clone(), text });
                }
                "closed by peer".to_owned()
            }
            Err(e) => e.to_string(),
        };

        let Some(inner) = hub.upgrade() else {
            return;
        };
        if !inner.is_ready() {
            if inner.set_status(&channel, epoch, ConnectionStatus::Disconnected) {
                inner.emit(HubEvent::Disconnected { channel: channel.clone(), reason: "signed out".to_owned() });
            }
            return;
        }
        if reconnects_left == 0 {
            if inner.set_status(&channel, epoch, ConnectionStatus::Failed) {
                warn!(%channel, error = %failure, "channel failed; reconnect budget spent");
                inner.emit(HubEvent::ConnectionFailed { channel: channel.clone(), error: failure });
            }
            return;
        }
        reconnects_left -= 1;
        if !inner.set_status(&channel, epoch, ConnectionStatus::Connecting) {
            return;
        }
        warn!(%channel, error = %failure, "channel dropped; reconnecting once");
        inner.emit(HubEvent::Disconnected { channel: channel.clone(), reason: failure });
        drop(inner);

        tokio::time::sleep(reconnect_delay).await;
    }
}
