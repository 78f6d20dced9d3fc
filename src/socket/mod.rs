//! Connection manager for the real-time event channel.
//!
//! Owns at most one live connection per session. Unlike the browser console's
//! global singleton, the manager is an explicitly owned, cloneable handle;
//! consumers hold [`Subscription`]s whose guards reference-count the
//! connection, so teardown happens when the last interested view is gone
//! rather than when whichever view disconnects first.
//!
//! Reconnect policy: an abnormal disconnect is retried up to a configured
//! maximum with linearly increasing delay. Errors classified as
//! authentication failures never retry; the caller refreshes credentials and
//! calls [`SocketManager::connect`] again.

mod transport;

pub use transport::{ClientFrame, Connection, ServerFrame, SocketError, SocketTransport, WsTransport};

#[cfg(feature = "mock")]
pub use transport::MockSocketTransport;

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::auth::TokenStore;
use crate::config::SocketConfig;
use crate::events::{OpsEvent, SubscribeAck};

/// Topic covering all active incidents and units
pub const OPS_TOPIC: &str = "ops";

pub fn incident_topic(id: &str) -> String {
    format!("incident:{id}")
}

enum Control {
    Subscribe {
        topic: String,
        ack: oneshot::Sender<SubscribeAck>,
    },
    Unsubscribe {
        topic: String,
    },
    Shutdown,
}

/// A live interest in a topic: an event receiver, the subscription ack and
/// the guard that keeps the connection reference-counted
pub struct Subscription {
    events: broadcast::Receiver<OpsEvent>,
    pub ack: oneshot::Receiver<SubscribeAck>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<OpsEvent, broadcast::error::RecvError> {
        self.events.recv().await
    }
}

struct SubscriptionGuard {
    inner: Arc<dyn Release>,
    topic: Option<String>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(topic) = self.topic.take() {
            self.inner.release(&topic);
        }
    }
}

trait Release: Send + Sync {
    fn release(&self, topic: &str);
}

struct DriverState {
    control: Option<mpsc::UnboundedSender<Control>>,
    driver: Option<JoinHandle<()>>,
}

struct Inner<T> {
    transport: T,
    config: SocketConfig,
    tokens: TokenStore,
    events_tx: broadcast::Sender<OpsEvent>,
    connected: AtomicBool,
    // Bumped on every connect/disconnect; drivers carry the value they were
    // spawned under
    epoch: AtomicU64,
    subscribers: AtomicUsize,
    // Per-topic subscriber counts; a topic unsubscribes at zero
    topics: Mutex<HashMap<String, usize>>,
    state: Mutex<DriverState>,
}

impl<T> Inner<T> {
    fn shutdown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("socket state lock");
        if let Some(control) = state.control.take() {
            let _ = control.send(Control::Shutdown);
        }
        state.driver.take();
        self.connected.store(false, Ordering::SeqCst);
    }

    /// A superseded driver winding down must not clobber the connected flag
    /// of its replacement
    fn set_connected(&self, epoch: u64, connected: bool) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.connected.store(connected, Ordering::SeqCst);
        }
    }
}

impl<T: Send + Sync> Release for Inner<T> {
    fn release(&self, topic: &str) {
        {
            let mut topics = self.topics.lock().expect("socket topics lock");
            if let Some(count) = topics.get_mut(topic) {
                *count -= 1;
                if *count == 0 {
                    topics.remove(topic);
                    let state = self.state.lock().expect("socket state lock");
                    if let Some(control) = &state.control {
                        let _ = control.send(Control::Unsubscribe {
                            topic: topic.to_string(),
                        });
                    }
                }
            }
        }

        if self.subscribers.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("last subscriber gone, closing socket");
            self.shutdown();
        }
    }
}

pub struct SocketManager<T: SocketTransport + Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: SocketTransport + Send + Sync + 'static> Clone for SocketManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SocketManager<WsTransport> {
    pub fn new(config: SocketConfig, tokens: TokenStore) -> Self {
        let transport = WsTransport::new(&config);
        Self::with_transport(transport, config, tokens)
    }
}

impl<T: SocketTransport + Send + Sync + 'static> SocketManager<T> {
    pub fn with_transport(transport: T, config: SocketConfig, tokens: TokenStore) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                tokens,
                events_tx,
                connected: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                subscribers: AtomicUsize::new(0),
                topics: Mutex::new(HashMap::new()),
                state: Mutex::new(DriverState {
                    control: None,
                    driver: None,
                }),
            }),
        }
    }

    /// Open the connection. A no-op without a stored access token; when
    /// already connected the existing connection is torn down and reopened
    /// (used after a credential refresh).
    pub fn connect(&self) {
        if !self.inner.tokens.has_session() {
            info!("no access token available for socket connection");
            return;
        }

        let mut state = self.inner.state.lock().expect("socket state lock");
        if let Some(control) = state.control.take() {
            debug!("reopening socket connection");
            let _ = control.send(Control::Shutdown);
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        state.control = Some(control_tx);
        state.driver = Some(tokio::spawn(run_driver(self.inner.clone(), epoch, control_rx)));
    }

    /// Close the connection regardless of remaining subscribers. Safe to
    /// call when not connected.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to the operations topic (all active incidents and units)
    pub fn subscribe_ops(&self) -> Subscription {
        self.subscribe_topic(OPS_TOPIC.to_string())
    }

    /// Subscribe to patch events scoped to one incident
    pub fn subscribe_incident(&self, id: &str) -> Subscription {
        self.subscribe_topic(incident_topic(id))
    }

    /// A passive event receiver without a topic subscription of its own;
    /// only sees what the active subscriptions cause the server to push
    pub fn events(&self) -> broadcast::Receiver<OpsEvent> {
        self.inner.events_tx.subscribe()
    }

    fn subscribe_topic(&self, topic: String) -> Subscription {
        let events = self.inner.events_tx.subscribe();
        let (ack_tx, ack_rx) = oneshot::channel();

        self.inner.subscribers.fetch_add(1, Ordering::SeqCst);
        {
            let mut topics = self.inner.topics.lock().expect("socket topics lock");
            *topics.entry(topic.clone()).or_insert(0) += 1;
        }

        // When no driver is running yet the topic is replayed on connect and
        // the ack resolves as canceled
        let state = self.inner.state.lock().expect("socket state lock");
        if let Some(control) = &state.control {
            let _ = control.send(Control::Subscribe {
                topic: topic.clone(),
                ack: ack_tx,
            });
        }
        drop(state);

        Subscription {
            events,
            ack: ack_rx,
            _guard: SubscriptionGuard {
                inner: self.inner.clone(),
                topic: Some(topic),
            },
        }
    }

    #[cfg(test)]
    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.inner.state.lock().expect("socket state lock").driver.take()
    }
}

enum PumpEnd {
    Shutdown,
    Lost,
}

async fn run_driver<T: SocketTransport + Send + Sync>(
    inner: Arc<Inner<T>>,
    epoch: u64,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let max_attempts = inner.config.max_reconnect_attempts;
    let mut attempts = 0u32;

    loop {
        let Some(token) = inner.tokens.access_token() else {
            info!("session gone, not connecting socket");
            return;
        };

        match inner.transport.open(&inner.config.url, &token).await {
            Ok(connection) => {
                attempts = 0;
                inner.set_connected(epoch, true);
                info!("socket connected to {}", inner.config.url);

                let end = pump(&inner, connection, &mut control).await;
                inner.set_connected(epoch, false);

                match end {
                    PumpEnd::Shutdown => return,
                    PumpEnd::Lost => warn!("socket connection lost"),
                }
            }
            Err(e) if e.is_auth() => {
                // The caller is expected to refresh credentials and call
                // connect() again; retrying a rejected token loops forever
                error!("socket authentication failed: {e}");
                return;
            }
            Err(e) => {
                warn!("socket connection error: {e}");
            }
        }

        attempts += 1;
        if attempts > max_attempts {
            error!("socket reconnect abandoned after {max_attempts} attempts");
            return;
        }
        info!("reconnecting socket ({attempts}/{max_attempts})");

        let deadline = tokio::time::Instant::now() + inner.config.reconnect_delay * attempts;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                ctrl = control.recv() => match ctrl {
                    Some(Control::Shutdown) | None => return,
                    // Not connected; the topic is already registered and
                    // replays once the connection is back
                    Some(Control::Subscribe { .. }) | Some(Control::Unsubscribe { .. }) => {}
                },
            }
        }
    }
}

async fn pump<T>(
    inner: &Inner<T>,
    mut connection: Connection,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> PumpEnd {
    let mut pending: HashMap<u64, oneshot::Sender<SubscribeAck>> = HashMap::new();
    let mut next_id: u64 = 1;

    // Replay topics registered before connect or carried over a reconnect
    let topics: Vec<String> = {
        let topics = inner.topics.lock().expect("socket topics lock");
        topics.keys().cloned().collect()
    };
    for topic in topics {
        let id = next_id;
        next_id += 1;
        if connection
            .outgoing
            .send(ClientFrame::Subscribe { id, topic })
            .await
            .is_err()
        {
            return PumpEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            ctrl = control.recv() => match ctrl {
                Some(Control::Subscribe { topic, ack }) => {
                    let id = next_id;
                    next_id += 1;
                    pending.insert(id, ack);
                    if connection
                        .outgoing
                        .send(ClientFrame::Subscribe { id, topic })
                        .await
                        .is_err()
                    {
                        return PumpEnd::Lost;
                    }
                }
                Some(Control::Unsubscribe { topic }) => {
                    if connection
                        .outgoing
                        .send(ClientFrame::Unsubscribe { topic })
                        .await
                        .is_err()
                    {
                        return PumpEnd::Lost;
                    }
                }
                Some(Control::Shutdown) | None => return PumpEnd::Shutdown,
            },
            frame = connection.incoming.recv() => match frame {
                Some(ServerFrame::Event { name, data }) => {
                    if let Some(event) = OpsEvent::parse(&name, data) {
                        // No receivers is fine; views come and go
                        let _ = inner.events_tx.send(event);
                    }
                }
                Some(ServerFrame::Ack { id, ok, error }) => {
                    if let Some(ack) = pending.remove(&id) {
                        let _ = ack.send(SubscribeAck { ok, error });
                    }
                }
                None => return PumpEnd::Lost,
            },
        }
    }
}
