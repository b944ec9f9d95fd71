//! Connection manager.
//!
//! [`RealtimeClient`] owns the single transport connection, the
//! subscription registry and the connection state. Clones share all three.
//!
//! # Invariants
//!
//! - `session.link` is `Some` exactly while the state is `Connected`
//! - Every registry topic has a transport subscription while connected,
//!   and at most one
//! - `pending` holds the in-flight connect attempt, if any; concurrent
//!   callers await the same attempt
//! - `epoch` increments on every `disconnect()`; work started under an
//!   older epoch is discarded when it completes
//!
//! Lock order is `pending` before `session`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, SubscriptionId, Topic};
use crate::protocol::{Frame, Update};
use crate::transport::{self, CloseHandler, CloseReason, Connection, FrameHandler};

use super::builder::ClientBuilder;
use super::options::ClientOptions;
use super::reconnect;
use super::registry::{self, Attachment, Callback, Registry};
use super::state::ConnectionState;

// ============================================================================
// Types
// ============================================================================

/// Outcome shared by every caller of one connect attempt.
type ConnectOutcome = std::result::Result<(), Arc<Error>>;

/// In-flight connect attempt.
struct PendingConnect {
    attempt: Shared<BoxFuture<'static, ConnectOutcome>>,
    abort: AbortHandle,
}

/// Who started a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectMode {
    /// A consumer called `connect()`.
    Requested,
    /// The reconnect task.
    Reconnect,
}

/// Registry plus the live link, guarded together.
#[derive(Default)]
struct Session {
    registry: Registry,
    link: Option<Connection>,
}

// ============================================================================
// ClientInner
// ============================================================================

/// Shared state behind every [`RealtimeClient`] clone.
pub(crate) struct ClientInner {
    /// Validated options.
    options: ClientOptions,
    /// Registry and live link.
    session: Mutex<Session>,
    /// Observable connection state.
    state_tx: watch::Sender<ConnectionState>,
    /// In-flight connect attempt.
    pending: Mutex<Option<PendingConnect>>,
    /// Teardown generation.
    epoch: AtomicU64,
    /// Running reconnect task.
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// RealtimeClient
// ============================================================================

/// Shared, reconnecting connection to a STOMP broker with in-process
/// topic fan-out.
///
/// Construct one per application and hand out clones (or use
/// [`SharedContext`](crate::SharedContext)). Clones share the transport,
/// the registry and the state.
///
/// # Example
///
/// ```no_run
/// use realtime_relay::{RealtimeClient, Result, topics};
///
/// # async fn example() -> Result<()> {
/// let client = RealtimeClient::builder()
///     .endpoint("ws://localhost:8080/ws")
///     .token("session-token")
///     .build()?;
///
/// let orders = client.subscribe(topics::ORDERS, |update| {
///     println!("order changed: {}", update.body);
/// });
///
/// client.connect().await?;
/// // ...
/// orders.unsubscribe();
/// client.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.inner.options.endpoint.as_str())
            .field("state", &self.state())
            .field("topics", &session.registry.topic_count())
            .field("subscriptions", &session.registry.subscription_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RealtimeClient - Constructor
// ============================================================================

impl RealtimeClient {
    /// Creates a new client builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Creates a client from options.
    ///
    /// Nothing is dialed until [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                session: Mutex::new(Session::default()),
                state_tx,
                pending: Mutex::new(None),
                epoch: AtomicU64::new(0),
                reconnect_task: Mutex::new(None),
            }),
        })
    }
}

// ============================================================================
// RealtimeClient - Connection
// ============================================================================

impl RealtimeClient {
    /// Connects to the broker.
    ///
    /// Returns immediately when already connected. While an attempt is in
    /// flight, every caller awaits that same attempt. On success every
    /// registered topic is attached.
    ///
    /// A failed attempt is not retried; the state goes back to
    /// `Disconnected` and the registry is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] wrapping the cause (timeout, socket
    /// error, handshake rejection, or [`Error::Disconnected`] if
    /// `disconnect()` ran meanwhile).
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect_with(ConnectMode::Requested).await
    }

    /// Tears down the connection and clears every registration.
    ///
    /// Stops any pending reconnect and aborts any in-flight connect.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Returns `true` while the transport is live.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Returns a receiver that observes state changes.
    #[inline]
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Returns the client options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }
}

// ============================================================================
// RealtimeClient - Subscriptions
// ============================================================================

impl RealtimeClient {
    /// Registers `callback` for every update on `topic`.
    ///
    /// Attaches the topic to the transport if connected and not yet
    /// attached. Safe to call from inside a callback.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> Subscription
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.inner.subscribe(topic.into(), Arc::new(callback))
    }

    /// Removes one subscription by id.
    ///
    /// Returns `false` if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Publishes a JSON payload to `destination`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the transport is not live
    /// - [`Error::Json`] if serialization fails
    pub fn publish<T>(&self, destination: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_string(payload)?;
        let session = self.inner.session.lock();
        let link = session.link.as_ref().ok_or(Error::NotConnected)?;
        link.send(Frame::send(destination, body))
    }

    /// Delivers a raw payload locally as if it had been pushed on `topic`.
    ///
    /// Returns the number of callbacks that completed.
    pub fn dispatch(&self, topic: &str, body: &str) -> usize {
        self.inner.dispatch(topic, body)
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.session.lock().registry.subscription_count()
    }

    /// Number of distinct registered topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.session.lock().registry.topic_count()
    }

    /// Number of topics currently attached to the transport.
    #[must_use]
    pub fn attached_topic_count(&self) -> usize {
        self.inner.session.lock().registry.attached_count()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle returned by [`RealtimeClient::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
#[must_use = "keep the handle to unsubscribe later"]
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    client: Weak<ClientInner>,
}

impl Subscription {
    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the topic.
    #[inline]
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Returns `true` while still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.client
            .upgrade()
            .is_some_and(|client| client.session.lock().registry.contains(self.id))
    }

    /// Removes this subscription.
    ///
    /// Returns `false` if it was already removed (or the client is gone).
    pub fn unsubscribe(self) -> bool {
        self.client
            .upgrade()
            .is_some_and(|client| client.unsubscribe(self.id))
    }
}

// ============================================================================
// ClientInner - Connect
// ============================================================================

impl ClientInner {
    /// Starts or joins a connect attempt.
    pub(crate) async fn connect_with(self: &Arc<Self>, mode: ConnectMode) -> Result<()> {
        let attempt = {
            let mut pending = self.pending.lock();

            if self.state().is_connected() {
                return Ok(());
            }

            match pending.as_ref() {
                Some(in_flight) => {
                    debug!(?mode, "Joining in-flight connect");
                    in_flight.attempt.clone()
                }
                None => {
                    let epoch = self.epoch.load(Ordering::SeqCst);
                    self.set_state(ConnectionState::Connecting);

                    let task = tokio::spawn(Arc::clone(self).establish(epoch, mode));
                    let abort = task.abort_handle();
                    let attempt = async move {
                        task.await.unwrap_or_else(|e| {
                            if e.is_cancelled() {
                                Err(Arc::new(Error::Disconnected))
                            } else {
                                Err(Arc::new(Error::connection(format!(
                                    "Connect task failed: {e}"
                                ))))
                            }
                        })
                    }
                    .boxed()
                    .shared();

                    *pending = Some(PendingConnect {
                        attempt: attempt.clone(),
                        abort,
                    });
                    attempt
                }
            }
        };

        attempt.await.map_err(Error::Connect)
    }

    /// Runs one dial + handshake and installs the result.
    async fn establish(self: Arc<Self>, epoch: u64, mode: ConnectMode) -> ConnectOutcome {
        let id = ConnectionId::next();
        let result = transport::connect(
            &self.options,
            id,
            self.frame_handler(),
            self.close_handler(id),
        )
        .await;

        let mut pending = self.pending.lock();

        if !self.is_current_epoch(epoch) {
            if let Ok(connection) = &result {
                connection.shutdown();
            }
            debug!(%id, "Connect completed after disconnect, discarding");
            return Err(Arc::new(Error::Disconnected));
        }

        pending.take();

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                let next = if self.is_reconnecting() {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Disconnected
                };
                self.set_state(next);
                warn!(%id, ?mode, error = %e, "Connect failed");
                return Err(Arc::new(e));
            }
        };

        {
            let mut session = self.session.lock();
            session.link = Some(connection.clone());
            self.set_state(ConnectionState::Connected);

            let attachments = session.registry.resubscribe_all();
            for attachment in &attachments {
                send_subscribe(&connection, attachment);
            }
            info!(%id, topics = attachments.len(), "Connected, topics attached");
        }
        drop(pending);

        // The socket may have died before the link was installed.
        if !connection.is_open() {
            self.handle_transport_lost(id, &CloseReason::StreamEnded);
        }

        Ok(())
    }

    /// Tears everything down. Always succeeds.
    fn disconnect(&self) {
        let mut pending = self.pending.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(in_flight) = pending.take() {
            debug!("Aborting in-flight connect");
            in_flight.abort.abort();
        }

        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }

        let (link, attached, removed) = {
            let mut session = self.session.lock();
            let removed = session.registry.subscription_count();
            let attached = session.registry.clear();
            (session.link.take(), attached, removed)
        };

        self.set_state(ConnectionState::Disconnected);
        drop(pending);

        if let Some(link) = link {
            for attachment in &attached {
                let _ = link.send(Frame::unsubscribe(attachment.id.as_str()));
            }
            link.shutdown();
        }

        info!(epoch, removed, "Disconnected, registry cleared");
    }

    /// Returns `true` if no `disconnect()` happened since `epoch`.
    #[inline]
    pub(crate) fn is_current_epoch(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Returns `true` while a reconnect task is alive.
    fn is_reconnecting(&self) -> bool {
        self.reconnect_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Marks the reconnect policy as exhausted.
    pub(crate) fn reconnect_exhausted(&self, epoch: u64, attempts: u32) {
        let pending = self.pending.lock();
        if !self.is_current_epoch(epoch) || pending.is_some() || self.state().is_connected() {
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        warn!(attempts, "Reconnect attempts exhausted, staying disconnected");
    }
}

// ============================================================================
// ClientInner - Transport Events
// ============================================================================

impl ClientInner {
    /// Handler for MESSAGE frames.
    fn frame_handler(self: &Arc<Self>) -> FrameHandler {
        let client = Arc::downgrade(self);
        Arc::new(move |frame: Frame| {
            if let Some(client) = client.upgrade() {
                client.handle_frame(&frame);
            }
        })
    }

    /// Handler for unexpected closes of connection `id`.
    fn close_handler(self: &Arc<Self>, id: ConnectionId) -> CloseHandler {
        let client = Arc::downgrade(self);
        Box::new(move |reason: CloseReason| {
            if let Some(client) = client.upgrade() {
                client.handle_transport_lost(id, &reason);
            }
        })
    }

    fn handle_frame(&self, frame: &Frame) {
        let Some(topic) = frame.destination() else {
            warn!(headers = ?frame.headers, "Dropping MESSAGE without destination");
            return;
        };
        self.dispatch(topic, &frame.body);
    }

    /// Keeps registrations, drops transport state and schedules a reconnect.
    fn handle_transport_lost(self: &Arc<Self>, id: ConnectionId, reason: &CloseReason) {
        let epoch = {
            let mut session = self.session.lock();
            if session.link.as_ref().map(Connection::id) != Some(id) {
                debug!(%id, %reason, "Ignoring close of stale connection");
                return;
            }

            session.link = None;
            let detached = session.registry.detach_all();
            self.set_state(ConnectionState::Connecting);
            warn!(%id, %reason, detached, "Transport lost, registrations kept");

            self.epoch.load(Ordering::SeqCst)
        };

        self.spawn_reconnector(epoch);
    }

    fn spawn_reconnector(self: &Arc<Self>, epoch: u64) {
        let policy = self.options.reconnect.clone();
        if !policy.enabled {
            self.reconnect_exhausted(epoch, 0);
            return;
        }

        let mut task = self.reconnect_task.lock();
        if !self.is_current_epoch(epoch) {
            return;
        }
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(reconnect::run(
            Arc::downgrade(self),
            epoch,
            policy,
        )));
    }
}

// ============================================================================
// ClientInner - Registry
// ============================================================================

impl ClientInner {
    fn subscribe(self: &Arc<Self>, topic: Topic, callback: Callback) -> Subscription {
        let mut session = self.session.lock();
        let id = session.registry.subscribe(topic.clone(), callback);

        if let Some(link) = session.link.clone()
            && let Some(attachment) = session.registry.attach(topic.as_str())
        {
            send_subscribe(&link, &attachment);
        }

        debug!(%topic, subscription = %id, "Subscribed");

        Subscription {
            id,
            topic,
            client: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut session = self.session.lock();
        let Some(removal) = session.registry.unsubscribe(id) else {
            return false;
        };

        if let Some(detach) = removal.detach
            && let Some(link) = session.link.as_ref()
        {
            if let Err(e) = link.send(Frame::unsubscribe(detach.as_str())) {
                debug!(topic = %removal.topic, error = %e, "UNSUBSCRIBE not sent");
            } else {
                debug!(topic = %removal.topic, transport = %detach, "Topic detached");
            }
        }

        debug!(topic = %removal.topic, subscription = %id, "Unsubscribed");
        true
    }

    /// Decodes and fans out one payload.
    fn dispatch(&self, topic: &str, body: &str) -> usize {
        // Lock released before callbacks run
        let callbacks = self.session.lock().registry.snapshot(topic);
        if callbacks.is_empty() {
            trace!(topic, "No subscribers for topic");
            return 0;
        }

        let update = match Update::decode(topic, body) {
            Ok(update) => update,
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed payload");
                return 0;
            }
        };

        registry::deliver(&update, &callbacks)
    }

    #[inline]
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "Connection state changed");
        }
    }
}

/// Sends SUBSCRIBE for one attachment.
fn send_subscribe(link: &Connection, attachment: &Attachment) {
    let frame = Frame::subscribe(attachment.id.as_str(), attachment.topic.as_str());
    match link.send(frame) {
        Ok(()) => debug!(topic = %attachment.topic, transport = %attachment.id, "Topic attached"),
        Err(e) => warn!(topic = %attachment.topic, error = %e, "SUBSCRIBE not sent"),
    }
}

// ============================================================================
// Tests
// ============================================================================
