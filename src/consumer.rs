//! Lifecycle-bound consumer.
//!
//! A [`Consumer`] is what a UI view, background job or service holds while
//! it is alive. It subscribes through the shared client, remembers its own
//! handles and releases all of them on [`Consumer::deactivate`] or drop, so
//! a consumer going away never leaks callbacks into the registry.
//!
//! # Example
//!
//! ```no_run
//! use realtime_relay::{Consumer, EntityKind, RealtimeClient, Result};
//!
//! # async fn example(client: RealtimeClient) -> Result<()> {
//! let consumer = Consumer::new(client);
//! consumer.activate().await?;
//!
//! consumer.on_orders(|update| println!("orders: {}", update.body));
//! consumer.on_entity(EntityKind::Defect, |update| {
//!     println!("defect via updates topic: {:?}", update.parse());
//! });
//!
//! drop(consumer); // both callbacks removed
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::client::{ConnectionState, RealtimeClient, Subscription};
use crate::error::Result;
use crate::identifiers::{SubscriptionId, Topic};
use crate::protocol::{EntityKind, Update, topics};

// ============================================================================
// ConsumerOptions
// ============================================================================

/// Consumer behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Connect the shared client on [`Consumer::activate`].
    pub auto_connect: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self { auto_connect: true }
    }
}

impl ConsumerOptions {
    /// Options that leave connecting to the caller.
    #[inline]
    #[must_use]
    pub const fn manual() -> Self {
        Self {
            auto_connect: false,
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Subscriptions owned by one consumer of the shared client.
pub struct Consumer {
    client: RealtimeClient,
    options: ConsumerOptions,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("options", &self.options)
            .field("subscriptions", &self.subscriptions.lock().len())
            .field("state", &self.client.state())
            .finish()
    }
}

impl Consumer {
    /// Creates a consumer with default options.
    #[inline]
    #[must_use]
    pub fn new(client: RealtimeClient) -> Self {
        Self::with_options(client, ConsumerOptions::default())
    }

    /// Creates a consumer with explicit options.
    #[must_use]
    pub fn with_options(client: RealtimeClient, options: ConsumerOptions) -> Self {
        Self {
            client,
            options,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Returns the shared client.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }

    /// Returns the options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> ConsumerOptions {
        self.options
    }
}

// ============================================================================
// Consumer - Lifecycle
// ============================================================================

impl Consumer {
    /// Called when the consumer comes alive.
    ///
    /// Connects the shared client if `auto_connect` is set.
    ///
    /// # Errors
    ///
    /// Returns the connect error, if any.
    pub async fn activate(&self) -> Result<()> {
        if self.options.auto_connect {
            self.client.connect().await?;
        }
        Ok(())
    }

    /// Releases every subscription this consumer made.
    ///
    /// Returns the number released. The connection stays up for other
    /// consumers.
    pub fn deactivate(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let released = subscriptions
            .into_iter()
            .map(Subscription::unsubscribe)
            .filter(|removed| *removed)
            .count();

        if released > 0 {
            debug!(released, "Consumer deactivated");
        }
        released
    }

    /// Connects the shared client.
    ///
    /// # Errors
    ///
    /// See [`RealtimeClient::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    /// Disconnects the shared client.
    ///
    /// This affects every consumer: the registry is cleared.
    pub fn disconnect(&self) {
        self.subscriptions.lock().clear();
        self.client.disconnect();
    }

    /// Returns `true` while the shared transport is live.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Returns the shared connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Observes state changes of the shared connection.
    #[inline]
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.client.watch_state()
    }
}

// ============================================================================
// Consumer - Subscriptions
// ============================================================================

impl Consumer {
    /// Subscribes to `topic`; the handle is kept by the consumer.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> SubscriptionId
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        let subscription = self.client.subscribe(topic, callback);
        let id = subscription.id();
        self.subscriptions.lock().push(subscription);
        id
    }

    /// Removes one of this consumer's subscriptions.
    ///
    /// Returns `false` if the id does not belong to this consumer or is
    /// already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let subscription = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(index) = subscriptions.iter().position(|s| s.id() == id) else {
                return false;
            };
            subscriptions.swap_remove(index)
        };
        subscription.unsubscribe()
    }

    /// Number of subscriptions held by this consumer.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Subscribes to order changes.
    pub fn on_orders<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.subscribe(topics::ORDERS, callback)
    }

    /// Subscribes to stage changes.
    pub fn on_stages<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.subscribe(topics::STAGES, callback)
    }

    /// Subscribes to defect changes.
    pub fn on_defects<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.subscribe(topics::DEFECTS, callback)
    }

    /// Subscribes to the generic updates topic.
    pub fn on_updates<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.subscribe(topics::UPDATES, callback)
    }

    /// Subscribes to the generic updates topic, keeping only `kind`.
    pub fn on_entity<F>(&self, kind: EntityKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.subscribe(topics::UPDATES, move |update: &Update| {
            if update.is_entity(kind) {
                callback(update);
            }
        })
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.deactivate();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> RealtimeClient {
        RealtimeClient::builder()
            .endpoint("ws://127.0.0.1:9/ws")
            .build()
            .expect("client")
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Update) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &Update| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_default_options_auto_connect() {
        assert!(ConsumerOptions::default().auto_connect);
        assert!(!ConsumerOptions::manual().auto_connect);
    }

    #[test]
    fn test_named_helpers_use_topics() {
        let client = client();
        let consumer = Consumer::new(client.clone());

        consumer.on_orders(|_| {});
        consumer.on_stages(|_| {});
        consumer.on_defects(|_| {});
        consumer.on_updates(|_| {});

        assert_eq!(consumer.subscription_count(), 4);
        assert_eq!(client.topic_count(), 4);
    }

    #[test]
    fn test_drop_releases_subscriptions() {
        let client = client();
        let (count, callback) = counter();
        let _other = client.subscribe(topics::ORDERS, |_| {});

        {
            let consumer = Consumer::new(client.clone());
            consumer.on_orders(callback);
            assert_eq!(client.subscription_count(), 2);
        }

        assert_eq!(client.subscription_count(), 1);
        client.dispatch(topics::ORDERS, r#"{"entity":"ORDER","id":1}"#);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deactivate_keeps_other_consumers() {
        let client = client();
        let first = Consumer::new(client.clone());
        let second = Consumer::new(client.clone());

        first.on_stages(|_| {});
        second.on_stages(|_| {});

        assert_eq!(first.deactivate(), 1);
        assert_eq!(client.subscription_count(), 1);
        assert_eq!(second.subscription_count(), 1);
    }

    #[test]
    fn test_unsubscribe_only_own_ids() {
        let client = client();
        let consumer = Consumer::new(client.clone());
        let foreign = client.subscribe(topics::ORDERS, |_| {});

        let own = consumer.on_orders(|_| {});

        assert!(!consumer.unsubscribe(foreign.id()));
        assert!(consumer.unsubscribe(own));
        assert!(!consumer.unsubscribe(own));
        assert!(foreign.is_active());
    }

    #[test]
    fn test_on_entity_filters_discriminator() {
        let client = client();
        let consumer = Consumer::new(client.clone());
        let (count, callback) = counter();

        consumer.on_entity(EntityKind::Defect, callback);

        client.dispatch(topics::UPDATES, r#"{"entity":"ORDER","id":1}"#);
        client.dispatch(topics::UPDATES, r#"{"entity":"DEFECT","id":2}"#);
        client.dispatch(topics::UPDATES, r#"{"id":3}"#);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activate_without_auto_connect_is_noop() {
        let consumer = Consumer::with_options(client(), ConsumerOptions::manual());
        consumer.activate().await.expect("activate");
        assert!(!consumer.is_connected());
    }
}
