//! Subscription registry.
//!
//! The registry is the single source of truth for what should be
//! subscribed. It maps each topic to its callbacks, ordered by
//! [`SubscriptionId`] (which is registration order), plus the id of the
//! topic's transport subscription if one is live.
//!
//! Transport ids are a disposable cache: they are dropped when the
//! connection goes away and regenerated by [`Registry::resubscribe_all`]
//! after every (re)connect. Callbacks survive until unsubscribed or until
//! [`Registry::clear`].
//!
//! The registry never touches the socket. Methods return the attachments
//! to create or remove and the client sends the frames.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::error;

use crate::identifiers::{SubscriptionId, Topic, TransportSubscriptionId};
use crate::protocol::Update;

// ============================================================================
// Types
// ============================================================================

/// Subscriber callback.
///
/// Invoked on the connection task for every update on the subscribed
/// topic. May call `subscribe`/`unsubscribe` on the client.
pub type Callback = Arc<dyn Fn(&Update) + Send + Sync>;

/// A live (or to-be-created) transport subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Attachment {
    /// Transport subscription id.
    pub id: TransportSubscriptionId,
    /// Attached topic.
    pub topic: Topic,
}

/// Result of removing one subscription.
#[derive(Debug)]
pub(crate) struct Removal {
    /// Topic the subscription belonged to.
    pub topic: Topic,
    /// Transport subscription to detach, set when the topic became empty.
    pub detach: Option<TransportSubscriptionId>,
}

/// Callbacks and transport state for one topic.
#[derive(Default)]
struct TopicEntry {
    callbacks: BTreeMap<SubscriptionId, Callback>,
    transport: Option<TransportSubscriptionId>,
}

// ============================================================================
// Registry
// ============================================================================

/// Topic → callbacks map.
#[derive(Default)]
pub(crate) struct Registry {
    topics: FxHashMap<Topic, TopicEntry>,
    index: FxHashMap<SubscriptionId, Topic>,
}

impl Registry {
    /// Registers a callback on `topic`.
    pub fn subscribe(&mut self, topic: Topic, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.topics
            .entry(topic.clone())
            .or_default()
            .callbacks
            .insert(id, callback);
        self.index.insert(id, topic);
        id
    }

    /// Assigns a transport id to `topic` if it has callbacks and none yet.
    ///
    /// Returns the attachment to create, or `None` if the topic is already
    /// attached (or unknown).
    pub fn attach(&mut self, topic: &str) -> Option<Attachment> {
        let (topic, entry) = self.topics.get_key_value(topic)?;
        if entry.transport.is_some() {
            return None;
        }

        let topic = topic.clone();
        let id = TransportSubscriptionId::generate();
        self.topics.get_mut(topic.as_str())?.transport = Some(id.clone());
        Some(Attachment { id, topic })
    }

    /// Removes exactly one subscription.
    ///
    /// Returns `None` if the id is unknown (already removed or cleared).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Removal> {
        let topic = self.index.remove(&id)?;
        let entry = self.topics.get_mut(topic.as_str())?;
        entry.callbacks.remove(&id);

        let detach = if entry.callbacks.is_empty() {
            self.topics
                .remove(topic.as_str())
                .and_then(|entry| entry.transport)
        } else {
            None
        };

        Some(Removal { topic, detach })
    }

    /// Assigns a fresh transport id to every topic.
    ///
    /// Called right after a (re)connect. Yields exactly one attachment per
    /// distinct topic.
    pub fn resubscribe_all(&mut self) -> Vec<Attachment> {
        self.topics
            .iter_mut()
            .map(|(topic, entry)| {
                let id = TransportSubscriptionId::generate();
                entry.transport = Some(id.clone());
                Attachment {
                    id,
                    topic: topic.clone(),
                }
            })
            .collect()
    }

    /// Forgets all transport ids, keeping callbacks.
    ///
    /// Returns the number of attachments dropped.
    pub fn detach_all(&mut self) -> usize {
        self.topics
            .values_mut()
            .filter_map(|entry| entry.transport.take())
            .count()
    }

    /// Removes every subscription.
    ///
    /// Returns the live attachments so they can be detached.
    pub fn clear(&mut self) -> Vec<Attachment> {
        self.index.clear();
        self.topics
            .drain()
            .filter_map(|(topic, entry)| entry.transport.map(|id| Attachment { id, topic }))
            .collect()
    }

    /// Copies the callbacks of `topic` in registration order.
    pub fn snapshot(&self, topic: &str) -> Vec<(SubscriptionId, Callback)> {
        self.topics
            .get(topic)
            .map(|entry| {
                entry
                    .callbacks
                    .iter()
                    .map(|(id, callback)| (*id, Arc::clone(callback)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns `true` if the subscription is registered.
    #[inline]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of registered callbacks.
    #[inline]
    pub fn subscription_count(&self) -> usize {
        self.index.len()
    }

    /// Number of distinct topics.
    #[inline]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of topics with a live transport subscription.
    #[inline]
    pub fn attached_count(&self) -> usize {
        self.topics
            .values()
            .filter(|entry| entry.transport.is_some())
            .count()
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Invokes each callback in order, isolating panics.
///
/// Returns the number of callbacks that completed.
pub(crate) fn deliver(update: &Update, callbacks: &[(SubscriptionId, Callback)]) -> usize {
    let mut delivered = 0;

    for (id, callback) in callbacks {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(update))) {
            Ok(()) => delivered += 1,
            Err(payload) => {
                error!(
                    topic = %update.topic,
                    subscription = %id,
                    panic = panic_message(payload.as_ref()),
                    "Subscriber callback panicked"
                );
            }
        }
    }

    delivered
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// ============================================================================
// Tests
// ============================================================================
