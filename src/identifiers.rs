//! Type-safe identifiers.
//!
//! Newtype wrappers keep consumer handles, transport subscription ids and
//! topic names from being mixed up.

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

// ============================================================================
// Counters
// ============================================================================

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Topic
// ============================================================================

/// A named channel consumers subscribe to.
///
/// Opaque: only equality matters, the string is never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// Creates a topic from any string-like value.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the topic name.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Topic> for Topic {
    fn from(value: &Topic) -> Self {
        value.clone()
    }
}

// ============================================================================
// SubscriptionId
// ============================================================================

/// Opaque handle for one registered callback.
///
/// Ids increase monotonically, so ordering by id is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Allocates the next process-wide subscription id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TransportSubscriptionId
// ============================================================================

/// Id of a live transport-level subscription (the STOMP `id` header).
///
/// A fresh id is generated every time a topic is attached, so ids never
/// leak across connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportSubscriptionId(String);

impl TransportSubscriptionId {
    /// Generates a new random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sub-{}", Uuid::new_v4().simple()))
    }

    /// Returns the id as sent on the wire.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Identity of one physical transport connection.
///
/// Used to ignore close notifications from connections that are no longer
/// current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next connection id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
