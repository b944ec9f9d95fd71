//! Decoded push payloads.
//!
//! Every MESSAGE body is decoded to JSON before dispatch. The relay itself
//! never branches on the contents: [`Update::parse`] is a typed view for
//! consumers that care about the `entity` discriminator.
//!
//! # Entities
//!
//! | Tag | Variant | Topic |
//! |-----|---------|-------|
//! | `ORDER` | [`ParsedUpdate::Order`] | [`topics::ORDERS`] |
//! | `STAGE` | [`ParsedUpdate::Stage`] | [`topics::STAGES`] |
//! | `DEFECT` | [`ParsedUpdate::Defect`] | [`topics::DEFECTS`] |
//!
//! Pushes are hints to refetch; consumers reload authoritative state over
//! their own data layer after receiving one.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::Topic;

// ============================================================================
// Topics
// ============================================================================

/// Well-known destinations.
pub mod topics {
    /// Order changes.
    pub const ORDERS: &str = "/topic/orders";
    /// Production stage changes.
    pub const STAGES: &str = "/topic/stages";
    /// Defect reports.
    pub const DEFECTS: &str = "/topic/defects";
    /// Generic updates tagged with an `entity` field.
    pub const UPDATES: &str = "/topic/updates";
}

// ============================================================================
// EntityKind
// ============================================================================

/// Entity kinds carried in the `entity` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// `ORDER`
    Order,
    /// `STAGE`
    Stage,
    /// `DEFECT`
    Defect,
}

impl EntityKind {
    /// Returns the wire tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Order => "ORDER",
            Self::Stage => "STAGE",
            Self::Defect => "DEFECT",
        }
    }

    /// Parses a wire tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ORDER" => Some(Self::Order),
            "STAGE" => Some(Self::Stage),
            "DEFECT" => Some(Self::Defect),
            _ => None,
        }
    }

    /// Returns the dedicated topic for this kind.
    #[must_use]
    pub const fn topic(self) -> &'static str {
        match self {
            Self::Order => topics::ORDERS,
            Self::Stage => topics::STAGES,
            Self::Defect => topics::DEFECTS,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ============================================================================
// Update
// ============================================================================

/// A decoded push for one topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Topic the push arrived on.
    pub topic: Topic,
    /// Decoded JSON body.
    pub body: Value,
}

impl Update {
    /// Decodes a raw body received on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the body is not JSON.
    pub fn decode(topic: impl Into<Topic>, body: &str) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            body: serde_json::from_str(body)?,
        })
    }

    /// Returns the `entity` discriminator, if present.
    #[inline]
    #[must_use]
    pub fn entity(&self) -> Option<&str> {
        self.body.get("entity").and_then(Value::as_str)
    }

    /// Returns `true` if the discriminator names `kind`.
    #[inline]
    #[must_use]
    pub fn is_entity(&self, kind: EntityKind) -> bool {
        self.entity() == Some(kind.tag())
    }

    /// Deserializes the body into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the shape does not match.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.body)?)
    }

    /// Parses the body into a typed variant.
    #[must_use]
    pub fn parse(&self) -> ParsedUpdate {
        let id = self.body.get("id").and_then(Value::as_u64);

        match self.entity().and_then(EntityKind::from_tag) {
            Some(EntityKind::Order) => ParsedUpdate::Order { id },
            Some(EntityKind::Stage) => ParsedUpdate::Stage { id },
            Some(EntityKind::Defect) => ParsedUpdate::Defect { id },
            None => ParsedUpdate::Unrecognized {
                entity: self.entity().map(str::to_string),
                body: self.body.clone(),
            },
        }
    }
}

// ============================================================================
// ParsedUpdate
// ============================================================================

/// Typed view over an [`Update`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedUpdate {
    /// An order changed.
    Order {
        /// Order id.
        id: Option<u64>,
    },

    /// A production stage changed.
    Stage {
        /// Stage id.
        id: Option<u64>,
    },

    /// A defect was reported or changed.
    Defect {
        /// Defect id.
        id: Option<u64>,
    },

    /// Missing or unknown discriminator.
    Unrecognized {
        /// Raw `entity` value, if any.
        entity: Option<String>,
        /// Full body.
        body: Value,
    },
}

impl ParsedUpdate {
    /// Returns the entity kind, if recognized.
    #[must_use]
    pub const fn kind(&self) -> Option<EntityKind> {
        match self {
            Self::Order { .. } => Some(EntityKind::Order),
            Self::Stage { .. } => Some(EntityKind::Stage),
            Self::Defect { .. } => Some(EntityKind::Defect),
            Self::Unrecognized { .. } => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
