//! Arena reference data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ArenaId;

/// An arena (region or venue) that rounds are fought in.
///
/// Arenas arrive on the arena feed as full records. An upsert replaces the
/// stored record wholesale; fields are never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arena {
    /// Unique arena key.
    pub arena_id: ArenaId,
    /// Human-readable arena name.
    pub name: String,
    /// Free-form reference attributes (region, map pool, tier, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Arena {
    /// Create an arena with no attributes.
    pub fn new(arena_id: impl Into<ArenaId>, name: impl Into<String>) -> Self {
        Self {
            arena_id: arena_id.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style helper to attach one attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}
