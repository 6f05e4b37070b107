//! Type-safe identifier wrappers around [`String`].
//!
//! Arenas, rounds, and players are identified by opaque strings assigned by
//! the game servers. Each gets its own newtype so an arena id can never be
//! passed where a round id is expected.

use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around [`String`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Return the inner [`String`].
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for an arena (the venue a round is fought in).
    ArenaId
}

define_id! {
    /// Unique identifier for a round.
    RoundId
}

define_id! {
    /// Unique identifier for a player.
    PlayerId
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ArenaId::new("arena-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"arena-1\"");
        let back: ArenaId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn id_display_matches_inner() {
        let id = PlayerId::from("C");
        assert_eq!(id.to_string(), "C");
        assert_eq!(id.as_str(), "C");
    }

    #[test]
    fn ids_order_lexically() {
        assert!(PlayerId::from("A") < PlayerId::from("B"));
        assert!(RoundId::from("r-10") < RoundId::from("r-9"));
    }
}
