//! Common identifier types for SFU components.
//!
//! Engine-assigned resources (transports, producers, consumers) and
//! connection-scoped peers are identified by UUIDs. Rooms are identified by a
//! caller-chosen code.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a peer session (one per signaling connection)
    PeerId
);

uuid_id!(
    /// Unique identifier for a transport
    TransportId
);

uuid_id!(
    /// Unique identifier for a producer
    ProducerId
);

uuid_id!(
    /// Unique identifier for a consumer
    ConsumerId
);

impl PeerId {
    /// Short prefix used to derive default display names (`user-xxxxx`).
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(5).collect()
    }
}

/// Stable, caller-chosen code identifying a room.
///
/// Surrounding whitespace is trimmed on every way in, wire decoding
/// included, so `"ABC "` and `"ABC"` name the same room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Create a room code.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        let trimmed = code.trim();
        if trimmed.len() == code.len() {
            Self(code)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Borrow the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the code is empty (rejected by join).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for RoomCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}
