use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(UserId, "user");
branded_id!(RoomId, "room");
branded_id!(ConnectionId, "conn");
branded_id!(MessageId, "msg");

impl UserId {
    /// Fallback identity for connections that arrive without one.
    ///
    /// Second resolution only, so two anonymous connections in the same
    /// second share an id and the later one replaces the earlier.
    pub fn anonymous() -> Self {
        Self(format!("anonymous_{}", chrono::Utc::now().format("%H%M%S")))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with("anonymous_")
    }
}

impl RoomId {
    /// Deterministic room for a one-to-one conversation: the two user ids
    /// in lexical order joined by `_`.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
        Self(format!("{lo}_{hi}"))
    }
}
