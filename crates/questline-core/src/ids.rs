//! Identifier newtypes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
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
    };
}

string_id!(
    /// Connection identifier assigned by the pub/sub service on connect.
    ConnectionId
);
string_id!(
    /// User identifier embedded in minted access tokens.
    UserId
);

impl UserId {
    /// Generate an anonymous user id (`user_<uuid v7>`).
    pub fn generate() -> Self {
        Self(format!("user_{}", Uuid::now_v7()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_user_id_has_prefix() {
        let id = UserId::generate();
        assert!(id.as_str().starts_with("user_"), "got: {id}");
    }

    #[test]
    fn generated_user_ids_are_unique() {
        assert_ne!(UserId::generate(), UserId::generate());
    }

    #[test]
    fn connection_id_from_raw_preserves_value() {
        let id = ConnectionId::from_raw("abc-123");
        assert_eq!(id.as_str(), "abc-123");
        assert_eq!(id.to_string(), "abc-123");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ConnectionId::from_raw("conn_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"conn_1\"");
    }
}
