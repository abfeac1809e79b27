//! Typed identifier for gate, config and layer names.
//!
//! The backend never sees human-readable names: every gate/config/layer is keyed by the
//! base64-encoded SHA-256 digest of its name. Keeping the hashed form in its own type prevents
//! accidentally looking up a display name in a snapshot.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hashed name of a gate, dynamic config or layer. Cheap to clone.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Into,
)]
#[serde(transparent)]
pub struct HashedName(Arc<str>);

impl HashedName {
    /// Hash a human-readable name.
    ///
    /// ```
    /// # use statsig_core::HashedName;
    /// let name = HashedName::of("a_gate");
    /// assert_eq!(name, HashedName::of("a_gate"));
    /// assert_ne!(name.as_str(), "a_gate");
    /// ```
    pub fn of(name: &str) -> HashedName {
        let digest = Sha256::digest(name.as_bytes());
        HashedName(STANDARD.encode(digest).into())
    }

    /// Wrap a name that is already hashed (e.g., a key received from the server).
    pub fn from_hashed(hashed: impl Into<Arc<str>>) -> HashedName {
        HashedName(hashed.into())
    }

    /// Hashed form, as sent by the server.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HashedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for HashedName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl log::kv::ToValue for HashedName {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}
