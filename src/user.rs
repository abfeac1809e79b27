use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

/// Identity of the user values are evaluated for.
///
/// Only `user_id` and `custom_ids` are sent in the `user` field of requests. `device_id` is
/// reported through SDK metadata and scopes sticky values of device-based experiments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Logical user ID.
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Stable ID of the device the SDK runs on.
    #[serde(skip)]
    pub device_id: Option<String>,
    /// Additional IDs keyed by ID type, forwarded verbatim.
    #[serde(rename = "customIDs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_ids: BTreeMap<String, String>,
}

impl UserIdentity {
    /// Create an identity for a logical user.
    pub fn new(user_id: impl Into<String>) -> UserIdentity {
        UserIdentity {
            user_id: Some(user_id.into()),
            ..UserIdentity::default()
        }
    }

    /// Update device ID with `device_id`.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> UserIdentity {
        self.device_id = Some(device_id.into());
        self
    }

    /// Add a custom ID (e.g., `companyID`).
    pub fn with_custom_id(
        mut self,
        id_type: impl Into<String>,
        id: impl Into<String>,
    ) -> UserIdentity {
        self.custom_ids.insert(id_type.into(), id.into());
        self
    }

    /// Stable string form of the logical user, used to namespace storage keys.
    ///
    /// Every component is URL-safe base64 encoded, so IDs containing the `;` and `:` separators
    /// cannot make two identities share a key. Device ID is not part of it: device-scoped data is
    /// keyed by device ID alone.
    pub fn stable_key(&self) -> String {
        let mut key = match &self.user_id {
            Some(user_id) => format!("userID:{}", URL_SAFE_NO_PAD.encode(user_id)),
            None => "anonymous".to_owned(),
        };
        // BTreeMap iterates in key order, so the key does not depend on insertion order.
        for (id_type, id) in &self.custom_ids {
            key.push(';');
            key.push_str(&URL_SAFE_NO_PAD.encode(id_type));
            key.push(':');
            key.push_str(&URL_SAFE_NO_PAD.encode(id));
        }
        key
    }
}
