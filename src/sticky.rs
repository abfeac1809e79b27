//! Sticky value table: frozen layer results that survive experiment reassignment.
use std::collections::HashMap;

use crate::{
    durable_store::{sticky_device_key, sticky_user_key, DurableStore},
    ConfigResult, HashedName, UserIdentity,
};

/// Which identity a sticky value is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StickyScope {
    /// Attached to the logical user ID.
    User,
    /// Attached to the device ID, shared by every user of the device.
    Device,
}

type StickyValues = HashMap<HashedName, ConfigResult>;

/// In-memory copy of the sticky values for one identity, written through to a [`DurableStore`].
///
/// Callers are responsible for serializing access; the table itself holds no lock.
#[derive(Debug)]
pub(crate) struct StickyValueTable {
    user_key: String,
    /// `None` if the identity has no device ID. Device-scoped values then fall back to the user
    /// scope.
    device_key: Option<String>,
    user: StickyValues,
    device: StickyValues,
}

impl StickyValueTable {
    /// Load sticky values for `user`. Missing or unreadable blobs yield an empty table.
    pub(crate) async fn load(user: &UserIdentity, store: &dyn DurableStore) -> StickyValueTable {
        let user_key = sticky_user_key(user);
        let device_key = user.device_id.as_deref().map(sticky_device_key);

        let user_values = load_values(store, &user_key).await;
        let device_values = match &device_key {
            Some(key) => load_values(store, key).await,
            None => StickyValues::new(),
        };

        StickyValueTable {
            user_key,
            device_key,
            user: user_values,
            device: device_values,
        }
    }

    pub(crate) fn get(&self, scope: StickyScope, name: &HashedName) -> Option<&ConfigResult> {
        self.values(scope).get(name)
    }

    /// Freeze `value` under its name and persist the scope.
    pub(crate) async fn insert(
        &mut self,
        scope: StickyScope,
        value: ConfigResult,
        store: &dyn DurableStore,
    ) {
        let scope = self.resolve(scope);
        self.values_mut(scope).insert(value.name.clone(), value);
        self.persist(scope, store).await;
    }

    /// Delete the entry for `name`, persisting only if something was removed.
    pub(crate) async fn remove(
        &mut self,
        scope: StickyScope,
        name: &HashedName,
        store: &dyn DurableStore,
    ) {
        let scope = self.resolve(scope);
        if self.values_mut(scope).remove(name).is_some() {
            self.persist(scope, store).await;
        }
    }

    /// Drop every sticky value of this identity, in memory and in the store.
    pub(crate) async fn clear(&mut self, store: &dyn DurableStore) {
        self.user.clear();
        self.device.clear();
        self.persist(StickyScope::User, store).await;
        if self.device_key.is_some() {
            self.persist(StickyScope::Device, store).await;
        }
    }

    fn resolve(&self, scope: StickyScope) -> StickyScope {
        match scope {
            StickyScope::Device if self.device_key.is_some() => StickyScope::Device,
            _ => StickyScope::User,
        }
    }

    fn values(&self, scope: StickyScope) -> &StickyValues {
        match self.resolve(scope) {
            StickyScope::User => &self.user,
            StickyScope::Device => &self.device,
        }
    }

    fn values_mut(&mut self, scope: StickyScope) -> &mut StickyValues {
        match self.resolve(scope) {
            StickyScope::User => &mut self.user,
            StickyScope::Device => &mut self.device,
        }
    }

    async fn persist(&self, scope: StickyScope, store: &dyn DurableStore) {
        let (key, values) = match (scope, &self.device_key) {
            (StickyScope::Device, Some(device_key)) => (device_key, &self.device),
            _ => (&self.user_key, &self.user),
        };

        let result = if values.is_empty() {
            store.delete(key).await
        } else {
            match serde_json::to_vec(values) {
                Ok(bytes) => store.set(key, bytes).await,
                Err(err) => Err(err.into()),
            }
        };

        if let Err(err) = result {
            log::warn!(
                target: "statsig", key = key.as_str();
                "failed to persist sticky values: {:?}", err
            );
        }
    }
}

async fn load_values(store: &dyn DurableStore, key: &str) -> StickyValues {
    let bytes = match store.get(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return StickyValues::new(),
        Err(err) => {
            log::warn!(target: "statsig", key; "failed to read sticky values: {:?}", err);
            return StickyValues::new();
        }
    };

    serde_json::from_slice(&bytes).unwrap_or_else(|err| {
        log::warn!(target: "statsig", key; "discarding malformed sticky values: {:?}", err);
        StickyValues::new()
    })
}

#[cfg(test)]
mod tests {
    use super::{StickyScope, StickyValueTable};
    use crate::{
        durable_store::{sticky_device_key, sticky_user_key},
        ConfigResult, DurableStore, HashedName, InMemoryStore, UserIdentity,
    };

    fn sticky(name: &str) -> ConfigResult {
        ConfigResult {
            rule_id: "sticky".to_owned(),
            is_experiment_active: true,
            is_user_in_experiment: true,
            ..ConfigResult::default_config(HashedName::of(name))
        }
    }

    #[tokio::test]
    async fn insert_survives_reload() {
        let store = InMemoryStore::new();
        let user = UserIdentity::new("dloomb");

        let mut table = StickyValueTable::load(&user, &store).await;
        table.insert(StickyScope::User, sticky("layer"), &store).await;

        let reloaded = StickyValueTable::load(&user, &store).await;
        assert_eq!(
            reloaded.get(StickyScope::User, &HashedName::of("layer")),
            Some(&sticky("layer"))
        );
    }

    #[tokio::test]
    async fn device_scope_is_shared_between_users() {
        let store = InMemoryStore::new();
        let alice = UserIdentity::new("alice").with_device_id("device");
        let bob = UserIdentity::new("bob").with_device_id("device");

        let mut table = StickyValueTable::load(&alice, &store).await;
        table.insert(StickyScope::Device, sticky("layer"), &store).await;

        let bobs = StickyValueTable::load(&bob, &store).await;
        assert!(bobs
            .get(StickyScope::Device, &HashedName::of("layer"))
            .is_some());
        assert!(bobs
            .get(StickyScope::User, &HashedName::of("layer"))
            .is_none());
        assert!(store.get(&sticky_device_key("device")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn device_scope_falls_back_to_user_without_device_id() {
        let store = InMemoryStore::new();
        let user = UserIdentity::new("dloomb");

        let mut table = StickyValueTable::load(&user, &store).await;
        table.insert(StickyScope::Device, sticky("layer"), &store).await;

        assert!(table
            .get(StickyScope::User, &HashedName::of("layer"))
            .is_some());
        assert!(store.get(&sticky_user_key(&user)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removing_last_entry_deletes_blob() {
        let store = InMemoryStore::new();
        let user = UserIdentity::new("dloomb");

        let mut table = StickyValueTable::load(&user, &store).await;
        table.insert(StickyScope::User, sticky("layer"), &store).await;
        table
            .remove(StickyScope::User, &HashedName::of("layer"), &store)
            .await;

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn malformed_blob_loads_as_empty() {
        let store = InMemoryStore::new();
        let user = UserIdentity::new("dloomb");
        store
            .set(&sticky_user_key(&user), b"not json".to_vec())
            .await
            .unwrap();

        let table = StickyValueTable::load(&user, &store).await;
        assert!(table
            .get(StickyScope::User, &HashedName::of("layer"))
            .is_none());
    }
}
