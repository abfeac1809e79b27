//! Local value store: the current evaluation snapshot merged with the sticky value overlay.
//!
//! [`LocalValueStore`] is scoped to one [`UserIdentity`]. Reads of gates and configs go to the
//! snapshot only. Layer reads may be answered from the sticky value table, which lets a user keep
//! the value of an experiment they were bucketed into while that experiment remains active, even
//! after the server reassigns them.
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::{
    durable_store::{snapshot_key, DurableStore},
    sticky::{StickyScope, StickyValueTable},
    ConfigResult, EvaluationSnapshot, HashedName, Result, UserIdentity,
};

/// Evaluation cache for one user.
///
/// The snapshot is replaced copy-on-write, so readers never observe a partially updated
/// snapshot. Sticky values are read and written under a single async mutex, held across the
/// write to the durable store.
pub struct LocalValueStore {
    user: UserIdentity,
    durable_store: Arc<dyn DurableStore>,
    snapshot: RwLock<Arc<EvaluationSnapshot>>,
    sticky: Mutex<StickyValueTable>,
}

impl LocalValueStore {
    /// Create a store for `user`, loading sticky values and the last persisted snapshot from
    /// `durable_store`. No network I/O is done here.
    ///
    /// Storage failures are logged and result in empty state.
    pub async fn load(user: UserIdentity, durable_store: Arc<dyn DurableStore>) -> LocalValueStore {
        let sticky = StickyValueTable::load(&user, durable_store.as_ref()).await;
        let snapshot = load_cached_snapshot(&user, durable_store.as_ref())
            .await
            .unwrap_or_else(EvaluationSnapshot::empty);

        LocalValueStore {
            user,
            durable_store,
            snapshot: RwLock::new(Arc::new(snapshot)),
            sticky: Mutex::new(sticky),
        }
    }

    /// Identity this store was created for.
    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    /// Get currently active snapshot.
    pub fn snapshot(&self) -> Arc<EvaluationSnapshot> {
        let snapshot = self
            .snapshot
            .read()
            .expect("thread holding snapshot lock should not panic");
        snapshot.clone()
    }

    /// Replace the whole snapshot and persist its wire bytes.
    ///
    /// The swap is visible to readers as soon as this is called. Persistence failures are only
    /// logged.
    pub async fn replace_snapshot(&self, snapshot: EvaluationSnapshot) {
        // Constructing new value before requesting the lock to minimize lock span.
        let snapshot = Arc::new(snapshot);
        {
            let mut slot = self
                .snapshot
                .write()
                .expect("thread holding snapshot lock should not panic");
            *slot = snapshot.clone();
        }

        let key = snapshot_key(&self.user);
        if let Err(err) = self
            .durable_store
            .set(&key, snapshot.wire_json().to_vec())
            .await
        {
            log::warn!(
                target: "statsig", key = key.as_str();
                "failed to persist snapshot: {:?}", err
            );
        }
    }

    /// Parse an `initialize` response body and replace the snapshot with it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`](crate::Error::Serialization) if `wire_json` is not a
    /// snapshot object. The current snapshot is kept in that case.
    pub async fn set_values(&self, wire_json: Vec<u8>) -> Result<()> {
        let snapshot = EvaluationSnapshot::from_json(wire_json)?;
        self.replace_snapshot(snapshot).await;
        Ok(())
    }

    /// Look up a gate. Gates are never sticky.
    pub fn get_gate(&self, name: &HashedName) -> ConfigResult {
        let snapshot = self.snapshot();
        let result = snapshot.gate(name).cloned();
        log::trace!(target: "statsig", name, found = result.is_some(); "evaluated gate");
        result.unwrap_or_else(|| ConfigResult::default_gate(name.clone()))
    }

    /// Look up a dynamic config or experiment. No sticky values are applied.
    pub fn get_config(&self, name: &HashedName) -> ConfigResult {
        let snapshot = self.snapshot();
        let result = snapshot.dynamic_config(name).cloned();
        log::trace!(target: "statsig", name, found = result.is_some(); "evaluated dynamic config");
        result.unwrap_or_else(|| ConfigResult::default_config(name.clone()))
    }

    /// Look up a layer.
    ///
    /// With `keep_device_value == false` any sticky value for the layer is deleted and the latest
    /// result is returned.
    ///
    /// With `keep_device_value == true`:
    /// - a sticky value whose backing experiment is still active in the current snapshot is
    ///   returned as is, whatever the latest layer result says;
    /// - a sticky value whose backing experiment is inactive or missing is deleted;
    /// - if no valid sticky value remains, the latest result is returned and frozen as the new
    ///   sticky value when the user is in an active experiment.
    ///
    /// Sticky value changes are persisted before this returns.
    pub async fn get_layer(&self, name: &HashedName, keep_device_value: bool) -> ConfigResult {
        let snapshot = self.snapshot();
        let Some(latest) = snapshot.layer(name) else {
            log::trace!(target: "statsig", name; "layer is missing from snapshot");
            return ConfigResult::default_config(name.clone());
        };

        let scope = if latest.is_device_based {
            StickyScope::Device
        } else {
            StickyScope::User
        };
        let store = self.durable_store.as_ref();

        let mut sticky = self.sticky.lock().await;

        if !keep_device_value {
            sticky.remove(scope, name, store).await;
            return latest.clone();
        }

        if let Some(stuck) = sticky.get(scope, name).cloned() {
            if is_backing_experiment_active(&snapshot, &stuck) {
                log::trace!(target: "statsig", name; "serving sticky layer value");
                return stuck;
            }
            log::debug!(
                target: "statsig", name;
                "backing experiment is no longer active, dropping sticky value"
            );
            sticky.remove(scope, name, store).await;
        }

        if latest.should_stick() {
            sticky.insert(scope, latest.clone(), store).await;
        }

        latest.clone()
    }

    /// Drop every sticky value of this user, in memory and in the durable store.
    pub async fn wipe_all_sticky(&self) {
        let mut sticky = self.sticky.lock().await;
        sticky.clear(self.durable_store.as_ref()).await;
    }

    /// Wipe the durable store entirely and drop in-memory sticky values. The current snapshot
    /// stays in memory until it is replaced.
    pub async fn clear_local_storage(&self) -> Result<()> {
        let mut sticky = self.sticky.lock().await;
        sticky.clear(self.durable_store.as_ref()).await;
        self.durable_store.delete_all().await
    }
}

/// The backing experiment is resolved against the current snapshot, not the one the sticky value
/// was frozen from. A missing experiment counts as inactive.
fn is_backing_experiment_active(snapshot: &EvaluationSnapshot, stuck: &ConfigResult) -> bool {
    stuck
        .allocated_experiment_name
        .as_ref()
        .and_then(|experiment| snapshot.dynamic_config(experiment))
        .is_some_and(|experiment| experiment.is_experiment_active)
}

async fn load_cached_snapshot(
    user: &UserIdentity,
    store: &dyn DurableStore,
) -> Option<EvaluationSnapshot> {
    let key = snapshot_key(user);
    let bytes = match store.get(&key).await {
        Ok(bytes) => bytes?,
        Err(err) => {
            log::warn!(
                target: "statsig", key = key.as_str();
                "failed to read cached snapshot: {:?}", err
            );
            return None;
        }
    };

    EvaluationSnapshot::from_json(bytes)
        .inspect_err(|err| {
            log::warn!(
                target: "statsig", key = key.as_str();
                "discarding malformed cached snapshot: {:?}", err
            );
        })
        .ok()
}
