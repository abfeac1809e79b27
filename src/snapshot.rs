//! Evaluation snapshot: the complete set of gate, dynamic config and layer results received from
//! the `initialize` endpoint.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{HashedName, Result};

/// Rule ID reported for values that are missing from the snapshot.
pub const DEFAULT_RULE_ID: &str = "default";

/// One evaluated entity: a gate, a dynamic config (experiment) or a layer.
///
/// This is also the persisted form of sticky values, so it must round-trip through serde
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigResult {
    /// Hashed name. Always equal to the key the entity was stored under.
    pub name: HashedName,
    /// Rule that produced this result.
    pub rule_id: String,
    /// Config or layer parameters. Empty for gates.
    #[serde(default)]
    pub value: Map<String, Value>,
    /// Gate value. Always `false` for configs and layers.
    #[serde(default)]
    pub bool_value: bool,
    /// Whether the experiment behind this result is still running.
    #[serde(default)]
    pub is_experiment_active: bool,
    /// Whether the user is allocated to that experiment.
    #[serde(default)]
    pub is_user_in_experiment: bool,
    /// Whether sticky values should be scoped by device instead of by user.
    #[serde(default)]
    pub is_device_based: bool,
    /// For layers, the dynamic config (experiment) currently backing this layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_experiment_name: Option<HashedName>,
    /// Opaque exposures forwarded with exposure events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_exposures: Vec<Value>,
}

impl ConfigResult {
    /// Result returned for a gate that is absent from the snapshot: off.
    pub fn default_gate(name: HashedName) -> ConfigResult {
        ConfigResult::empty(name)
    }

    /// Result returned for a config or layer that is absent from the snapshot: no parameters.
    pub fn default_config(name: HashedName) -> ConfigResult {
        ConfigResult::empty(name)
    }

    fn empty(name: HashedName) -> ConfigResult {
        ConfigResult {
            name,
            rule_id: DEFAULT_RULE_ID.to_owned(),
            value: Map::new(),
            bool_value: false,
            is_experiment_active: false,
            is_user_in_experiment: false,
            is_device_based: false,
            allocated_experiment_name: None,
            secondary_exposures: Vec::new(),
        }
    }

    /// Get a single parameter.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    /// Whether this result should be frozen into a sticky value on a sticky lookup.
    pub(crate) fn should_stick(&self) -> bool {
        self.is_user_in_experiment && self.is_experiment_active
    }
}

/// `TryParse` allows an entity to fail parsing without failing the parsing of the whole snapshot.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TryParse<T> {
    Parsed(T),
    ParseFailed(Value),
}

#[derive(Debug, Deserialize)]
struct GateWire {
    rule_id: String,
    value: bool,
    #[serde(default)]
    secondary_exposures: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ConfigWire {
    rule_id: String,
    value: Map<String, Value>,
    #[serde(default)]
    is_experiment_active: bool,
    #[serde(default)]
    is_user_in_experiment: bool,
    #[serde(default)]
    is_device_based: bool,
    #[serde(default)]
    allocated_experiment_name: Option<HashedName>,
    #[serde(default)]
    secondary_exposures: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SnapshotWire {
    #[serde(default)]
    feature_gates: HashMap<HashedName, TryParse<GateWire>>,
    #[serde(default)]
    dynamic_configs: HashMap<HashedName, TryParse<ConfigWire>>,
    #[serde(default)]
    layer_configs: HashMap<HashedName, TryParse<ConfigWire>>,
    #[serde(default)]
    time: Option<i64>,
}

impl GateWire {
    fn into_result(self, name: HashedName) -> ConfigResult {
        ConfigResult {
            rule_id: self.rule_id,
            bool_value: self.value,
            secondary_exposures: self.secondary_exposures,
            ..ConfigResult::empty(name)
        }
    }
}

impl ConfigWire {
    fn into_result(self, name: HashedName) -> ConfigResult {
        ConfigResult {
            name,
            rule_id: self.rule_id,
            value: self.value,
            bool_value: false,
            is_experiment_active: self.is_experiment_active,
            is_user_in_experiment: self.is_user_in_experiment,
            is_device_based: self.is_device_based,
            allocated_experiment_name: self.allocated_experiment_name,
            secondary_exposures: self.secondary_exposures,
        }
    }
}

/// An immutable set of evaluation results.
///
/// A snapshot is only ever replaced as a whole. It keeps the exact bytes it was parsed from, so
/// it can be persisted and parsed again after a restart.
#[derive(Debug, Clone)]
pub struct EvaluationSnapshot {
    /// When the snapshot was received by the SDK.
    pub received_at: DateTime<Utc>,
    /// Server-side evaluation time, if reported.
    pub time: Option<i64>,
    wire_json: Vec<u8>,
    feature_gates: HashMap<HashedName, ConfigResult>,
    dynamic_configs: HashMap<HashedName, ConfigResult>,
    layer_configs: HashMap<HashedName, ConfigResult>,
}

impl EvaluationSnapshot {
    /// Snapshot with no values. Every lookup against it yields a default result.
    pub fn empty() -> EvaluationSnapshot {
        EvaluationSnapshot {
            received_at: Utc::now(),
            time: None,
            wire_json: b"{}".to_vec(),
            feature_gates: HashMap::new(),
            dynamic_configs: HashMap::new(),
            layer_configs: HashMap::new(),
        }
    }

    /// Parse the `initialize` response body.
    ///
    /// Entities that fail to parse are dropped individually (and logged). The call only fails if
    /// the payload as a whole is not a snapshot object.
    pub fn from_json(wire_json: Vec<u8>) -> Result<EvaluationSnapshot> {
        let wire: SnapshotWire = serde_json::from_slice(&wire_json)?;

        Ok(EvaluationSnapshot {
            received_at: Utc::now(),
            time: wire.time,
            feature_gates: compile("feature_gates", wire.feature_gates, GateWire::into_result),
            dynamic_configs: compile(
                "dynamic_configs",
                wire.dynamic_configs,
                ConfigWire::into_result,
            ),
            layer_configs: compile("layer_configs", wire.layer_configs, ConfigWire::into_result),
            wire_json,
        })
    }

    /// Exact bytes this snapshot was parsed from.
    pub fn wire_json(&self) -> &[u8] {
        &self.wire_json
    }

    /// Look up a feature gate.
    pub fn gate(&self, name: &HashedName) -> Option<&ConfigResult> {
        self.feature_gates.get(name)
    }

    /// Look up a dynamic config or experiment.
    pub fn dynamic_config(&self, name: &HashedName) -> Option<&ConfigResult> {
        self.dynamic_configs.get(name)
    }

    /// Look up a layer.
    pub fn layer(&self, name: &HashedName) -> Option<&ConfigResult> {
        self.layer_configs.get(name)
    }

    /// Returns `true` if the snapshot holds no values at all.
    pub fn is_empty(&self) -> bool {
        self.feature_gates.is_empty()
            && self.dynamic_configs.is_empty()
            && self.layer_configs.is_empty()
    }
}

fn compile<T>(
    category: &'static str,
    entries: HashMap<HashedName, TryParse<T>>,
    into_result: fn(T, HashedName) -> ConfigResult,
) -> HashMap<HashedName, ConfigResult> {
    entries
        .into_iter()
        .filter_map(|(name, entry)| match entry {
            TryParse::Parsed(wire) => Some((name.clone(), into_result(wire, name))),
            TryParse::ParseFailed(_) => {
                log::warn!(target: "statsig", category, name; "failed to parse entity, skipping");
                None
            }
        })
        .collect()
}
