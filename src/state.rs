//! State document persistence
//!
//! One apply produces one JSON state document. The document must survive a
//! round trip through an engine that does not know every field, so each
//! structure escrows unrecognized keys through a flattened map.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::module::ResourceType;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode state: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// Everything one apply produced, sufficient to reuse and destroy it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct State {
    /// Where the module was loaded from; informational.
    #[serde(default)]
    pub module_path: String,

    /// The input values actually used, after defaulting.
    #[serde(default)]
    pub inputs: Map<String, Value>,

    /// Resource states keyed by resource name, in apply order.
    #[serde(default)]
    pub resources: IndexMap<String, ResourceState>,

    /// Evaluated module outputs.
    #[serde(default)]
    pub outputs: Map<String, Value>,

    /// Fields written by newer engines; preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Record of one realized resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    /// Container id, network id, volume name, image id, process name, or a
    /// symbolic id for resources without a daemon-side object.
    pub id: String,

    /// The fully-resolved property tree the applicator consumed.
    #[serde(default)]
    pub properties: Value,

    /// Values exposed to downstream expressions.
    #[serde(default)]
    pub outputs: Value,

    /// Resolved teardown command; absent for most resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy_cmd: Option<DestroyCommand>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A destroy command with every expression already substituted
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DestroyCommand {
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

impl State {
    /// Decode a state document from a byte stream.
    pub fn decode<R: Read>(reader: R) -> StateResult<Self> {
        serde_json::from_reader(reader).map_err(StateError::Decode)
    }

    /// Encode this state document onto a byte stream.
    pub fn encode<W: Write>(&self, mut writer: W) -> StateResult<()> {
        serde_json::to_writer_pretty(&mut writer, self).map_err(StateError::Encode)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Look up a prior resource state by name, for reuse checks.
    pub fn resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> State {
        let mut state = State {
            module_path: "/modules/web".into(),
            ..Default::default()
        };
        state
            .inputs
            .insert("image".into(), json!("nginx:1.25"));
        state.resources.insert(
            "app".into(),
            ResourceState {
                resource_type: ResourceType::Container,
                id: "abc123".into(),
                properties: json!({"image": "nginx:1.25"}),
                outputs: json!({"container_id": "abc123", "ports": [{"container": 80, "host": 54321}]}),
                destroy_cmd: Some(DestroyCommand {
                    command: vec!["rm".into(), "-rf".into(), "/data".into()],
                    image: Some("alpine:3".into()),
                    ..Default::default()
                }),
                extra: Map::new(),
            },
        );
        state.outputs.insert("url".into(), json!("http://localhost:54321"));
        state
    }

    #[test]
    fn test_round_trip() {
        let state = sample_state();
        let mut buf = Vec::new();
        state.encode(&mut buf).unwrap();
        let decoded = State::decode(buf.as_slice()).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let raw = json!({
            "module_path": "/modules/web",
            "inputs": {},
            "resources": {
                "app": {
                    "type": "container",
                    "id": "abc",
                    "properties": {},
                    "outputs": {},
                    "replica_group": "future-field"
                }
            },
            "outputs": {},
            "engine_version": "99.0"
        });

        let decoded = State::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(decoded.extra["engine_version"], json!("99.0"));
        assert_eq!(
            decoded.resources["app"].extra["replica_group"],
            json!("future-field")
        );

        let mut buf = Vec::new();
        decoded.encode(&mut buf).unwrap();
        let reparsed: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(reparsed["engine_version"], json!("99.0"));
        assert_eq!(reparsed["resources"]["app"]["replica_group"], json!("future-field"));
    }

    #[test]
    fn test_destroy_cmd_omitted_when_absent() {
        let state = State {
            resources: IndexMap::from([(
                "net".to_string(),
                ResourceState {
                    resource_type: ResourceType::Network,
                    id: "net-1".into(),
                    properties: Value::Null,
                    outputs: Value::Null,
                    destroy_cmd: None,
                    extra: Map::new(),
                },
            )]),
            ..Default::default()
        };

        let raw = serde_json::to_string(&state).unwrap();
        assert!(!raw.contains("destroy_cmd"));
    }
}
