//! Module document structures

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A parsed module: the declarative input to one apply.
///
/// Resource declaration order is the apply order, so `resources` is an
/// ordered map and must never be rebuilt through an unordered collection.
#[derive(Debug, Clone, Deserialize)]
pub struct Module {
    /// Engine tag; when present it must name this engine.
    #[serde(default)]
    pub plugin: Option<String>,

    /// Informational module type (e.g. "database", "service").
    #[serde(default, rename = "type")]
    pub module_type: Option<String>,

    /// Typed inputs the caller supplies at apply time.
    #[serde(default)]
    pub inputs: IndexMap<String, InputDefinition>,

    /// Named resources, in declaration order.
    #[serde(default)]
    pub resources: IndexMap<String, ResourceDefinition>,

    /// Named outputs evaluated after the last resource applies.
    #[serde(default)]
    pub outputs: IndexMap<String, OutputDefinition>,
}

/// Declaration of a single module input
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputDefinition {
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,

    #[serde(default)]
    pub required: bool,

    /// Value used when the caller does not supply one.
    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub sensitive: bool,

    #[serde(default)]
    pub description: Option<String>,
}

/// Declaration of a single resource
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceDefinition {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    /// Optional gate expression; a falsy result skips the resource.
    #[serde(default)]
    pub when: Option<String>,

    /// Property tree whose string leaves may be `${...}` expressions.
    #[serde(default)]
    pub properties: Value,

    /// Informational only; apply order is declaration order.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Teardown command, resolved at apply time and persisted in state.
    #[serde(default)]
    pub destroy: Option<DestroySpec>,
}

/// Declaration of a module output
#[derive(Debug, Clone, Deserialize)]
pub struct OutputDefinition {
    pub value: Value,

    #[serde(default)]
    pub sensitive: bool,

    #[serde(default)]
    pub description: Option<String>,
}

/// Unresolved destroy command as declared on the module.
///
/// Every leaf may still be an expression; the resolved form lives in
/// [`crate::state::DestroyCommand`].
#[derive(Debug, Clone, Deserialize)]
pub struct DestroySpec {
    pub command: Vec<Value>,

    /// Run the command in a one-shot container instead of on the host.
    #[serde(default)]
    pub image: Option<Value>,

    #[serde(default)]
    pub network: Option<Value>,

    #[serde(default)]
    pub working_dir: Option<Value>,

    #[serde(default)]
    pub environment: Option<IndexMap<String, Value>>,
}

/// The enumerated resource types this engine realizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Container,
    Network,
    Volume,
    Build,
    Process,
    Exec,
    CryptoRsa,
    CryptoEcdsa,
    CryptoSymmetric,
}

impl ResourceType {
    /// Canonical string form, used in state documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Container => "container",
            ResourceType::Network => "network",
            ResourceType::Volume => "volume",
            ResourceType::Build => "build",
            ResourceType::Process => "process",
            ResourceType::Exec => "exec",
            ResourceType::CryptoRsa => "crypto/rsa",
            ResourceType::CryptoEcdsa => "crypto/ecdsa",
            ResourceType::CryptoSymmetric => "crypto/symmetric",
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept both the bare form and the docker:/crypto: prefixed spellings.
        let ty = match s {
            "container" | "docker:container" => ResourceType::Container,
            "network" | "docker:network" => ResourceType::Network,
            "volume" | "docker:volume" => ResourceType::Volume,
            "build" | "docker:build" => ResourceType::Build,
            "process" => ResourceType::Process,
            "exec" => ResourceType::Exec,
            "crypto/rsa" | "crypto:rsa_key" => ResourceType::CryptoRsa,
            "crypto/ecdsa" | "crypto:ecdsa_key" => ResourceType::CryptoEcdsa,
            "crypto/symmetric" | "crypto:symmetric_key" => ResourceType::CryptoSymmetric,
            other => return Err(other.to_string()),
        };
        Ok(ty)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResourceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|other| D::Error::custom(format!("unknown resource type: {}", other)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_aliases() {
        assert_eq!(
            "docker:container".parse::<ResourceType>().unwrap(),
            ResourceType::Container
        );
        assert_eq!(
            "crypto:rsa_key".parse::<ResourceType>().unwrap(),
            ResourceType::CryptoRsa
        );
        assert_eq!(
            "crypto/symmetric".parse::<ResourceType>().unwrap(),
            ResourceType::CryptoSymmetric
        );
        assert!("widget".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_resource_type_canonical_form() {
        assert_eq!(ResourceType::CryptoEcdsa.as_str(), "crypto/ecdsa");
        assert_eq!(ResourceType::Container.as_str(), "container");
    }
}
