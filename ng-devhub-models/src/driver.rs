use crate::{
    attributes::{AttributeMap, CORE_ATTRIBUTES},
    device::{DriverId, Version},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Capability a driver implements: its namespace and the attribute keys it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    pub namespace: String,
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl CapabilityDefinition {
    pub fn new(namespace: impl Into<String>, attributes: &[&str]) -> Self {
        Self {
            namespace: namespace.into(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Where reflexes of a driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReflexRunMode {
    #[default]
    Platform,
    Hub,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReflexDefinition {
    #[serde(default)]
    pub mode: ReflexRunMode,
    #[serde(default)]
    pub reflexes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dfa: Option<Value>,
}

impl ReflexDefinition {
    /// A driver is hub-local when it ships anything the hub can execute on its own.
    #[inline]
    pub fn is_hub_local(&self) -> bool {
        !self.reflexes.is_empty() || self.dfa.is_some()
    }
}

/// Static description of a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverDefinition {
    pub name: String,
    pub version: Version,
    pub hash: String,
    pub capabilities: Vec<CapabilityDefinition>,
    pub base_attributes: AttributeMap,
    pub reflexes: ReflexDefinition,
}

impl DriverDefinition {
    /// Builds a definition, deriving the content hash when none is supplied.
    pub fn new(
        name: impl Into<String>,
        version: Version,
        hash: Option<String>,
        capabilities: Vec<CapabilityDefinition>,
        base_attributes: AttributeMap,
        reflexes: ReflexDefinition,
    ) -> Self {
        let mut definition = Self {
            name: name.into(),
            version,
            hash: String::new(),
            capabilities,
            base_attributes,
            reflexes,
        };
        definition.hash = hash
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| definition.content_hash());
        definition
    }

    #[inline]
    pub fn driver_id(&self) -> DriverId {
        DriverId::new(self.name.clone(), self.version)
    }

    /// Capability namespaces this driver declares.
    pub fn capability_namespaces(&self) -> BTreeSet<String> {
        self.capabilities
            .iter()
            .map(|c| c.namespace.clone())
            .collect()
    }

    /// Attribute keys a context running this driver will accept.
    pub fn supported_attributes(&self) -> BTreeSet<String> {
        self.capabilities
            .iter()
            .flat_map(|c| c.attributes.iter().cloned())
            .chain(CORE_ATTRIBUTES.iter().map(|a| a.to_string()))
            .chain(self.base_attributes.keys().cloned())
            .collect()
    }

    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.version.to_string().as_bytes());
        for cap in &self.capabilities {
            hasher.update(cap.namespace.as_bytes());
            for attr in &cap.attributes {
                hasher.update(attr.as_bytes());
            }
        }
        for (key, value) in &self.base_attributes {
            hasher.update(key.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }
        if let Ok(reflexes) = serde_json::to_vec(&self.reflexes) {
            hasher.update(&reflexes);
        }
        hex::encode(hasher.finalize())
    }
}
