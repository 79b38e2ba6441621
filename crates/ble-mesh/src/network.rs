//! Read-only view of the mesh network configuration

use crate::address::Address;
use crate::error::MeshResult;
use crate::keys::KeyIndex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A model on an element, with its application key bindings and subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 16-bit SIG model ID, or company ID << 16 | model ID for vendor models
    pub model_id: u32,
    #[serde(default)]
    pub bound_application_keys: Vec<KeyIndex>,
    #[serde(default)]
    pub subscriptions: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementConfig {
    pub address: Address,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl ElementConfig {
    pub fn model(&self, model_id: u32) -> Option<&ModelConfig> {
        self.models.iter().find(|model| model.model_id == model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Address of the first element, also the device key address
    pub primary_address: Address,
    pub elements: Vec<ElementConfig>,
    #[serde(default)]
    pub network_keys: Vec<KeyIndex>,
}

impl NodeConfig {
    pub fn element(&self, address: Address) -> Option<&ElementConfig> {
        self.elements.iter().find(|element| element.address == address)
    }

    pub fn owns(&self, address: Address) -> bool {
        self.element(address).is_some()
    }
}

/// Read-only network configuration consumed by the engine
pub trait NetworkConfigProvider: Send + Sync {
    /// The node this engine runs for
    fn local_node(&self) -> Option<&NodeConfig>;

    /// Node owning the unicast `address`
    fn node(&self, address: Address) -> Option<&NodeConfig>;

    /// True if a model of the local node subscribes to `address`
    fn is_subscribed(&self, address: Address) -> bool;

    /// Label UUIDs of the virtual addresses known to the network
    fn virtual_labels(&self) -> Vec<Uuid>;
}

/// Network configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNetwork {
    pub local_node: Address,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub virtual_labels: Vec<Uuid>,
}

impl StaticNetwork {
    pub fn from_json(json: &str) -> MeshResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl NetworkConfigProvider for StaticNetwork {
    fn local_node(&self) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.primary_address == self.local_node)
    }

    fn node(&self, address: Address) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.owns(address))
    }

    fn is_subscribed(&self, address: Address) -> bool {
        self.local_node().is_some_and(|node| {
            node.elements
                .iter()
                .flat_map(|element| element.models.iter())
                .any(|model| model.subscriptions.contains(&address))
        })
    }

    fn virtual_labels(&self) -> Vec<Uuid> {
        self.virtual_labels.clone()
    }
}
