use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{NodeAddr, ProfileKey};

use super::CoordinationError;

/// Names the node that holds a profile in memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidencyRecord {
    pub ip: String,
    pub port: u16,
}

impl ResidencyRecord {
    pub fn owner(&self) -> NodeAddr {
        NodeAddr::new(self.ip.clone(), self.port)
    }

    pub fn is_owned_by(&self, node: &NodeAddr) -> bool {
        self.ip == node.ip && self.port == node.port
    }
}

impl From<&NodeAddr> for ResidencyRecord {
    fn from(node: &NodeAddr) -> Self {
        Self {
            ip: node.ip.clone(),
            port: node.port,
        }
    }
}

/// The number of profiles a node has loaded or is loading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLoadRecord {
    pub profiles_loaded: i64,
}

pub(crate) fn encode_record<T: Serialize>(record: &T) -> Vec<u8> {
    // serializing plain structs of strings and integers cannot fail
    serde_json::to_vec(record).unwrap_or_default()
}

pub(crate) fn decode_record<T: DeserializeOwned>(
    path: &str,
    data: &[u8],
) -> Result<T, CoordinationError> {
    serde_json::from_slice(data).map_err(|e| CoordinationError::MalformedRecord {
        path: path.to_owned(),
        details: e.to_string(),
    })
}

/// Builds the paths of all records owned by the residency protocol.
#[derive(Clone, Debug)]
pub struct CoordinationPaths {
    root: String,
}

impl CoordinationPaths {
    /// Roots all paths at `/{namespace}`, or at `/` for an empty namespace.
    pub fn new(namespace: &str) -> Self {
        let namespace = namespace.trim_matches('/');
        let root = if namespace.is_empty() {
            String::new()
        } else {
            format!("/{namespace}")
        };
        Self { root }
    }

    pub fn nodes_root(&self) -> String {
        format!("{}/nodesInfo", self.root)
    }

    pub fn node(&self, node: &NodeAddr) -> String {
        format!("{}/nodesInfo/{node}", self.root)
    }

    pub fn profiles_root(&self) -> String {
        format!("{}/profilesLoadStatus", self.root)
    }

    pub fn profile(&self, key: &ProfileKey) -> String {
        format!(
            "{}/profilesLoadStatus/{}",
            self.root,
            key.coordination_segment()
        )
    }

    pub fn mutex(&self) -> String {
        format!("{}/global_mutex", self.root)
    }
}
