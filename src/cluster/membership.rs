//! Static cluster membership

use std::collections::BTreeMap;

use crate::cluster::role::NodeId;
use crate::common::Config;

/// Known nodes and their base URLs, this node included
#[derive(Debug, Clone)]
pub struct Membership {
    self_id: NodeId,
    nodes: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn new(self_id: impl Into<NodeId>) -> Self {
        Self {
            self_id: self_id.into(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut membership = Self::new(config.node_id.clone());
        for peer in &config.peers {
            membership = membership.with_node(peer.id.clone(), peer.url.clone());
        }
        membership
    }

    pub fn with_node(mut self, id: impl Into<NodeId>, url: impl Into<String>) -> Self {
        self.nodes
            .insert(id.into(), url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn url_of(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        id == self.self_id || self.nodes.contains_key(id)
    }

    /// Every node id, this node included, sorted
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        if !self.nodes.contains_key(&self.self_id) {
            ids.push(self.self_id.clone());
            ids.sort();
        }
        ids
    }

    /// Nodes other than this one
    pub fn others(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| **id != self.self_id)
            .cloned()
            .collect()
    }
}
