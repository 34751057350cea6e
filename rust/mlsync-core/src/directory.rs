// rust/mlsync-core/src/directory.rs

//! Cluster membership boundary.
//!
//! The directory answers "who is in the cluster right now". Every call
//! returns a point-in-time snapshot; membership may change between calls.

use std::collections::BTreeMap;

use arc_swap::ArcSwap;

use crate::config::NodeConfig;
use crate::protocol::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub node_id: NodeId,
    pub address: String,
    pub worker: bool,
    pub coordinator: bool,
}

/// Source of the current node list.
pub trait NodeDirectory: Send + Sync {
    /// Identifier of the node this process runs as.
    fn local_node(&self) -> NodeId;

    /// Every member, sorted by id.
    fn list_all_nodes(&self) -> Vec<NodeId>;

    /// Members that may load models, sorted by id.
    fn list_eligible_nodes(&self) -> Vec<NodeId>;

    /// Members that may run the reconciliation loop, sorted by id.
    fn list_coordinator_nodes(&self) -> Vec<NodeId>;

    /// Network address of a member, if known.
    fn address_of(&self, node_id: &str) -> Option<String>;

    /// The one member that runs the reconciliation loop: the lowest-id
    /// coordinator-eligible member, or the lowest-id member when none is
    /// eligible. Every node with the same membership elects the same one.
    fn elected_coordinator(&self) -> Option<NodeId> {
        self.list_coordinator_nodes()
            .into_iter()
            .next()
            .or_else(|| self.list_all_nodes().into_iter().next())
    }

    fn is_elected_coordinator(&self) -> bool {
        self.elected_coordinator().as_deref() == Some(self.local_node().as_str())
    }
}

/// Directory backed by configuration, with runtime join/leave for tests and
/// operators.
#[derive(Debug)]
pub struct StaticDirectory {
    local: NodeId,
    members: ArcSwap<BTreeMap<NodeId, Member>>,
}

impl StaticDirectory {
    pub fn new(local: impl Into<NodeId>, members: impl IntoIterator<Item = Member>) -> Self {
        let members = members
            .into_iter()
            .map(|m| (m.node_id.clone(), m))
            .collect::<BTreeMap<_, _>>();
        Self {
            local: local.into(),
            members: ArcSwap::from_pointee(members),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let local = Member {
            node_id: config.node_id.clone(),
            address: config.listen_address.clone(),
            worker: config.worker,
            coordinator: config.coordinator,
        };
        let peers = config.peers.iter().map(|p| Member {
            node_id: p.node_id.clone(),
            address: p.address.clone(),
            worker: p.worker,
            coordinator: p.coordinator,
        });
        Self::new(config.node_id.clone(), std::iter::once(local).chain(peers))
    }

    /// Worker-only members with placeholder addresses.
    pub fn workers(local: impl Into<NodeId>, ids: &[&str]) -> Self {
        Self::new(
            local,
            ids.iter().map(|id| Member {
                node_id: id.to_string(),
                address: format!("local://{}", id),
                worker: true,
                coordinator: false,
            }),
        )
    }

    pub fn join(&self, member: Member) {
        tracing::info!(node_id = %member.node_id, "Node joined directory");
        self.members.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(member.node_id.clone(), member.clone());
            next
        });
    }

    pub fn leave(&self, node_id: &str) {
        tracing::info!(node_id, "Node left directory");
        self.members.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.remove(node_id);
            next
        });
    }

    fn filtered(&self, keep: impl Fn(&Member) -> bool) -> Vec<NodeId> {
        self.members
            .load()
            .values()
            .filter(|m| keep(m))
            .map(|m| m.node_id.clone())
            .collect()
    }
}

impl NodeDirectory for StaticDirectory {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn list_all_nodes(&self) -> Vec<NodeId> {
        self.filtered(|_| true)
    }

    fn list_eligible_nodes(&self) -> Vec<NodeId> {
        self.filtered(|m| m.worker)
    }

    fn list_coordinator_nodes(&self) -> Vec<NodeId> {
        self.filtered(|m| m.coordinator)
    }

    fn address_of(&self, node_id: &str) -> Option<String> {
        self.members.load().get(node_id).map(|m| m.address.clone())
    }
}
