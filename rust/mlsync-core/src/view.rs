// rust/mlsync-core/src/view.rs

//! A node's cached copy of the cluster routing state.
//!
//! The view holds whatever the last broadcast delivered. It is replaced
//! wholesale on every apply, so readers always see one complete table pair
//! and never a half-applied update.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

use crate::protocol::{BroadcastRequest, NodeId, RoutingTable, RunningTaskIndex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSnapshot {
    /// Number of broadcasts applied so far.
    pub version: u64,
    pub routing_table: RoutingTable,
    pub running_tasks: RunningTaskIndex,
    pub applied_at: Option<DateTime<Utc>>,
}

impl RoutingSnapshot {
    fn initial() -> Self {
        Self {
            version: 0,
            routing_table: RoutingTable::new(),
            running_tasks: RunningTaskIndex::new(),
            applied_at: None,
        }
    }

    /// Running load tasks per node.
    pub fn running_count_per_node(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for nodes in self.running_tasks.values() {
            for node in nodes {
                *counts.entry(node.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[derive(Debug)]
pub struct ClusterView {
    current: ArcSwap<RoutingSnapshot>,
}

impl Default for ClusterView {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterView {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RoutingSnapshot::initial()),
        }
    }

    /// Replace the cached tables with a broadcast. Returns the new version.
    pub fn apply(&self, broadcast: &BroadcastRequest) -> u64 {
        let routing_table = if broadcast.clear_all {
            RoutingTable::new()
        } else {
            broadcast.routing_table.clone()
        };
        let now = Utc::now();

        let previous = self.current.rcu(|current| RoutingSnapshot {
            version: current.version + 1,
            routing_table: routing_table.clone(),
            running_tasks: broadcast.running_tasks.clone(),
            applied_at: Some(now),
        });
        previous.version + 1
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Nodes that served `model_id` as of the last broadcast.
    pub fn nodes_for(&self, model_id: &str) -> Vec<NodeId> {
        self.current
            .load()
            .routing_table
            .get(model_id)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn set(nodes: &[&str]) -> BTreeSet<NodeId> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_apply_replaces_tables() {
        let view = ClusterView::new();
        assert_eq!(view.version(), 0);
        assert!(view.snapshot().applied_at.is_none());

        let mut broadcast = BroadcastRequest::default();
        broadcast
            .routing_table
            .insert("m1".to_string(), set(&["a", "b"]));
        broadcast.running_tasks.insert("t1".to_string(), set(&["a"]));
        broadcast.running_tasks.insert("t2".to_string(), set(&["a"]));

        assert_eq!(view.apply(&broadcast), 1);
        assert_eq!(view.nodes_for("m1"), vec!["a", "b"]);
        assert!(view.nodes_for("m2").is_empty());
        assert_eq!(view.snapshot().running_count_per_node().get("a"), Some(&2));

        let mut next = BroadcastRequest::default();
        next.routing_table.insert("m2".to_string(), set(&["c"]));
        assert_eq!(view.apply(&next), 2);
        assert!(view.nodes_for("m1").is_empty());
        assert!(view.snapshot().running_count_per_node().is_empty());
    }

    #[test]
    fn test_clear_all_empties_routing() {
        let view = ClusterView::new();
        let mut broadcast = BroadcastRequest::default();
        broadcast.routing_table.insert("m1".to_string(), set(&["a"]));
        view.apply(&broadcast);

        let mut running = RunningTaskIndex::new();
        running.insert("t1".to_string(), set(&["b"]));
        view.apply(&BroadcastRequest::clear(running));

        let snapshot = view.snapshot();
        assert!(snapshot.routing_table.is_empty());
        assert_eq!(snapshot.running_tasks.len(), 1);
        assert_eq!(snapshot.version, 2);
    }
}
