// rust/mlsync-core/src/reconcile.rs

//! Pure reconciliation of node snapshots into cluster tables.

use crate::protocol::{BroadcastRequest, ModelLoadStatus, NodeSnapshot, RoutingTable, RunningTaskIndex};

/// Routing table and running task index rebuilt from one round of snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub routing_table: RoutingTable,
    pub running_tasks: RunningTaskIndex,
}

impl Reconciled {
    /// No model is loaded anywhere; the cycle broadcasts `clear_all`.
    pub fn is_clear(&self) -> bool {
        self.routing_table.is_empty()
    }

    pub fn to_broadcast(&self) -> BroadcastRequest {
        if self.is_clear() {
            BroadcastRequest::clear(self.running_tasks.clone())
        } else {
            BroadcastRequest {
                clear_all: false,
                routing_table: self.routing_table.clone(),
                running_tasks: self.running_tasks.clone(),
            }
        }
    }
}

/// Build both tables from scratch.
///
/// A model is routed to a node only if that node reported it `Loaded`.
/// Nodes without a snapshot contribute nothing.
pub fn reconcile<'a>(snapshots: impl IntoIterator<Item = &'a NodeSnapshot>) -> Reconciled {
    let mut reconciled = Reconciled::default();
    for snapshot in snapshots {
        for (model_id, status) in &snapshot.model_statuses {
            if *status == ModelLoadStatus::Loaded {
                reconciled
                    .routing_table
                    .entry(model_id.clone())
                    .or_default()
                    .insert(snapshot.node_id.clone());
            }
        }
        for task_id in &snapshot.running_task_ids {
            reconciled
                .running_tasks
                .entry(task_id.clone())
                .or_default()
                .insert(snapshot.node_id.clone());
        }
    }
    reconciled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(node: &str, models: &[(&str, ModelLoadStatus)], tasks: &[&str]) -> NodeSnapshot {
        NodeSnapshot {
            node_id: node.to_string(),
            model_statuses: models
                .iter()
                .map(|(m, s)| (m.to_string(), *s))
                .collect(),
            running_task_ids: tasks.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_only_loaded_models_are_routed() {
        let snapshots = vec![
            snapshot(
                "a",
                &[
                    ("m1", ModelLoadStatus::Loaded),
                    ("m2", ModelLoadStatus::Loading),
                ],
                &["t2"],
            ),
            snapshot(
                "b",
                &[
                    ("m1", ModelLoadStatus::Loaded),
                    ("m3", ModelLoadStatus::Unloading),
                    ("m4", ModelLoadStatus::Failed),
                ],
                &[],
            ),
        ];

        let reconciled = reconcile(&snapshots);

        assert_eq!(reconciled.routing_table.len(), 1);
        assert_eq!(
            reconciled.routing_table["m1"].iter().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(
            reconciled.running_tasks["t2"].iter().collect::<Vec<_>>(),
            vec!["a"]
        );
        assert!(!reconciled.is_clear());
        assert!(!reconciled.to_broadcast().clear_all);
    }

    #[test]
    fn test_empty_routing_is_clear() {
        let snapshots = vec![snapshot("a", &[("m1", ModelLoadStatus::Loading)], &["t1"])];
        let reconciled = reconcile(&snapshots);

        assert!(reconciled.is_clear());
        let broadcast = reconciled.to_broadcast();
        assert!(broadcast.clear_all);
        assert_eq!(broadcast.running_tasks.len(), 1);

        assert!(reconcile(std::iter::empty()).is_clear());
    }

    #[test]
    fn test_result_independent_of_order() {
        let a = snapshot("a", &[("m1", ModelLoadStatus::Loaded)], &["t1"]);
        let b = snapshot("b", &[("m1", ModelLoadStatus::Loaded)], &["t1"]);
        let c = snapshot("c", &[("m2", ModelLoadStatus::Loaded)], &[]);

        let forward = reconcile([&a, &b, &c]);
        let backward = reconcile([&c, &b, &a]);
        assert_eq!(forward, backward);
    }
}
