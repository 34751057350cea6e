// rust/mlsync-core/src/lifecycle.rs

//! Cluster-wide model load and unload.
//!
//! A lifecycle action addresses a set of target nodes, runs the node-level
//! load or unload on each of them and folds the per-node answers into one
//! response. The local node is served in-process; every other target goes
//! through the transport. Unreachable targets are listed separately from
//! per-model outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::TransportFailure;
use crate::handler::NodeHandler;
use crate::protocol::{
    LoadRequest, LoadResponse, ModelId, NodeId, NodeRequest, UnloadRequest, UnloadStatus,
};
use crate::transport::{FanOut, Transport};

/// Cluster-level verdict for one model after an unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterUnloadStatus {
    /// Every node that answered reported the model gone.
    Unloaded,
    /// At least one answering node still holds or is releasing the model.
    NotFullyUnloaded,
    /// No node answered for this model.
    Unknown,
}

impl fmt::Display for ClusterUnloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unloaded => "unloaded",
            Self::NotFullyUnloaded => "not_fully_unloaded",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterLoadResponse {
    pub per_node: BTreeMap<NodeId, LoadResponse>,
    pub failures: Vec<TransportFailure>,
}

impl ClusterLoadResponse {
    pub fn accepted_nodes(&self) -> Vec<NodeId> {
        self.per_node
            .iter()
            .filter(|(_, r)| r.is_accepted())
            .map(|(n, _)| n.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterUnloadResponse {
    pub per_node: BTreeMap<NodeId, BTreeMap<ModelId, UnloadStatus>>,
    pub failures: Vec<TransportFailure>,
    pub aggregate: BTreeMap<ModelId, ClusterUnloadStatus>,
}

/// Fold per-node unload reports into one verdict per requested model.
///
/// The result only depends on the set of reports, not on the order in which
/// they arrived.
pub fn aggregate_unload<'a>(
    model_ids: &[ModelId],
    reports: impl IntoIterator<Item = &'a BTreeMap<ModelId, UnloadStatus>>,
) -> BTreeMap<ModelId, ClusterUnloadStatus> {
    let mut aggregate: BTreeMap<ModelId, ClusterUnloadStatus> = model_ids
        .iter()
        .map(|m| (m.clone(), ClusterUnloadStatus::Unknown))
        .collect();

    for report in reports {
        for (model_id, status) in report {
            let Some(verdict) = aggregate.get_mut(model_id) else {
                continue;
            };
            *verdict = match (*verdict, status.is_released()) {
                (ClusterUnloadStatus::NotFullyUnloaded, _) | (_, false) => {
                    ClusterUnloadStatus::NotFullyUnloaded
                }
                _ => ClusterUnloadStatus::Unloaded,
            };
        }
    }
    aggregate
}

pub struct ModelLifecycleAction {
    local: Arc<NodeHandler>,
    transport: Arc<dyn Transport>,
    fan_out_timeout: Duration,
}

impl ModelLifecycleAction {
    pub fn new(
        local: Arc<NodeHandler>,
        transport: Arc<dyn Transport>,
        fan_out_timeout: Duration,
    ) -> Self {
        Self {
            local,
            transport,
            fan_out_timeout,
        }
    }

    fn split_targets(&self, targets: &[NodeId]) -> (bool, Vec<NodeId>) {
        let local_id = self.local.node_id();
        let mut remote: Vec<NodeId> = targets
            .iter()
            .filter(|n| n.as_str() != local_id)
            .cloned()
            .collect();
        remote.sort();
        remote.dedup();
        (targets.iter().any(|n| n == local_id), remote)
    }

    /// Start loading `model_id` on every target.
    ///
    /// Returns as soon as each target has accepted or refused the load.
    pub async fn load(
        &self,
        model_id: &str,
        model_source_ref: &str,
        task_id: &str,
        targets: &[NodeId],
    ) -> ClusterLoadResponse {
        let request = LoadRequest {
            model_id: model_id.to_string(),
            model_source_ref: model_source_ref.to_string(),
            task_id: task_id.to_string(),
        };
        let (includes_local, remote) = self.split_targets(targets);

        let mut response = ClusterLoadResponse::default();
        if includes_local {
            let local = self.local.handle_load(request.clone()).await;
            response.per_node.insert(local.node_id.clone(), local);
        }

        let fan_out: FanOut<LoadResponse> = self
            .transport
            .fan_out(&remote, NodeRequest::Load(request), self.fan_out_timeout)
            .await
            .try_map(|node, r| r.into_load(node));
        response.per_node.extend(fan_out.responses);
        response.failures = fan_out.failures;

        tracing::info!(
            model_id,
            task_id,
            accepted = response.accepted_nodes().len(),
            failed_nodes = response.failures.len(),
            "Cluster load dispatched"
        );
        response
    }

    /// Unload `model_ids` from every target and aggregate the outcome.
    pub async fn unload(&self, model_ids: &[ModelId], targets: &[NodeId]) -> ClusterUnloadResponse {
        let request = UnloadRequest {
            model_ids: model_ids.to_vec(),
        };
        let (includes_local, remote) = self.split_targets(targets);

        let mut response = ClusterUnloadResponse::default();
        if includes_local {
            let local = self.local.handle_unload(request.clone()).await;
            response.per_node.insert(local.node_id, local.per_model_status);
        }

        let fan_out = self
            .transport
            .fan_out(&remote, NodeRequest::Unload(request), self.fan_out_timeout)
            .await
            .try_map(|node, r| r.into_unload(node));
        for (node, r) in fan_out.responses {
            response.per_node.insert(node, r.per_model_status);
        }
        response.failures = fan_out.failures;
        response.aggregate = aggregate_unload(model_ids, response.per_node.values());

        for failure in &response.failures {
            tracing::warn!(
                node_id = %failure.node_id,
                reason = %failure.reason,
                "Unload did not reach node"
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{test_handler, wait_for_status};
    use crate::handler::RequestHandler;
    use crate::protocol::ModelLoadStatus;
    use crate::transport::LocalTransport;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn report(entries: &[(&str, UnloadStatus)]) -> BTreeMap<ModelId, UnloadStatus> {
        entries.iter().map(|(m, s)| (m.to_string(), *s)).collect()
    }

    #[test]
    fn test_aggregate_unload() {
        let models = ids(&["m1", "m2", "m3"]);
        let a = report(&[("m1", UnloadStatus::Unloaded), ("m2", UnloadStatus::NotFound)]);
        let b = report(&[("m1", UnloadStatus::NotFound), ("m2", UnloadStatus::Unloading)]);

        let aggregate = aggregate_unload(&models, [&a, &b]);
        assert_eq!(aggregate["m1"], ClusterUnloadStatus::Unloaded);
        assert_eq!(aggregate["m2"], ClusterUnloadStatus::NotFullyUnloaded);
        assert_eq!(aggregate["m3"], ClusterUnloadStatus::Unknown);
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let models = ids(&["m1", "m2"]);
        let reports = vec![
            report(&[("m1", UnloadStatus::Unloaded), ("m2", UnloadStatus::Failed)]),
            report(&[("m1", UnloadStatus::NotFound), ("m2", UnloadStatus::Unloaded)]),
            report(&[("m1", UnloadStatus::Unloaded), ("m2", UnloadStatus::NotFound)]),
        ];

        let expected = aggregate_unload(&models, reports.iter());
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let permuted = order.iter().map(|i| &reports[*i]);
            assert_eq!(aggregate_unload(&models, permuted), expected);
        }
        assert_eq!(expected["m2"], ClusterUnloadStatus::NotFullyUnloaded);
    }

    struct Setup {
        action: ModelLifecycleAction,
        a: Arc<NodeHandler>,
        b: Arc<NodeHandler>,
        transport: Arc<LocalTransport>,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn setup() -> Setup {
        let (a, _, dir_a) = test_handler("a");
        let (b, _, dir_b) = test_handler("b");
        let transport = Arc::new(LocalTransport::new());
        transport.register("b", b.clone() as Arc<dyn RequestHandler>);
        let action = ModelLifecycleAction::new(a.clone(), transport.clone(), Duration::from_secs(1));
        Setup {
            action,
            a,
            b,
            transport,
            _dirs: vec![dir_a, dir_b],
        }
    }

    #[tokio::test]
    async fn test_load_on_local_and_remote() {
        let setup = setup();
        let response = setup
            .action
            .load("m1", "m1.bin", "t1", &ids(&["a", "b", "c"]))
            .await;

        assert_eq!(response.accepted_nodes(), ids(&["a", "b"]));
        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].node_id, "c");

        wait_for_status(&setup.a, "m1", Some(ModelLoadStatus::Loaded)).await;
        wait_for_status(&setup.b, "m1", Some(ModelLoadStatus::Loaded)).await;
    }

    #[tokio::test]
    async fn test_unload_partial_presence() {
        let setup = setup();
        setup
            .action
            .load("m1", "m1.bin", "t1", &ids(&["a"]))
            .await;
        wait_for_status(&setup.a, "m1", Some(ModelLoadStatus::Loaded)).await;

        let response = setup
            .action
            .unload(&ids(&["m1", "m2"]), &ids(&["a"]))
            .await;

        let a = &response.per_node["a"];
        assert_eq!(a["m1"], UnloadStatus::Unloaded);
        assert_eq!(a["m2"], UnloadStatus::NotFound);
        assert!(response.failures.is_empty());
        assert_eq!(response.aggregate["m1"], ClusterUnloadStatus::Unloaded);
        assert_eq!(response.aggregate["m2"], ClusterUnloadStatus::Unloaded);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_not_a_model_status() {
        let setup = setup();
        setup
            .action
            .load("m1", "m1.bin", "t1", &ids(&["b"]))
            .await;
        wait_for_status(&setup.b, "m1", Some(ModelLoadStatus::Loaded)).await;
        setup.transport.set_unreachable("b", true);

        let response = setup.action.unload(&ids(&["m1"]), &ids(&["a", "b"])).await;

        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].node_id, "b");
        assert!(!response.per_node.contains_key("b"));
        assert_eq!(response.per_node["a"]["m1"], UnloadStatus::NotFound);
        assert_eq!(response.aggregate["m1"], ClusterUnloadStatus::Unloaded);
        assert_eq!(
            setup.b.registry().status_of("m1").await,
            Some(ModelLoadStatus::Loaded)
        );
    }
}
