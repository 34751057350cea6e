// rust/mlsync-core/src/transport/mod.rs

//! Point-to-point request/response transport between nodes.
//!
//! A [`Transport`] delivers one [`NodeRequest`] to one node. Fan-out sends
//! the same request to many nodes concurrently and resumes once every branch
//! has answered, failed, or exceeded its timeout. A failing branch never
//! aborts its siblings.
//!
//! # Implementations
//!
//! - [`LocalTransport`]: in-process delivery to registered handlers.
//! - [`GrpcTransport`]: tonic client per peer (requires the `grpc` feature).

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::{Result, TransportFailure};
use crate::protocol::{NodeId, NodeRequest, NodeResponse};

mod local;
pub use local::LocalTransport;

#[cfg(feature = "grpc")]
mod grpc;
#[cfg(feature = "grpc")]
pub use grpc::GrpcTransport;

/// Aggregated result of a fan-out: successful responses and per-node
/// failures, each sorted by node id.
#[derive(Debug, Clone)]
pub struct FanOut<T> {
    pub responses: Vec<(NodeId, T)>,
    pub failures: Vec<TransportFailure>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> FanOut<T> {
    /// Convert every response, turning conversion errors into failures for
    /// that node.
    pub fn try_map<U>(self, mut f: impl FnMut(&str, T) -> Result<U>) -> FanOut<U> {
        let mut out = FanOut {
            responses: Vec::with_capacity(self.responses.len()),
            failures: self.failures,
        };
        for (node_id, response) in self.responses {
            match f(&node_id, response) {
                Ok(value) => out.responses.push((node_id, value)),
                Err(e) => out
                    .failures
                    .push(TransportFailure::new(node_id, e.to_string())),
            }
        }
        out.failures.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.failures.iter().map(|f| f.node_id.clone()).collect()
    }

    pub fn responded_nodes(&self) -> Vec<NodeId> {
        self.responses.iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `request` to `node_id` and wait for its response.
    async fn send(
        &self,
        node_id: &str,
        request: NodeRequest,
    ) -> std::result::Result<NodeResponse, TransportFailure>;

    /// Send `request` to every node in `nodes` concurrently.
    ///
    /// Each branch is bounded by `timeout`; a branch that exceeds it becomes
    /// a timed-out failure for that node only.
    async fn fan_out(
        &self,
        nodes: &[NodeId],
        request: NodeRequest,
        timeout: Duration,
    ) -> FanOut<NodeResponse> {
        let kind = request.kind();
        let branches = nodes.iter().map(|node_id| {
            let request = request.clone();
            async move {
                let result = match tokio::time::timeout(timeout, self.send(node_id, request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportFailure::timeout(
                        node_id.clone(),
                        timeout.as_millis() as u64,
                    )),
                };
                (node_id.clone(), result)
            }
        });

        let mut fan_out = FanOut::default();
        for (node_id, result) in join_all(branches).await {
            match result {
                Ok(response) => fan_out.responses.push((node_id, response)),
                Err(failure) => {
                    tracing::debug!(
                        node_id = %failure.node_id,
                        kind,
                        reason = %failure.reason,
                        "Fan-out branch failed"
                    );
                    fan_out.failures.push(failure)
                }
            }
        }
        fan_out.responses.sort_by(|a, b| a.0.cmp(&b.0));
        fan_out.failures.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        fan_out
    }
}
