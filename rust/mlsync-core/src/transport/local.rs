//! In-process transport.
//!
//! Requests are delivered straight to handlers registered under a node id.
//! Nodes can be marked unreachable or slowed down to exercise partial
//! failures without a network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::Transport;
use crate::error::TransportFailure;
use crate::handler::RequestHandler;
use crate::protocol::{NodeId, NodeRequest, NodeResponse};

#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<NodeId, Arc<dyn RequestHandler>>,
    unreachable: DashSet<NodeId>,
    delays: DashMap<NodeId, Duration>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<NodeId>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(node_id.into(), handler);
    }

    /// Make every request to `node_id` fail (or succeed again).
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(node_id.to_string());
        } else {
            self.unreachable.remove(node_id);
        }
    }

    /// Delay every response from `node_id`.
    pub fn set_delay(&self, node_id: &str, delay: Duration) {
        self.delays.insert(node_id.to_string(), delay);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        node_id: &str,
        request: NodeRequest,
    ) -> Result<NodeResponse, TransportFailure> {
        if self.unreachable.contains(node_id) {
            return Err(TransportFailure::new(node_id, "connection refused"));
        }

        let handler = self
            .handlers
            .get(node_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| TransportFailure::new(node_id, "no route to node"))?;

        let delay = self.delays.get(node_id).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        handler
            .handle(request)
            .await
            .map_err(|e| TransportFailure::new(node_id, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SyncError};
    use crate::protocol::{SyncRequest, SyncResponse};

    struct Echo(&'static str);

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: NodeRequest) -> Result<NodeResponse> {
            match request {
                NodeRequest::Sync(_) => Ok(NodeResponse::Sync(SyncResponse {
                    node_id: self.0.to_string(),
                    ..Default::default()
                })),
                other => Err(SyncError::unexpected_response(self.0, other.kind())),
            }
        }
    }

    fn transport(nodes: &[&'static str]) -> LocalTransport {
        let transport = LocalTransport::new();
        for node in nodes {
            transport.register(*node, Arc::new(Echo(*node)));
        }
        transport
    }

    fn sync() -> NodeRequest {
        NodeRequest::Sync(SyncRequest {
            want_loaded_models: true,
        })
    }

    #[tokio::test]
    async fn test_send_routes_to_handler() {
        let transport = transport(&["a", "b"]);
        let response = transport.send("b", sync()).await.unwrap();
        assert_eq!(response.into_sync("b").unwrap().node_id, "b");

        let failure = transport.send("c", sync()).await.unwrap_err();
        assert_eq!(failure.node_id, "c");
        assert!(!failure.timed_out);
    }

    #[tokio::test]
    async fn test_fan_out_collects_failures() {
        let transport = transport(&["a", "b", "c"]);
        transport.set_unreachable("b", true);

        let nodes = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        let result = transport
            .fan_out(&nodes, sync(), Duration::from_secs(1))
            .await;

        assert_eq!(result.responded_nodes(), vec!["a", "c"]);
        assert_eq!(result.failed_nodes(), vec!["b"]);

        transport.set_unreachable("b", false);
        let result = transport
            .fan_out(&nodes, sync(), Duration::from_secs(1))
            .await;
        assert!(result.failures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_branch_timeout() {
        let transport = transport(&["a", "b"]);
        transport.set_delay("b", Duration::from_secs(30));

        let nodes = vec!["a".to_string(), "b".to_string()];
        let result = transport
            .fan_out(&nodes, sync(), Duration::from_millis(500))
            .await;

        assert_eq!(result.responded_nodes(), vec!["a"]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].node_id, "b");
        assert!(result.failures[0].timed_out);
    }

    #[tokio::test]
    async fn test_handler_error_is_node_failure() {
        let transport = transport(&["a"]);
        let nodes = vec!["a".to_string()];
        let result = transport
            .fan_out(
                &nodes,
                NodeRequest::Unload(Default::default()),
                Duration::from_secs(1),
            )
            .await;

        assert!(result.responses.is_empty());
        assert_eq!(result.failed_nodes(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_try_map_wrong_kind() {
        let transport = transport(&["a"]);
        let nodes = vec!["a".to_string()];
        let result = transport
            .fan_out(&nodes, sync(), Duration::from_secs(1))
            .await
            .try_map(|node, r| r.into_broadcast(node));

        assert!(result.responses.is_empty());
        assert_eq!(result.failed_nodes(), vec!["a"]);
    }
}
