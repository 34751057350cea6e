//! gRPC service implementation for a cluster node.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use mlsync_core::rpc::proto::node_service_server::NodeService;
use mlsync_core::rpc::proto::{
    BroadcastRequest, BroadcastResponse, LoadRequest, LoadResponse, SyncRequest, SyncResponse,
    UnloadRequest, UnloadResponse,
};
use mlsync_core::NodeHandler;

pub struct NodeServiceImpl {
    handler: Arc<NodeHandler>,
}

impl NodeServiceImpl {
    pub fn new(handler: Arc<NodeHandler>) -> Self {
        Self { handler }
    }

    fn validate_model_id(model_id: &str) -> Result<(), Status> {
        if model_id.is_empty() {
            return Err(Status::invalid_argument("model_id is required"));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl NodeService for NodeServiceImpl {
    async fn sync(
        &self,
        request: Request<SyncRequest>,
    ) -> Result<Response<SyncResponse>, Status> {
        self.handler.stats().record_request();
        let response = self.handler.handle_sync(request.into_inner().into()).await;
        Ok(Response::new(response.into()))
    }

    async fn broadcast(
        &self,
        request: Request<BroadcastRequest>,
    ) -> Result<Response<BroadcastResponse>, Status> {
        self.handler.stats().record_request();
        let response = self.handler.handle_broadcast(request.into_inner().into());
        Ok(Response::new(response.into()))
    }

    async fn load(
        &self,
        request: Request<LoadRequest>,
    ) -> Result<Response<LoadResponse>, Status> {
        let req = request.into_inner();
        Self::validate_model_id(&req.model_id)?;
        if req.task_id.is_empty() {
            return Err(Status::invalid_argument("task_id is required"));
        }
        self.handler.stats().record_request();

        let response = self.handler.handle_load(req.into()).await;
        if !response.is_accepted() {
            tracing::info!(
                node_id = %self.handler.node_id(),
                error = ?response.error_message,
                "Load request refused"
            );
        }
        Ok(Response::new(response.into()))
    }

    async fn unload(
        &self,
        request: Request<UnloadRequest>,
    ) -> Result<Response<UnloadResponse>, Status> {
        let req = request.into_inner();
        for model_id in &req.model_ids {
            Self::validate_model_id(model_id)?;
        }
        self.handler.stats().record_request();

        let response = self.handler.handle_unload(req.into()).await;
        Ok(Response::new(response.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlsync_core::config::DEFAULT_TRUSTED_URL_REGEX;
    use mlsync_core::{
        ClusterView, InMemoryEngine, LocalModelSource, NodeModelRegistry, NodeStats,
        TrustedSources,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn service() -> (NodeServiceImpl, Arc<NodeHandler>, TempDir) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("m1.bin"), b"weights").unwrap();

        let registry = Arc::new(NodeModelRegistry::new(
            "node-a",
            Arc::new(InMemoryEngine::new()),
        ));
        let source = Arc::new(LocalModelSource::new(
            dir.path(),
            TrustedSources::new(DEFAULT_TRUSTED_URL_REGEX).unwrap(),
        ));
        let handler = Arc::new(NodeHandler::new(
            registry,
            source,
            Arc::new(ClusterView::new()),
            Arc::new(NodeStats::new()),
        ));
        (NodeServiceImpl::new(handler.clone()), handler, dir)
    }

    #[tokio::test]
    async fn test_load_then_sync_reports_loaded() {
        let (service, handler, _dir) = service();

        let response = service
            .load(Request::new(LoadRequest {
                model_id: "m1".to_string(),
                model_source_ref: "m1.bin".to_string(),
                task_id: "t1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.status, "loading");
        assert!(response.error_message.is_empty());

        for _ in 0..200 {
            if handler.registry().running_tasks().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response = service
            .sync(Request::new(SyncRequest {
                want_loaded_models: true,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.node_id, "node-a");
        assert_eq!(response.model_load_statuses.len(), 1);
        assert_eq!(response.model_load_statuses[0].status, "loaded");
        assert!(response.running_task_ids.is_empty());
    }

    #[tokio::test]
    async fn test_unload_reports_per_model() {
        let (service, _handler, _dir) = service();

        let response = service
            .unload(Request::new(UnloadRequest {
                model_ids: vec!["m2".to_string()],
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.per_model_status["m2"], "not_found");
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let (service, _handler, _dir) = service();

        let status = service
            .load(Request::new(LoadRequest {
                model_id: String::new(),
                model_source_ref: "m1.bin".to_string(),
                task_id: "t1".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = service
            .unload(Request::new(UnloadRequest {
                model_ids: vec![String::new()],
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_broadcast_acknowledged_with_version() {
        let (service, handler, _dir) = service();

        let response = service
            .broadcast(Request::new(BroadcastRequest {
                clear_all: true,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.node_id, "node-a");
        assert_eq!(response.routing_version, 1);
        assert_eq!(handler.view().version(), 1);
    }
}
