// rust/mlsync-core/src/handler.rs

//! Node-side request handling.
//!
//! [`NodeHandler`] serves every node-addressed request: gather (sync),
//! broadcast, load and unload. It is reached through a transport or called
//! directly when the requesting node is the target.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{
    BroadcastRequest, BroadcastResponse, LoadRequest, LoadResponse, NodeId, NodeRequest,
    NodeResponse, SyncRequest, SyncResponse, UnloadRequest, UnloadResponse,
};
use crate::registry::{LoadOutcome, NodeModelRegistry};
use crate::source::ModelSource;
use crate::stats::NodeStats;
use crate::view::ClusterView;

/// Anything that can answer a [`NodeRequest`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: NodeRequest) -> Result<NodeResponse>;
}

pub struct NodeHandler {
    node_id: NodeId,
    registry: Arc<NodeModelRegistry>,
    source: Arc<dyn ModelSource>,
    view: Arc<ClusterView>,
    stats: Arc<NodeStats>,
}

impl NodeHandler {
    pub fn new(
        registry: Arc<NodeModelRegistry>,
        source: Arc<dyn ModelSource>,
        view: Arc<ClusterView>,
        stats: Arc<NodeStats>,
    ) -> Self {
        Self {
            node_id: registry.node_id().to_string(),
            registry,
            source,
            view,
            stats,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<NodeModelRegistry> {
        &self.registry
    }

    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    pub fn stats(&self) -> &Arc<NodeStats> {
        &self.stats
    }

    pub async fn handle_sync(&self, request: SyncRequest) -> SyncResponse {
        let mut snapshot = self.registry.report_local_state().await;
        if !request.want_loaded_models {
            snapshot.model_statuses.clear();
        }
        snapshot.into()
    }

    pub fn handle_broadcast(&self, request: BroadcastRequest) -> BroadcastResponse {
        let routing_version = self.view.apply(&request);
        tracing::debug!(
            node_id = %self.node_id,
            routing_version,
            clear_all = request.clear_all,
            models = request.routing_table.len(),
            running_tasks = request.running_tasks.len(),
            "Applied routing broadcast"
        );
        BroadcastResponse {
            node_id: self.node_id.clone(),
            routing_version,
        }
    }

    /// Start a load and return as soon as the lifecycle is recorded.
    ///
    /// Fetching the artifact, the engine load and the completion run in a
    /// spawned task.
    pub async fn handle_load(&self, request: LoadRequest) -> LoadResponse {
        if let Err(e) = self
            .registry
            .begin_load(&request.model_id, &request.task_id)
            .await
        {
            return LoadResponse::rejected(self.node_id.clone(), e.to_string());
        }
        self.stats.record_load_started();

        let registry = Arc::clone(&self.registry);
        let source = Arc::clone(&self.source);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let outcome = run_load(&registry, source.as_ref(), &request).await;
            let success = outcome == LoadOutcome::Loaded;
            if let Err(e) = registry
                .complete_load(&request.model_id, &request.task_id, outcome)
                .await
            {
                tracing::warn!(
                    model_id = %request.model_id,
                    task_id = %request.task_id,
                    error = %e,
                    "Load completion rejected"
                );
            }
            stats.record_load_finished(success);
        });

        LoadResponse::accepted(self.node_id.clone())
    }

    pub async fn handle_unload(&self, request: UnloadRequest) -> UnloadResponse {
        let per_model_status = self.registry.begin_unload(&request.model_ids).await;
        self.stats.record_unloads(per_model_status.len());
        UnloadResponse {
            node_id: self.node_id.clone(),
            per_model_status,
        }
    }
}

async fn run_load(
    registry: &NodeModelRegistry,
    source: &dyn ModelSource,
    request: &LoadRequest,
) -> LoadOutcome {
    let bytes = match source.fetch(&request.model_source_ref).await {
        Ok(bytes) => bytes,
        Err(e) => return LoadOutcome::Failed(e.to_string()),
    };
    match registry.engine().load(&request.model_id, bytes).await {
        Ok(()) => LoadOutcome::Loaded,
        Err(e) => LoadOutcome::Failed(e.to_string()),
    }
}

#[async_trait]
impl RequestHandler for NodeHandler {
    async fn handle(&self, request: NodeRequest) -> Result<NodeResponse> {
        self.stats.record_request();
        let response = match request {
            NodeRequest::Sync(r) => NodeResponse::Sync(self.handle_sync(r).await),
            NodeRequest::Broadcast(r) => NodeResponse::Broadcast(self.handle_broadcast(r)),
            NodeRequest::Load(r) => NodeResponse::Load(self.handle_load(r).await),
            NodeRequest::Unload(r) => NodeResponse::Unload(self.handle_unload(r).await),
        };
        Ok(response)
    }
}
