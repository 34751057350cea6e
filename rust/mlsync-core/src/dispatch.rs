// rust/mlsync-core/src/dispatch.rs

//! Load task dispatch.
//!
//! The dispatcher picks one worker-eligible node for a new model load and
//! hands the load request to it: in-process when the chosen node is the
//! local one, over the transport otherwise. Failures are returned to the
//! caller and never retried here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DispatchConfig, DispatchPolicyKind};
use crate::directory::NodeDirectory;
use crate::error::{Result, SyncError, TransportFailure};
use crate::handler::NodeHandler;
use crate::protocol::{LoadRequest, LoadResponse, NodeId, NodeRequest, TaskId};
use crate::source::TrustedSources;
use crate::tasks::TaskManager;
use crate::transport::Transport;

/// Trait for node selection policies.
pub trait DispatchPolicy: Send + Sync {
    /// Choose one node from `candidates` (sorted ascending).
    ///
    /// `load` holds the number of running load tasks per node; nodes missing
    /// from it have none. Returns `None` when no candidate is acceptable.
    fn select(&self, candidates: &[NodeId], load: &HashMap<NodeId, usize>) -> Option<NodeId>;

    fn kind(&self) -> DispatchPolicyKind;
}

/// Node with the fewest running load tasks; ties go to the lowest id.
#[derive(Debug, Default)]
pub struct FewestRunningTasks;

impl DispatchPolicy for FewestRunningTasks {
    fn select(&self, candidates: &[NodeId], load: &HashMap<NodeId, usize>) -> Option<NodeId> {
        let load_of = |node: &NodeId| load.get(node).copied().unwrap_or(0);
        candidates
            .iter()
            .min_by(|a, b| load_of(a).cmp(&load_of(b)).then_with(|| a.cmp(b)))
            .cloned()
    }

    fn kind(&self) -> DispatchPolicyKind {
        DispatchPolicyKind::FewestRunningTasks
    }
}

/// Rotates over candidates in id order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl DispatchPolicy for RoundRobin {
    fn select(&self, candidates: &[NodeId], _load: &HashMap<NodeId, usize>) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }

    fn kind(&self) -> DispatchPolicyKind {
        DispatchPolicyKind::RoundRobin
    }
}

/// Always the same node, as long as it is eligible.
#[derive(Debug)]
pub struct Pinned {
    node_id: NodeId,
}

impl Pinned {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl DispatchPolicy for Pinned {
    fn select(&self, candidates: &[NodeId], _load: &HashMap<NodeId, usize>) -> Option<NodeId> {
        candidates.iter().find(|n| **n == self.node_id).cloned()
    }

    fn kind(&self) -> DispatchPolicyKind {
        DispatchPolicyKind::Pinned
    }
}

/// Create a dispatch policy from configuration.
pub fn policy_from_config(config: &DispatchConfig) -> Result<Box<dyn DispatchPolicy>> {
    let policy: Box<dyn DispatchPolicy> = match config.policy {
        DispatchPolicyKind::FewestRunningTasks => Box::new(FewestRunningTasks),
        DispatchPolicyKind::RoundRobin => Box::<RoundRobin>::default(),
        DispatchPolicyKind::Pinned => {
            let node = config
                .pinned_node
                .as_ref()
                .ok_or_else(|| SyncError::config("pinned dispatch policy requires pinned_node"))?;
            Box::new(Pinned::new(node.clone()))
        }
    };
    Ok(policy)
}

/// Result of a successful hand-off.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub task_id: TaskId,
    pub node_id: NodeId,
    /// The worker's immediate answer. A rejected load (for example a model
    /// that is already loading there) is reported here, not as an error.
    pub response: LoadResponse,
}

pub struct TaskDispatcher {
    directory: Arc<dyn NodeDirectory>,
    transport: Arc<dyn Transport>,
    local: Arc<NodeHandler>,
    tasks: Arc<TaskManager>,
    policy: Box<dyn DispatchPolicy>,
    trusted: TrustedSources,
    request_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        transport: Arc<dyn Transport>,
        local: Arc<NodeHandler>,
        tasks: Arc<TaskManager>,
        policy: Box<dyn DispatchPolicy>,
        trusted: TrustedSources,
        request_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            transport,
            local,
            tasks,
            policy,
            trusted,
            request_timeout,
        }
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Running load tasks per node: the last broadcast plus tasks this node
    /// dispatched since then.
    fn node_load(&self) -> HashMap<NodeId, usize> {
        let view = self.local.view().snapshot();
        let mut load = view.running_count_per_node();
        for (node, task_id) in self.tasks.dispatched_since(view.applied_at) {
            if !view.running_tasks.contains_key(&task_id) {
                *load.entry(node).or_insert(0) += 1;
            }
        }
        load
    }

    /// Choose a worker for `model_id` and start the load there.
    pub async fn dispatch(
        &self,
        model_id: &str,
        source_ref: &str,
        task_id: Option<TaskId>,
    ) -> Result<DispatchOutcome> {
        self.trusted.check(source_ref)?;

        let candidates = self.directory.list_eligible_nodes();
        if candidates.is_empty() {
            return Err(SyncError::no_eligible_node(format!("load of model '{}'", model_id)));
        }

        let record = self.tasks.create(model_id, source_ref, task_id)?;
        let task_id = record.task_id;

        let node_id = match self.policy.select(&candidates, &self.node_load()) {
            Some(node_id) => node_id,
            None => {
                let err = SyncError::no_eligible_node(format!(
                    "load of model '{}' under {:?} policy",
                    model_id,
                    self.policy.kind()
                ));
                self.tasks.mark_failed(&task_id, err.to_string())?;
                return Err(err);
            }
        };

        let request = LoadRequest {
            model_id: model_id.to_string(),
            model_source_ref: source_ref.to_string(),
            task_id: task_id.clone(),
        };

        tracing::info!(model_id, task_id = %task_id, node_id = %node_id, "Dispatching model load");

        let response = if node_id == self.local.node_id() {
            self.local.handle_load(request).await
        } else {
            match self.send_remote(&node_id, request).await {
                Ok(response) => response,
                Err(e) => {
                    self.tasks.mark_failed(&task_id, e.to_string())?;
                    return Err(e);
                }
            }
        };

        if response.is_accepted() {
            self.tasks.mark_dispatched(&task_id, &node_id)?;
        } else {
            let reason = response
                .error_message
                .clone()
                .unwrap_or_else(|| "load rejected".to_string());
            self.tasks.mark_failed(&task_id, reason)?;
        }

        Ok(DispatchOutcome {
            task_id,
            node_id,
            response,
        })
    }

    async fn send_remote(&self, node_id: &str, request: LoadRequest) -> Result<LoadResponse> {
        let response = tokio::time::timeout(
            self.request_timeout,
            self.transport.send(node_id, NodeRequest::Load(request)),
        )
        .await
        .map_err(|_| TransportFailure::timeout(node_id, self.request_timeout.as_millis() as u64))??;
        response.into_load(node_id)
    }
}
