// rust/mlsync-core/src/registry.rs

//! Per-node model registry.
//!
//! The registry is the only writer of this node's model statuses. Remote
//! nodes learn about them through [`NodeModelRegistry::report_local_state`]
//! and never mutate them directly.
//!
//! Operations on the same model are serialized by a per-model async lock, so
//! a load completion and an unload of one model never interleave. Operations
//! on different models only share the short-lived state lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::engine::{EngineError, ModelEngine};
use crate::error::{Result, SyncError};
use crate::protocol::{ModelId, ModelLoadStatus, NodeId, NodeSnapshot, TaskId, UnloadStatus};

/// How a background load ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed(String),
}

#[derive(Debug, Default)]
struct RegistryState {
    statuses: HashMap<ModelId, ModelLoadStatus>,
    running: HashMap<TaskId, ModelId>,
    // Unloads requested while the model was still loading.
    deferred_unloads: HashSet<ModelId>,
}

impl RegistryState {
    /// Current status, treating terminal statuses as absent.
    fn live_status(&self, model_id: &str) -> Option<ModelLoadStatus> {
        self.statuses
            .get(model_id)
            .copied()
            .filter(|s| !s.is_terminal())
    }
}

/// Holds one model's lock. Dropping it releases the lock and forgets the
/// model's lock entry once nobody else holds or waits on it.
struct ModelGuard<'a> {
    locks: &'a DashMap<ModelId, Arc<Mutex<()>>>,
    model_id: ModelId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ModelGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.model_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct NodeModelRegistry {
    node_id: NodeId,
    engine: Arc<dyn ModelEngine>,
    state: RwLock<RegistryState>,
    model_locks: DashMap<ModelId, Arc<Mutex<()>>>,
}

impl NodeModelRegistry {
    pub fn new(node_id: impl Into<NodeId>, engine: Arc<dyn ModelEngine>) -> Self {
        Self {
            node_id: node_id.into(),
            engine,
            state: RwLock::new(RegistryState::default()),
            model_locks: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> Arc<dyn ModelEngine> {
        Arc::clone(&self.engine)
    }

    async fn lock_model(&self, model_id: &str) -> ModelGuard<'_> {
        let lock = self
            .model_locks
            .entry(model_id.to_string())
            .or_default()
            .clone();
        ModelGuard {
            locks: &self.model_locks,
            model_id: model_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Point-in-time copy of every model status and running task.
    pub async fn report_local_state(&self) -> NodeSnapshot {
        let state = self.state.read().await;
        NodeSnapshot {
            node_id: self.node_id.clone(),
            model_statuses: state
                .statuses
                .iter()
                .map(|(model_id, status)| (model_id.clone(), *status))
                .collect(),
            running_task_ids: state.running.keys().cloned().collect(),
        }
    }

    pub async fn status_of(&self, model_id: &str) -> Option<ModelLoadStatus> {
        self.state.read().await.statuses.get(model_id).copied()
    }

    pub async fn running_tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<_> = self.state.read().await.running.keys().cloned().collect();
        tasks.sort();
        tasks
    }

    /// Start a load lifecycle for `model_id` under `task_id`.
    ///
    /// Fails with [`SyncError::AlreadyLoading`] if the model already has a
    /// non-terminal status on this node, and with [`SyncError::DuplicateTask`]
    /// if `task_id` is already running here. Existing state is untouched.
    pub async fn begin_load(&self, model_id: &str, task_id: &str) -> Result<()> {
        let _guard = self.lock_model(model_id).await;
        let mut state = self.state.write().await;

        if let Some(status) = state.live_status(model_id) {
            tracing::debug!(model_id, %status, "Rejecting load of active model");
            return Err(SyncError::already_loading(model_id, status));
        }
        if state.running.contains_key(task_id) {
            tracing::debug!(model_id, task_id, "Rejecting load under a running task id");
            return Err(SyncError::duplicate_task(task_id));
        }

        state
            .statuses
            .insert(model_id.to_string(), ModelLoadStatus::Loading);
        state
            .running
            .insert(task_id.to_string(), model_id.to_string());
        state.deferred_unloads.remove(model_id);

        tracing::info!(
            node_id = %self.node_id,
            model_id,
            task_id,
            "Model load started"
        );
        Ok(())
    }

    /// Finish the load lifecycle started by [`begin_load`](Self::begin_load).
    ///
    /// `task_id` must be the task running the load of `model_id`; anything
    /// else is rejected and changes nothing. Otherwise the task leaves the
    /// running set and the model's resulting status is returned: `Loaded`,
    /// `Failed`, or `NotFound` when an unload was requested while the model
    /// was loading.
    pub async fn complete_load(
        &self,
        model_id: &str,
        task_id: &str,
        outcome: LoadOutcome,
    ) -> Result<ModelLoadStatus> {
        let _guard = self.lock_model(model_id).await;
        let mut state = self.state.write().await;

        let next = match outcome {
            LoadOutcome::Loaded => ModelLoadStatus::Loaded,
            LoadOutcome::Failed(_) => ModelLoadStatus::Failed,
        };
        let current = state
            .statuses
            .get(model_id)
            .copied()
            .unwrap_or(ModelLoadStatus::NotFound);
        let owns_task = state.running.get(task_id).map(String::as_str) == Some(model_id);
        if !owns_task || !current.can_transition_to(next) {
            return Err(SyncError::invalid_transition(model_id, current, next));
        }

        state.running.remove(task_id);

        state.statuses.insert(model_id.to_string(), next);
        let deferred = state.deferred_unloads.remove(model_id);

        match &outcome {
            LoadOutcome::Loaded => {
                tracing::info!(node_id = %self.node_id, model_id, task_id, "Model loaded")
            }
            LoadOutcome::Failed(reason) => tracing::warn!(
                node_id = %self.node_id,
                model_id,
                task_id,
                reason = %reason,
                "Model load failed"
            ),
        }

        if deferred && next.can_transition_to(ModelLoadStatus::Unloading) {
            state
                .statuses
                .insert(model_id.to_string(), ModelLoadStatus::Unloading);
            drop(state);
            self.release(model_id).await;
            return Ok(ModelLoadStatus::NotFound);
        }

        Ok(next)
    }

    /// Unload every requested model, reporting one status per id.
    pub async fn begin_unload(&self, model_ids: &[ModelId]) -> BTreeMap<ModelId, UnloadStatus> {
        let mut results = BTreeMap::new();
        for model_id in model_ids {
            if results.contains_key(model_id) {
                continue;
            }
            let status = self.unload_one(model_id).await;
            results.insert(model_id.clone(), status);
        }
        results
    }

    async fn unload_one(&self, model_id: &str) -> UnloadStatus {
        let _guard = self.lock_model(model_id).await;
        let mut state = self.state.write().await;

        match state.statuses.get(model_id).copied() {
            None => UnloadStatus::NotFound,
            Some(status) if status.is_terminal() => {
                state.statuses.remove(model_id);
                UnloadStatus::NotFound
            }
            Some(ModelLoadStatus::Loading) => {
                tracing::debug!(model_id, "Deferring unload until load completes");
                state.deferred_unloads.insert(model_id.to_string());
                UnloadStatus::Unloading
            }
            Some(status) if status.can_transition_to(ModelLoadStatus::Unloading) => {
                state
                    .statuses
                    .insert(model_id.to_string(), ModelLoadStatus::Unloading);
                drop(state);
                self.release(model_id).await
            }
            // Already unloading.
            Some(_) => UnloadStatus::Unloading,
        }
    }

    /// UNLOADING -> NOT_FOUND. The entry is dropped even if the engine fails.
    async fn release(&self, model_id: &str) -> UnloadStatus {
        let result = match self.engine.unload(model_id).await {
            Ok(()) | Err(EngineError::NotLoaded { .. }) => UnloadStatus::Unloaded,
            Err(e) => {
                tracing::warn!(
                    node_id = %self.node_id,
                    model_id,
                    error = %e,
                    "Engine failed to release model"
                );
                UnloadStatus::Failed
            }
        };

        self.state.write().await.statuses.remove(model_id);
        tracing::info!(node_id = %self.node_id, model_id, status = %result, "Model unloaded");
        result
    }
}
