// rust/mlsync-core/src/tasks.rs

//! Load task bookkeeping on the dispatching node.
//!
//! Every load is recorded before it is sent anywhere, so a caller can find
//! out what happened and re-dispatch after a failure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::protocol::{ModelId, NodeId, RoutingTable, RunningTaskIndex, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Dispatched,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub model_id: ModelId,
    pub source_ref: String,
    pub state: TaskState,
    pub worker_node: Option<NodeId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

/// How long finished records stay queryable by default.
pub const DEFAULT_TASK_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct TaskManager {
    tasks: DashMap<TaskId, TaskRecord>,
    retention: Duration,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_TASK_RETENTION)
    }

    /// Finished records are evicted once they are older than `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            retention,
        }
    }

    /// Record a new task. A fresh UUID is used when `task_id` is `None`.
    ///
    /// Fails with [`SyncError::DuplicateTask`] if a record with the same id
    /// exists; the existing record is untouched.
    pub fn create(
        &self,
        model_id: impl Into<ModelId>,
        source_ref: impl Into<String>,
        task_id: Option<TaskId>,
    ) -> Result<TaskRecord> {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let entry = match self.tasks.entry(task_id) {
            Entry::Occupied(entry) => return Err(SyncError::duplicate_task(entry.key().clone())),
            Entry::Vacant(entry) => entry,
        };

        let now = Utc::now();
        let record = TaskRecord {
            task_id: entry.key().clone(),
            model_id: model_id.into(),
            source_ref: source_ref.into(),
            state: TaskState::Created,
            worker_node: None,
            error: None,
            created_at: now,
            updated_at: now,
            dispatched_at: None,
        };
        tracing::debug!(task_id = %record.task_id, model_id = %record.model_id, "Task created");
        entry.insert(record.clone());
        Ok(record)
    }

    pub fn get(&self, task_id: &str) -> Result<TaskRecord> {
        self.tasks
            .get(task_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| SyncError::task_not_found(task_id))
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self.tasks.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        records
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut TaskRecord)) -> Result<TaskRecord> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SyncError::task_not_found(task_id))?;
        f(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }

    pub fn mark_dispatched(&self, task_id: &str, node_id: &str) -> Result<TaskRecord> {
        self.update(task_id, |record| {
            record.state = TaskState::Dispatched;
            record.worker_node = Some(node_id.to_string());
            record.dispatched_at = Some(Utc::now());
        })
    }

    pub fn mark_failed(&self, task_id: &str, error: impl Into<String>) -> Result<TaskRecord> {
        let error = error.into();
        tracing::warn!(task_id, error = %error, "Task failed");
        self.update(task_id, |record| {
            record.state = TaskState::Failed;
            record.error = Some(error);
        })
    }

    /// Load tasks dispatched after `since` that have not finished, per node.
    pub fn dispatched_since(&self, since: Option<DateTime<Utc>>) -> Vec<(NodeId, TaskId)> {
        self.tasks
            .iter()
            .filter(|r| r.state == TaskState::Dispatched)
            .filter(|r| match (since, r.dispatched_at) {
                (Some(since), Some(at)) => at > since,
                _ => true,
            })
            .filter_map(|r| r.worker_node.clone().map(|n| (n, r.task_id.clone())))
            .collect()
    }

    /// Drop finished records last updated more than the retention ago.
    /// Returns how many were dropped.
    pub fn evict_finished(&self) -> usize {
        let now = Utc::now();
        let before = self.tasks.len();
        self.tasks.retain(|_, record| {
            let age = (now - record.updated_at).to_std().unwrap_or_default();
            !(record.state.is_finished() && age >= self.retention)
        });
        let evicted = before.saturating_sub(self.tasks.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted finished tasks");
        }
        evicted
    }

    /// Advance task states from a reconciled cluster view, then evict
    /// finished records past retention.
    ///
    /// A dispatched task seen running becomes `Running`. A task no longer
    /// running completes if its model is routed to its worker; a running
    /// task that vanished without that fails.
    pub fn observe(&self, routing_table: &RoutingTable, running_tasks: &RunningTaskIndex) {
        for mut entry in self.tasks.iter_mut() {
            let record = entry.value_mut();
            if record.state.is_finished() || record.state == TaskState::Created {
                continue;
            }

            let loaded_on_worker = match (&record.worker_node, routing_table.get(&record.model_id)) {
                (Some(node), Some(nodes)) => nodes.contains(node),
                _ => false,
            };
            let running = running_tasks.contains_key(&record.task_id);

            let next = match (record.state, running, loaded_on_worker) {
                (TaskState::Dispatched, true, _) => Some(TaskState::Running),
                (_, false, true) => Some(TaskState::Completed),
                (TaskState::Running, false, false) => Some(TaskState::Failed),
                _ => None,
            };

            if let Some(next) = next {
                tracing::debug!(task_id = %record.task_id, from = ?record.state, to = ?next, "Task state observed");
                if next == TaskState::Failed {
                    record.error = Some("load stopped without the model becoming routable".to_string());
                }
                record.state = next;
                record.updated_at = Utc::now();
            }
        }
        self.evict_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn nodes(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_create_generates_ids() {
        let manager = TaskManager::new();
        let a = manager.create("m1", "m1.bin", None).unwrap();
        let b = manager.create("m1", "m1.bin", None).unwrap();
        assert_ne!(a.task_id, b.task_id);
        assert_eq!(a.state, TaskState::Created);

        let c = manager
            .create("m2", "m2.bin", Some("task-7".to_string()))
            .unwrap();
        assert_eq!(c.task_id, "task-7");
        assert_eq!(manager.list().len(), 3);
    }

    #[test]
    fn test_reused_task_id_rejected() {
        let manager = TaskManager::new();
        manager.create("m1", "m1.bin", Some("t1".to_string())).unwrap();
        manager.mark_dispatched("t1", "a").unwrap();

        let err = manager
            .create("m2", "m2.bin", Some("t1".to_string()))
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateTask { .. }));

        let record = manager.get("t1").unwrap();
        assert_eq!(record.model_id, "m1");
        assert_eq!(record.state, TaskState::Dispatched);
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn test_finished_tasks_evicted_after_retention() {
        let manager = TaskManager::with_retention(Duration::ZERO);
        let done = manager.create("m1", "m1.bin", Some("t1".to_string())).unwrap();
        let pending = manager.create("m2", "m2.bin", Some("t2".to_string())).unwrap();
        manager.mark_dispatched(&done.task_id, "a").unwrap();
        manager.mark_dispatched(&pending.task_id, "b").unwrap();

        let mut routing = RoutingTable::new();
        routing.insert("m1".to_string(), nodes(&["a"]));
        manager.observe(&routing, &RunningTaskIndex::new());

        assert!(matches!(manager.get("t1"), Err(SyncError::TaskNotFound { .. })));
        assert_eq!(manager.get("t2").unwrap().state, TaskState::Dispatched);

        let kept = TaskManager::new();
        kept.create("m1", "m1.bin", Some("t1".to_string())).unwrap();
        kept.mark_failed("t1", "boom").unwrap();
        assert_eq!(kept.evict_finished(), 0);
        assert_eq!(kept.get("t1").unwrap().state, TaskState::Failed);
    }

    #[test]
    fn test_dispatch_and_fail() {
        let manager = TaskManager::new();
        let task = manager.create("m1", "m1.bin", None).unwrap();

        let record = manager.mark_dispatched(&task.task_id, "b").unwrap();
        assert_eq!(record.state, TaskState::Dispatched);
        assert_eq!(record.worker_node.as_deref(), Some("b"));
        assert_eq!(manager.dispatched_since(None).len(), 1);

        let record = manager.mark_failed(&task.task_id, "connection refused").unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(manager.dispatched_since(None).is_empty());

        let err = manager.get("missing").unwrap_err();
        assert!(matches!(err, SyncError::TaskNotFound { .. }));
        assert!(manager.mark_dispatched("missing", "a").is_err());
    }

    #[test]
    fn test_observe_lifecycle() {
        let manager = TaskManager::new();
        let ok = manager.create("m1", "m1.bin", Some("t1".to_string())).unwrap();
        let lost = manager.create("m2", "m2.bin", Some("t2".to_string())).unwrap();
        manager.mark_dispatched(&ok.task_id, "a").unwrap();
        manager.mark_dispatched(&lost.task_id, "b").unwrap();

        let mut running = RunningTaskIndex::new();
        running.insert("t1".to_string(), nodes(&["a"]));
        running.insert("t2".to_string(), nodes(&["b"]));
        manager.observe(&RoutingTable::new(), &running);
        assert_eq!(manager.get("t1").unwrap().state, TaskState::Running);
        assert_eq!(manager.get("t2").unwrap().state, TaskState::Running);

        let mut routing = RoutingTable::new();
        routing.insert("m1".to_string(), nodes(&["a"]));
        manager.observe(&routing, &RunningTaskIndex::new());
        assert_eq!(manager.get("t1").unwrap().state, TaskState::Completed);
        let lost = manager.get("t2").unwrap();
        assert_eq!(lost.state, TaskState::Failed);
        assert!(lost.error.is_some());
    }

    #[test]
    fn test_fast_load_completes_without_running() {
        let manager = TaskManager::new();
        let task = manager.create("m1", "m1.bin", None).unwrap();
        manager.mark_dispatched(&task.task_id, "a").unwrap();

        manager.observe(&RoutingTable::new(), &RunningTaskIndex::new());
        assert_eq!(manager.get(&task.task_id).unwrap().state, TaskState::Dispatched);

        let mut routing = RoutingTable::new();
        routing.insert("m1".to_string(), nodes(&["a"]));
        manager.observe(&routing, &RunningTaskIndex::new());
        assert_eq!(manager.get(&task.task_id).unwrap().state, TaskState::Completed);
    }
}
