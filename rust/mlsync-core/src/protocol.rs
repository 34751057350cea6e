//! Protocol types exchanged between nodes.
//!
//! This module defines the cluster data model (statuses, snapshots, routing
//! tables) and the node-level request/response messages. When the `grpc`
//! feature is enabled, conversion traits to and from the generated protobuf
//! messages live alongside each type.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[cfg(feature = "grpc")]
pub(crate) use crate::rpc::proto;

/// Opaque, stable identifier of a cluster member.
pub type NodeId = String;
/// Globally unique identifier of a model version.
pub type ModelId = String;
/// Identifier of one in-flight load operation.
pub type TaskId = String;

/// ModelId -> nodes currently holding the model, ready to serve.
pub type RoutingTable = BTreeMap<ModelId, BTreeSet<NodeId>>;
/// TaskId -> nodes currently executing the load task.
pub type RunningTaskIndex = BTreeMap<TaskId, BTreeSet<NodeId>>;

/// Lifecycle status of one model on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelLoadStatus {
    Loading,
    Loaded,
    Unloading,
    NotFound,
    Failed,
}

impl ModelLoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
            Self::NotFound => "not_found",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses end a lifecycle; a new load may start afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotFound | Self::Failed)
    }

    /// The only edges a (node, model) status may follow.
    pub fn can_transition_to(&self, next: ModelLoadStatus) -> bool {
        matches!(
            (self, next),
            (Self::Loading, Self::Loaded)
                | (Self::Loading, Self::Failed)
                | (Self::Loaded, Self::Unloading)
                | (Self::Unloading, Self::NotFound)
        )
    }
}

impl fmt::Display for ModelLoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelLoadStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loading" => Ok(Self::Loading),
            "loaded" => Ok(Self::Loaded),
            "unloading" => Ok(Self::Unloading),
            "not_found" => Ok(Self::NotFound),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::config(format!("unknown model status '{}'", other))),
        }
    }
}

/// Per-model outcome of an unload call on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadStatus {
    /// The model was resident and has been released.
    Unloaded,
    /// The node never had the model (or it already ended its lifecycle).
    NotFound,
    /// Release is pending: the model is still loading or being unloaded.
    Unloading,
    /// The engine failed to release the model.
    Failed,
}

impl UnloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::NotFound => "not_found",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        }
    }

    /// Whether this report counts as "gone from the node".
    pub fn is_released(&self) -> bool {
        matches!(self, Self::Unloaded | Self::NotFound)
    }
}

impl fmt::Display for UnloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnloadStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unloaded" => Ok(Self::Unloaded),
            "not_found" => Ok(Self::NotFound),
            "unloading" => Ok(Self::Unloading),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::config(format!("unknown unload status '{}'", other))),
        }
    }
}

/// One node's report of its own state. Built fresh for every gather.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub model_statuses: BTreeMap<ModelId, ModelLoadStatus>,
    pub running_task_ids: BTreeSet<TaskId>,
}

impl NodeSnapshot {
    /// Models this node reports as ready to serve.
    pub fn loaded_models(&self) -> impl Iterator<Item = &ModelId> {
        self.model_statuses
            .iter()
            .filter(|(_, status)| **status == ModelLoadStatus::Loaded)
            .map(|(model_id, _)| model_id)
    }
}

// ---------------------------------------------------------------------------
// Node-level messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    pub want_loaded_models: bool,
}

/// A node's answer to a gather request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub node_id: NodeId,
    pub model_load_statuses: Vec<(ModelId, ModelLoadStatus)>,
    pub running_task_ids: Vec<TaskId>,
}

impl From<NodeSnapshot> for SyncResponse {
    fn from(snapshot: NodeSnapshot) -> Self {
        Self {
            node_id: snapshot.node_id,
            model_load_statuses: snapshot.model_statuses.into_iter().collect(),
            running_task_ids: snapshot.running_task_ids.into_iter().collect(),
        }
    }
}

impl From<SyncResponse> for NodeSnapshot {
    fn from(response: SyncResponse) -> Self {
        Self {
            node_id: response.node_id,
            model_statuses: response.model_load_statuses.into_iter().collect(),
            running_task_ids: response.running_task_ids.into_iter().collect(),
        }
    }
}

/// Reconciled cluster state pushed to every node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub clear_all: bool,
    pub routing_table: RoutingTable,
    pub running_tasks: RunningTaskIndex,
}

impl BroadcastRequest {
    pub fn clear(running_tasks: RunningTaskIndex) -> Self {
        Self {
            clear_all: true,
            routing_table: RoutingTable::new(),
            running_tasks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub node_id: NodeId,
    pub routing_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_id: ModelId,
    pub model_source_ref: String,
    pub task_id: TaskId,
}

/// Immediate answer to a load request: the lifecycle has started (`loading`)
/// or was refused (`failed` with a message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub node_id: NodeId,
    pub status: ModelLoadStatus,
    pub error_message: Option<String>,
}

impl LoadResponse {
    pub fn accepted(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            status: ModelLoadStatus::Loading,
            error_message: None,
        }
    }

    pub fn rejected(node_id: impl Into<NodeId>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: ModelLoadStatus::Failed,
            error_message: Some(message.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ModelLoadStatus::Loading
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnloadRequest {
    pub model_ids: Vec<ModelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnloadResponse {
    pub node_id: NodeId,
    pub per_model_status: BTreeMap<ModelId, UnloadStatus>,
}

/// Any request a node serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRequest {
    Sync(SyncRequest),
    Broadcast(BroadcastRequest),
    Load(LoadRequest),
    Unload(UnloadRequest),
}

impl NodeRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Broadcast(_) => "broadcast",
            Self::Load(_) => "load",
            Self::Unload(_) => "unload",
        }
    }
}

/// Any response a node produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeResponse {
    Sync(SyncResponse),
    Broadcast(BroadcastResponse),
    Load(LoadResponse),
    Unload(UnloadResponse),
}

impl NodeResponse {
    pub fn into_sync(self, node_id: &str) -> Result<SyncResponse> {
        match self {
            Self::Sync(r) => Ok(r),
            _ => Err(SyncError::unexpected_response(node_id, "sync response")),
        }
    }

    pub fn into_broadcast(self, node_id: &str) -> Result<BroadcastResponse> {
        match self {
            Self::Broadcast(r) => Ok(r),
            _ => Err(SyncError::unexpected_response(node_id, "broadcast response")),
        }
    }

    pub fn into_load(self, node_id: &str) -> Result<LoadResponse> {
        match self {
            Self::Load(r) => Ok(r),
            _ => Err(SyncError::unexpected_response(node_id, "load response")),
        }
    }

    pub fn into_unload(self, node_id: &str) -> Result<UnloadResponse> {
        match self {
            Self::Unload(r) => Ok(r),
            _ => Err(SyncError::unexpected_response(node_id, "unload response")),
        }
    }
}

// ---------------------------------------------------------------------------
// Protobuf conversions
// ---------------------------------------------------------------------------

#[cfg(feature = "grpc")]
fn node_set(nodes: BTreeSet<NodeId>) -> proto::NodeSet {
    proto::NodeSet {
        node_ids: nodes.into_iter().collect(),
    }
}

#[cfg(feature = "grpc")]
impl From<SyncRequest> for proto::SyncRequest {
    fn from(req: SyncRequest) -> Self {
        Self {
            want_loaded_models: req.want_loaded_models,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<proto::SyncRequest> for SyncRequest {
    fn from(req: proto::SyncRequest) -> Self {
        Self {
            want_loaded_models: req.want_loaded_models,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<SyncResponse> for proto::SyncResponse {
    fn from(resp: SyncResponse) -> Self {
        Self {
            node_id: resp.node_id,
            model_load_statuses: resp
                .model_load_statuses
                .into_iter()
                .map(|(model_id, status)| proto::ModelStatusEntry {
                    model_id,
                    status: status.as_str().to_string(),
                })
                .collect(),
            running_task_ids: resp.running_task_ids,
        }
    }
}

#[cfg(feature = "grpc")]
impl TryFrom<proto::SyncResponse> for SyncResponse {
    type Error = SyncError;

    fn try_from(resp: proto::SyncResponse) -> Result<Self> {
        let model_load_statuses = resp
            .model_load_statuses
            .into_iter()
            .map(|entry| Ok((entry.model_id, entry.status.parse()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            node_id: resp.node_id,
            model_load_statuses,
            running_task_ids: resp.running_task_ids,
        })
    }
}

#[cfg(feature = "grpc")]
impl From<BroadcastRequest> for proto::BroadcastRequest {
    fn from(req: BroadcastRequest) -> Self {
        Self {
            clear_all: req.clear_all,
            routing_table: req
                .routing_table
                .into_iter()
                .map(|(k, v)| (k, node_set(v)))
                .collect(),
            running_tasks: req
                .running_tasks
                .into_iter()
                .map(|(k, v)| (k, node_set(v)))
                .collect(),
        }
    }
}

#[cfg(feature = "grpc")]
impl From<proto::BroadcastRequest> for BroadcastRequest {
    fn from(req: proto::BroadcastRequest) -> Self {
        Self {
            clear_all: req.clear_all,
            routing_table: req
                .routing_table
                .into_iter()
                .map(|(k, v)| (k, v.node_ids.into_iter().collect()))
                .collect(),
            running_tasks: req
                .running_tasks
                .into_iter()
                .map(|(k, v)| (k, v.node_ids.into_iter().collect()))
                .collect(),
        }
    }
}

#[cfg(feature = "grpc")]
impl From<BroadcastResponse> for proto::BroadcastResponse {
    fn from(resp: BroadcastResponse) -> Self {
        Self {
            node_id: resp.node_id,
            routing_version: resp.routing_version,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<proto::BroadcastResponse> for BroadcastResponse {
    fn from(resp: proto::BroadcastResponse) -> Self {
        Self {
            node_id: resp.node_id,
            routing_version: resp.routing_version,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<LoadRequest> for proto::LoadRequest {
    fn from(req: LoadRequest) -> Self {
        Self {
            model_id: req.model_id,
            model_source_ref: req.model_source_ref,
            task_id: req.task_id,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<proto::LoadRequest> for LoadRequest {
    fn from(req: proto::LoadRequest) -> Self {
        Self {
            model_id: req.model_id,
            model_source_ref: req.model_source_ref,
            task_id: req.task_id,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<LoadResponse> for proto::LoadResponse {
    fn from(resp: LoadResponse) -> Self {
        Self {
            node_id: resp.node_id,
            status: resp.status.as_str().to_string(),
            error_message: resp.error_message.unwrap_or_default(),
        }
    }
}

#[cfg(feature = "grpc")]
impl TryFrom<proto::LoadResponse> for LoadResponse {
    type Error = SyncError;

    fn try_from(resp: proto::LoadResponse) -> Result<Self> {
        Ok(Self {
            node_id: resp.node_id,
            status: resp.status.parse()?,
            error_message: if resp.error_message.is_empty() {
                None
            } else {
                Some(resp.error_message)
            },
        })
    }
}

#[cfg(feature = "grpc")]
impl From<UnloadRequest> for proto::UnloadRequest {
    fn from(req: UnloadRequest) -> Self {
        Self {
            model_ids: req.model_ids,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<proto::UnloadRequest> for UnloadRequest {
    fn from(req: proto::UnloadRequest) -> Self {
        Self {
            model_ids: req.model_ids,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<UnloadResponse> for proto::UnloadResponse {
    fn from(resp: UnloadResponse) -> Self {
        Self {
            node_id: resp.node_id,
            per_model_status: resp
                .per_model_status
                .into_iter()
                .map(|(k, v)| (k, v.as_str().to_string()))
                .collect(),
        }
    }
}

#[cfg(feature = "grpc")]
impl TryFrom<proto::UnloadResponse> for UnloadResponse {
    type Error = SyncError;

    fn try_from(resp: proto::UnloadResponse) -> Result<Self> {
        let per_model_status = resp
            .per_model_status
            .into_iter()
            .map(|(k, v)| Ok((k, v.parse()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            node_id: resp.node_id,
            per_model_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ModelLoadStatus; 5] = [
        ModelLoadStatus::Loading,
        ModelLoadStatus::Loaded,
        ModelLoadStatus::Unloading,
        ModelLoadStatus::NotFound,
        ModelLoadStatus::Failed,
    ];

    #[test]
    fn test_allowed_transitions() {
        let allowed: Vec<_> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (ModelLoadStatus::Loading, ModelLoadStatus::Loaded),
                (ModelLoadStatus::Loading, ModelLoadStatus::Failed),
                (ModelLoadStatus::Loaded, ModelLoadStatus::Unloading),
                (ModelLoadStatus::Unloading, ModelLoadStatus::NotFound),
            ]
        );
    }

    #[test]
    fn test_status_strings() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<ModelLoadStatus>().unwrap(), status);
        }
        assert_eq!(ModelLoadStatus::NotFound.to_string(), "not_found");
        assert!("LOADED".parse::<ModelLoadStatus>().is_err());
    }

    #[test]
    fn test_unload_status_released() {
        assert!(UnloadStatus::Unloaded.is_released());
        assert!(UnloadStatus::NotFound.is_released());
        assert!(!UnloadStatus::Unloading.is_released());
        assert!(!UnloadStatus::Failed.is_released());
    }

    #[test]
    fn test_snapshot_loaded_models() {
        let mut snapshot = NodeSnapshot {
            node_id: "node-a".to_string(),
            ..Default::default()
        };
        snapshot
            .model_statuses
            .insert("m1".to_string(), ModelLoadStatus::Loaded);
        snapshot
            .model_statuses
            .insert("m2".to_string(), ModelLoadStatus::Loading);
        snapshot
            .model_statuses
            .insert("m3".to_string(), ModelLoadStatus::Loaded);

        let loaded: Vec<_> = snapshot.loaded_models().cloned().collect();
        assert_eq!(loaded, vec!["m1".to_string(), "m3".to_string()]);

        let response = SyncResponse::from(snapshot.clone());
        assert_eq!(NodeSnapshot::from(response), snapshot);
    }

    #[test]
    fn test_unexpected_response_kind() {
        let response = NodeResponse::Unload(UnloadResponse::default());
        let err = response.into_sync("node-a").unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedResponse { .. }));
    }
}
