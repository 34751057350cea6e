// rust/mlsync-core/src/lib.rs

//! mlsync - Core Library
//!
//! This crate keeps every node of a model-serving cluster agreeing on which
//! models are loaded where and which load tasks are still running. It
//! provides the per-node model registry, the periodic gather/reconcile/
//! broadcast loop, cluster-wide load and unload actions, and task dispatch.
//!
//! Membership, transport, model bytes and the execution engine are consumed
//! through traits; the crate ships small implementations of each so that a
//! cluster can run in-process or over gRPC (`grpc` feature).

pub mod config;
pub mod error;
pub mod protocol;

// Re-export commonly used types for convenience
pub use config::{DispatchPolicyKind, MlSyncConfig};
pub use error::{Result, SyncError, TransportFailure};
pub use protocol::{
    BroadcastRequest, BroadcastResponse, LoadRequest, LoadResponse, ModelId, ModelLoadStatus,
    NodeId, NodeRequest, NodeResponse, NodeSnapshot, RoutingTable, RunningTaskIndex, SyncRequest,
    SyncResponse, TaskId, UnloadRequest, UnloadResponse, UnloadStatus,
};

pub mod directory;
pub mod engine;
pub mod source;
pub use directory::{NodeDirectory, StaticDirectory};
pub use engine::{EngineError, InMemoryEngine, ModelEngine};
pub use source::{LocalModelSource, ModelSource, TrustedSources};

pub mod registry;
pub use registry::{LoadOutcome, NodeModelRegistry};

pub mod transport;
pub use transport::{FanOut, LocalTransport, Transport};

pub mod handler;
pub mod stats;
pub mod view;
pub use handler::{NodeHandler, RequestHandler};
pub use stats::{NodeStats, StatsSnapshot};
pub use view::{ClusterView, RoutingSnapshot};

pub mod reconcile;
pub mod sync;
pub use reconcile::{reconcile, Reconciled};
pub use sync::{CycleReport, SyncCoordinator, SyncPhase};

pub mod lifecycle;
pub use lifecycle::{
    aggregate_unload, ClusterLoadResponse, ClusterUnloadResponse, ClusterUnloadStatus,
    ModelLifecycleAction,
};

pub mod dispatch;
pub mod tasks;
pub use dispatch::{
    policy_from_config, DispatchOutcome, DispatchPolicy, FewestRunningTasks, Pinned, RoundRobin,
    TaskDispatcher,
};
pub use tasks::{TaskManager, TaskRecord, TaskState};

/// Generated protobuf types and gRPC stubs for the node service.
#[cfg(feature = "grpc")]
pub mod rpc {
    pub mod proto {
        tonic::include_proto!("mlsync.node");
    }
}

#[cfg(feature = "grpc")]
pub use transport::GrpcTransport;
