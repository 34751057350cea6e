// rust/mlsync-core/src/error.rs

use std::fmt;

use thiserror::Error;

/// A request to a single node that could not be completed.
///
/// Transport failures are always scoped to one node. They are collected into
/// aggregate results during fan-out and never abort sibling branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub node_id: String,
    pub reason: String,
    pub timed_out: bool,
}

impl TransportFailure {
    pub fn new(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            reason: reason.into(),
            timed_out: false,
        }
    }

    pub fn timeout(node_id: impl Into<String>, after_ms: u64) -> Self {
        Self {
            node_id: node_id.into(),
            reason: format!("no response within {}ms", after_ms),
            timed_out: true,
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node '{}' unreachable: {}", self.node_id, self.reason)
    }
}

impl std::error::Error for TransportFailure {}

#[derive(Error, Debug)]
pub enum SyncError {

    #[error("Transport error: {0}")]
    Transport(TransportFailure),

    #[error("Model '{model_id}' already has a {status} lifecycle on this node")]
    AlreadyLoading {
        model_id: String,
        status: String,
    },

    #[error("Model '{model_id}' is not loaded")]
    NotLoaded {
        model_id: String,
    },

    #[error("Model '{model_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        model_id: String,
        from: String,
        to: String,
    },

    #[error("Engine error for model '{model_id}': {message}")]
    Engine {
        model_id: String,
        message: String,
    },

    #[error("No eligible node to dispatch {what}")]
    NoEligibleNode {
        what: String,
    },

    #[error("Model source '{source_ref}' is not trusted")]
    UntrustedSource {
        source_ref: String,
    },

    #[error("Model source '{source_ref}' error: {message}")]
    ModelSource {
        source_ref: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        task_id: String,
    },

    #[error("Task '{task_id}' already exists")]
    DuplicateTask {
        task_id: String,
    },

    #[error("Unexpected response from node '{node_id}': expected {expected}")]
    UnexpectedResponse {
        node_id: String,
        expected: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<TransportFailure> for SyncError {
    fn from(failure: TransportFailure) -> Self {
        Self::Transport(failure)
    }
}

// Convenience constructors
impl SyncError {

    pub fn already_loading(model_id: impl Into<String>, status: impl fmt::Display) -> Self {
        Self::AlreadyLoading {
            model_id: model_id.into(),
            status: status.to_string(),
        }
    }

    pub fn not_loaded(model_id: impl Into<String>) -> Self {
        Self::NotLoaded {
            model_id: model_id.into(),
        }
    }

    pub fn invalid_transition(
        model_id: impl Into<String>,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            model_id: model_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn engine(model_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            model_id: model_id.into(),
            message: message.into(),
        }
    }

    pub fn no_eligible_node(what: impl Into<String>) -> Self {
        Self::NoEligibleNode { what: what.into() }
    }

    pub fn untrusted_source(source_ref: impl Into<String>) -> Self {
        Self::UntrustedSource {
            source_ref: source_ref.into(),
        }
    }

    pub fn model_source(source_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelSource {
            source_ref: source_ref.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn model_source_with_source(
        source_ref: impl Into<String>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::ModelSource {
            source_ref: source_ref.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    pub fn duplicate_task(task_id: impl Into<String>) -> Self {
        Self::DuplicateTask {
            task_id: task_id.into(),
        }
    }

    pub fn unexpected_response(node_id: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            node_id: node_id.into(),
            expected: expected.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
