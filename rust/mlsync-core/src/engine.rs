// rust/mlsync-core/src/engine.rs

//! Model execution engine boundary.
//!
//! The engine turns artifact bytes into a resident model and releases it
//! again. Inference itself is outside this crate; [`InMemoryEngine`] only
//! tracks which models hold bytes on this node.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use thiserror::Error;

use crate::protocol::ModelId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("model '{model_id}' is not loaded in the engine")]
    NotLoaded { model_id: String },

    #[error("engine failed on model '{model_id}': {message}")]
    Failed { model_id: String, message: String },
}

impl EngineError {
    pub fn failed(model_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            model_id: model_id.into(),
            message: message.into(),
        }
    }
}

/// Loads and releases models on the local node.
#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Make `model_id` resident from its artifact bytes.
    async fn load(&self, model_id: &str, bytes: Bytes) -> Result<(), EngineError>;

    /// Release a resident model.
    ///
    /// Returns [`EngineError::NotLoaded`] if the engine does not hold it.
    async fn unload(&self, model_id: &str) -> Result<(), EngineError>;

    /// Whether the engine currently holds `model_id`.
    fn is_resident(&self, model_id: &str) -> bool;
}

/// Engine that keeps artifact bytes in memory.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    resident: DashMap<ModelId, Bytes>,
    rejected: DashSet<ModelId>,
    stuck: DashSet<ModelId>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent load of `model_id` fail.
    pub fn reject_model(&self, model_id: impl Into<ModelId>) {
        self.rejected.insert(model_id.into());
    }

    /// Make every subsequent unload of `model_id` fail.
    pub fn pin_model(&self, model_id: impl Into<ModelId>) {
        self.stuck.insert(model_id.into());
    }

    pub fn resident_models(&self) -> Vec<ModelId> {
        let mut models: Vec<_> = self.resident.iter().map(|e| e.key().clone()).collect();
        models.sort();
        models
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident.iter().map(|e| e.value().len()).sum()
    }
}

#[async_trait]
impl ModelEngine for InMemoryEngine {
    async fn load(&self, model_id: &str, bytes: Bytes) -> Result<(), EngineError> {
        if self.rejected.contains(model_id) {
            return Err(EngineError::failed(model_id, "model rejected by engine"));
        }
        if bytes.is_empty() {
            return Err(EngineError::failed(model_id, "empty model artifact"));
        }
        tracing::debug!(model_id, size = bytes.len(), "Model resident in engine");
        self.resident.insert(model_id.to_string(), bytes);
        Ok(())
    }

    async fn unload(&self, model_id: &str) -> Result<(), EngineError> {
        if self.stuck.contains(model_id) {
            return Err(EngineError::failed(model_id, "model could not be released"));
        }
        match self.resident.remove(model_id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotLoaded {
                model_id: model_id.to_string(),
            }),
        }
    }

    fn is_resident(&self, model_id: &str) -> bool {
        self.resident.contains_key(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_unload() {
        let engine = InMemoryEngine::new();
        engine.load("m1", Bytes::from_static(b"weights")).await.unwrap();

        assert!(engine.is_resident("m1"));
        assert_eq!(engine.resident_bytes(), 7);

        engine.unload("m1").await.unwrap();
        assert!(!engine.is_resident("m1"));
        assert_eq!(
            engine.unload("m1").await,
            Err(EngineError::NotLoaded {
                model_id: "m1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_rejects_empty_and_rejected() {
        let engine = InMemoryEngine::new();
        assert!(engine.load("m1", Bytes::new()).await.is_err());

        engine.reject_model("m2");
        let err = engine.load("m2", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, EngineError::Failed { .. }));
        assert!(engine.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_pinned_model_cannot_unload() {
        let engine = InMemoryEngine::new();
        engine.load("m1", Bytes::from_static(b"x")).await.unwrap();
        engine.pin_model("m1");

        assert!(engine.unload("m1").await.is_err());
        assert_eq!(engine.resident_models(), vec!["m1".to_string()]);
    }
}
