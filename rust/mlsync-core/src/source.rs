// rust/mlsync-core/src/source.rs

//! Model artifact sources.
//!
//! A load request names its artifact with a source reference: either a URL
//! accepted by the trusted-URL pattern or a path relative to the node's
//! artifact directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;

use crate::config::ModelsConfig;
use crate::error::{Result, SyncError};

/// Fetches model bytes for a source reference.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn fetch(&self, source_ref: &str) -> Result<Bytes>;
}

/// Decides which source references may be loaded at all.
#[derive(Debug, Clone)]
pub struct TrustedSources {
    pattern: Regex,
}

impl TrustedSources {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| SyncError::config_with_source("invalid trusted url regex", e))?;
        Ok(Self { pattern })
    }

    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        Self::new(&config.trusted_url_regex)
    }

    pub fn is_trusted(&self, source_ref: &str) -> bool {
        if source_ref.contains("://") {
            return self.pattern.is_match(source_ref);
        }
        is_relative_artifact(source_ref)
    }

    pub fn check(&self, source_ref: &str) -> Result<()> {
        if self.is_trusted(source_ref) {
            Ok(())
        } else {
            Err(SyncError::untrusted_source(source_ref))
        }
    }
}

/// Relative, non-empty, and unable to climb out of the artifact directory.
fn is_relative_artifact(source_ref: &str) -> bool {
    let path = Path::new(source_ref);
    !source_ref.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Reads artifacts from the local filesystem.
///
/// Relative references resolve under `artifact_dir`; `file://` URLs are read
/// as absolute paths. Remote schemes pass the trust check but cannot be
/// fetched by this source.
#[derive(Debug, Clone)]
pub struct LocalModelSource {
    artifact_dir: PathBuf,
    trusted: TrustedSources,
}

impl LocalModelSource {
    pub fn new(artifact_dir: impl Into<PathBuf>, trusted: TrustedSources) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            trusted,
        }
    }

    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        Ok(Self::new(
            config.artifact_dir.clone(),
            TrustedSources::from_config(config)?,
        ))
    }

    fn resolve(&self, source_ref: &str) -> Result<PathBuf> {
        if let Some(path) = source_ref.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if source_ref.contains("://") {
            return Err(SyncError::model_source(
                source_ref,
                "remote artifacts are not supported by the local source",
            ));
        }
        Ok(self.artifact_dir.join(source_ref))
    }
}

#[async_trait]
impl ModelSource for LocalModelSource {
    async fn fetch(&self, source_ref: &str) -> Result<Bytes> {
        self.trusted.check(source_ref)?;
        let path = self.resolve(source_ref)?;

        let data = tokio::fs::read(&path).await.map_err(|e| {
            SyncError::model_source_with_source(
                source_ref,
                format!("failed to read {}", path.display()),
                e,
            )
        })?;

        tracing::debug!(source_ref, size = data.len(), "Fetched model artifact");
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TRUSTED_URL_REGEX;
    use tempfile::TempDir;

    fn trusted() -> TrustedSources {
        TrustedSources::new(DEFAULT_TRUSTED_URL_REGEX).unwrap()
    }

    #[test]
    fn test_trusted_urls() {
        let trusted = trusted();
        assert!(trusted.is_trusted("https://artifacts.example.com/m1.bin"));
        assert!(trusted.is_trusted("file:///var/models/m1.bin"));
        assert!(trusted.is_trusted("ftp://mirror/m1.bin"));
        assert!(!trusted.is_trusted("s3://bucket/m1.bin"));
        assert!(!trusted.is_trusted("javascript://alert(1)"));
    }

    #[test]
    fn test_relative_paths() {
        let trusted = trusted();
        assert!(trusted.is_trusted("m1.bin"));
        assert!(trusted.is_trusted("./nested/m1.bin"));
        assert!(!trusted.is_trusted("../escape.bin"));
        assert!(!trusted.is_trusted("/etc/passwd"));
        assert!(!trusted.is_trusted(""));

        let err = trusted.check("../escape.bin").unwrap_err();
        assert!(matches!(err, SyncError::UntrustedSource { .. }));
    }

    #[tokio::test]
    async fn test_fetch_relative_and_file_url() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("m1.bin"), b"weights").unwrap();
        let source = LocalModelSource::new(dir.path(), trusted());

        let bytes = source.fetch("m1.bin").await.unwrap();
        assert_eq!(&bytes[..], b"weights");

        let url = format!("file://{}", dir.path().join("m1.bin").display());
        let bytes = source.fetch(&url).await.unwrap();
        assert_eq!(&bytes[..], b"weights");
    }

    #[tokio::test]
    async fn test_fetch_errors() {
        let dir = TempDir::new().unwrap();
        let source = LocalModelSource::new(dir.path(), trusted());

        let err = source.fetch("missing.bin").await.unwrap_err();
        assert!(matches!(err, SyncError::ModelSource { .. }));

        let err = source.fetch("https://example.com/m1.bin").await.unwrap_err();
        assert!(matches!(err, SyncError::ModelSource { .. }));

        let err = source.fetch("s3://bucket/m1").await.unwrap_err();
        assert!(matches!(err, SyncError::UntrustedSource { .. }));
    }
}
