// rust/mlsync-core/src/config.rs

//! Configuration management for mlsync nodes.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// Default pattern a model source reference must match when it is a URL.
pub const DEFAULT_TRUSTED_URL_REGEX: &str =
    "^(https?|ftp|file)://[-a-zA-Z0-9+&@#/%?=~_|!:,.;]*[-a-zA-Z0-9+&@#/%=~_|]";

// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MlSyncConfig {
    pub node: NodeConfig,
    pub sync: SyncConfig,
    pub dispatch: DispatchConfig,
    pub models: ModelsConfig,
}

/// Identity of this node and the static view of its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier of this node within the cluster.
    pub node_id: String,
    /// Address the node service listens on.
    pub listen_address: String,
    /// Whether this node may load and serve models.
    pub worker: bool,
    /// Whether this node may run the reconciliation loop. Only the elected
    /// coordinator (see `NodeDirectory::elected_coordinator`) actually runs it.
    pub coordinator: bool,
    /// Other cluster members.
    pub peers: Vec<PeerConfig>,
}

/// A statically configured cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub address: String,
    #[serde(default = "default_true")]
    pub worker: bool,
    #[serde(default)]
    pub coordinator: bool,
}

fn default_true() -> bool {
    true
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    // Interval between reconciliation ticks.
    pub interval_ms: u64,
    // Per-branch timeout for every fan-out.
    pub fan_out_timeout_ms: u64,
    // Connect timeout for remote transports.
    pub connect_timeout_ms: u64,
    // Consecutive cycles a silent node keeps its last snapshot (0 = none).
    pub silent_node_grace_cycles: u32,
}

/// Node selection policy for new load tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicyKind {
    /// Node with the fewest running load tasks; ties go to the lowest id.
    #[default]
    FewestRunningTasks,
    /// Rotate over eligible nodes in id order.
    RoundRobin,
    /// Always the configured `pinned_node`.
    Pinned,
}

impl FromStr for DispatchPolicyKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fewest_running_tasks" => Ok(Self::FewestRunningTasks),
            "round_robin" => Ok(Self::RoundRobin),
            "pinned" => Ok(Self::Pinned),
            other => Err(SyncError::config(format!(
                "unknown dispatch policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub policy: DispatchPolicyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_node: Option<String>,
}

/// Where model artifacts come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    // Base directory relative artifact references resolve against.
    pub artifact_dir: PathBuf,
    // Regex that URL-style source references must match.
    pub trusted_url_regex: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            listen_address: "0.0.0.0:50061".to_string(),
            worker: true,
            coordinator: false,
            peers: Vec::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            fan_out_timeout_ms: 10_000,
            connect_timeout_ms: 2_000,
            silent_node_grace_cycles: 0,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("./models"),
            trusted_url_regex: DEFAULT_TRUSTED_URL_REGEX.to_string(),
        }
    }
}

impl FromStr for MlSyncConfig {
    type Err = SyncError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| SyncError::config_with_source("failed to parse TOML config", e))
    }
}

impl MlSyncConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config_with_source(
                format!("failed to read config file {}", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `MLSYNC_` and use underscores
    // to separate nested fields. For example:
    // - `MLSYNC_NODE_ID` overrides `node.node_id`
    // - `MLSYNC_SYNC_INTERVAL_MS` overrides `sync.interval_ms`
    // - `MLSYNC_DISPATCH_POLICY` overrides `dispatch.policy`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Node overrides
        if let Ok(val) = std::env::var("MLSYNC_NODE_ID") {
            self.node.node_id = val;
        }
        if let Ok(val) = std::env::var("MLSYNC_NODE_LISTEN_ADDRESS") {
            self.node.listen_address = val;
        }
        if let Ok(val) = std::env::var("MLSYNC_NODE_WORKER") {
            if let Ok(v) = val.parse() {
                self.node.worker = v;
            }
        }
        if let Ok(val) = std::env::var("MLSYNC_NODE_COORDINATOR") {
            if let Ok(v) = val.parse() {
                self.node.coordinator = v;
            }
        }

        // Sync overrides
        if let Ok(val) = std::env::var("MLSYNC_SYNC_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.sync.interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("MLSYNC_SYNC_FAN_OUT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.sync.fan_out_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("MLSYNC_SYNC_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.sync.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("MLSYNC_SYNC_SILENT_NODE_GRACE_CYCLES") {
            if let Ok(v) = val.parse() {
                self.sync.silent_node_grace_cycles = v;
            }
        }

        // Dispatch overrides
        if let Ok(val) = std::env::var("MLSYNC_DISPATCH_POLICY") {
            if let Ok(v) = val.parse() {
                self.dispatch.policy = v;
            }
        }
        if let Ok(val) = std::env::var("MLSYNC_DISPATCH_PINNED_NODE") {
            self.dispatch.pinned_node = Some(val);
        }

        // Model overrides
        if let Ok(val) = std::env::var("MLSYNC_MODELS_ARTIFACT_DIR") {
            self.models.artifact_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MLSYNC_MODELS_TRUSTED_URL_REGEX") {
            self.models.trusted_url_regex = val;
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Node validation
        if self.node.node_id.trim().is_empty() {
            return Err(SyncError::config("node.node_id must not be empty"));
        }
        if self.node.listen_address.is_empty() {
            return Err(SyncError::config("node.listen_address must not be empty"));
        }

        let mut seen = HashSet::new();
        seen.insert(self.node.node_id.as_str());
        for peer in &self.node.peers {
            if peer.node_id.trim().is_empty() {
                return Err(SyncError::config("node.peers[].node_id must not be empty"));
            }
            if peer.address.is_empty() {
                return Err(SyncError::config(format!(
                    "peer '{}' must have an address",
                    peer.node_id
                )));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(SyncError::config(format!(
                    "duplicate node id '{}' in node.peers",
                    peer.node_id
                )));
            }
        }

        // Sync validation
        if self.sync.interval_ms == 0 {
            return Err(SyncError::config("sync.interval_ms must be greater than 0"));
        }
        if self.sync.fan_out_timeout_ms == 0 {
            return Err(SyncError::config(
                "sync.fan_out_timeout_ms must be greater than 0",
            ));
        }
        if self.sync.connect_timeout_ms == 0 {
            return Err(SyncError::config(
                "sync.connect_timeout_ms must be greater than 0",
            ));
        }

        // Dispatch validation
        if self.dispatch.policy == DispatchPolicyKind::Pinned {
            match &self.dispatch.pinned_node {
                Some(node) if seen.contains(node.as_str()) => {}
                Some(node) => {
                    return Err(SyncError::config(format!(
                        "dispatch.pinned_node '{}' is not a known node",
                        node
                    )));
                }
                None => {
                    return Err(SyncError::config(
                        "dispatch.pinned_node is required when policy is 'pinned'",
                    ));
                }
            }
        }

        // Model validation
        regex::Regex::new(&self.models.trusted_url_regex).map_err(|e| {
            SyncError::config_with_source("models.trusted_url_regex is not a valid regex", e)
        })?;

        Ok(())
    }
}
