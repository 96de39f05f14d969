//! Node configuration.
//!
//! Read from a JSON file; every field has a default so an empty object is a
//! valid configuration. Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::PreviousHash;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
    /// Directory of the on-disk block log. In-memory only when unset.
    pub data_dir: Option<PathBuf>,
    /// Peers registered at startup.
    pub peers: Vec<String>,
    pub consensus: ConsensusConfig,
    pub genesis: GenesisConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".to_string(),
            data_dir: None,
            peers: Vec::new(),
            consensus: ConsensusConfig::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Bound on fetching a single peer's chain.
    pub peer_timeout_ms: u64,
    /// Bound on a whole resolution round across all peers.
    pub resolve_deadline_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: 5_000,
            resolve_deadline_ms: 15_000,
        }
    }
}

impl ConsensusConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn resolve_deadline(&self) -> Duration {
        Duration::from_millis(self.resolve_deadline_ms)
    }
}

/// Parameters of the first block. Every node of a network must agree on them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub proof: u64,
    pub previous_hash: PreviousHash,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            proof: 100,
            previous_hash: PreviousHash::GENESIS,
        }
    }
}
