//! Configuration shapes: the raw TOML file and the resolved runtime view.

pub mod spec_file;

use std::path::PathBuf;

use dossier_core::config::{
    BroadcastConfig, DispatchConfig, OrchestratorConfig, PhaseConfig, RetryConfig,
    RuntimeConfig,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Raw configuration as defined in a TOML file. Every section is optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub store: FileStoreConfig,
    #[serde(default)]
    pub log: FileLogConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub phases: PhaseConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStoreConfig {
    /// Records and event journals live here. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Fully resolved configuration after file, `.env` and environment
/// overrides have been applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_dir: Option<PathBuf>,
    pub log_filter: String,
    pub orchestrator: OrchestratorConfig,
    pub metadata: ConfigMetadata,
}

/// Where the resolved configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
    pub overridden: Vec<&'static str>,
}

impl FileConfig {
    /// Template written by `config print-default`: every knob at its
    /// default, with a store directory filled in.
    pub fn template() -> Self {
        Self {
            store: FileStoreConfig {
                dir: Some(PathBuf::from("./dossier-data")),
            },
            log: FileLogConfig {
                filter: Some(DEFAULT_LOG_FILTER.to_string()),
            },
            ..Self::default()
        }
    }

    pub fn into_config(self, metadata: ConfigMetadata) -> Config {
        Config {
            store_dir: self.store.dir,
            log_filter: self
                .log
                .filter
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            orchestrator: OrchestratorConfig {
                dispatch: self.dispatch,
                retry: self.retry,
                phases: self.phases,
                broadcast: self.broadcast,
                runtime: self.runtime,
            },
            metadata,
        }
    }
}
