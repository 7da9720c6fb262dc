use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;

/// Configuration loaded from `jobflow.yaml`.
/// All fields are optional; missing fields fall back to engine defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct JobflowConfig {
    /// Directory of the JSON checkpoint store.
    pub checkpoint_dir: Option<String>,
    /// Local directory for retrieved job files.
    pub work_dir: Option<String>,
    pub poll_interval_s: Option<u64>,
    pub transport_idle_s: Option<u64>,
    pub default_user: Option<String>,
    pub archive_checkpoints: Option<bool>,
}

impl JobflowConfig {
    pub const DEFAULT_FILE: &'static str = "jobflow.yaml";
    pub const DEFAULT_CHECKPOINT_DIR: &'static str = "data/checkpoints";

    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `jobflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new(Self::DEFAULT_FILE);
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: JobflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(
            self.checkpoint_dir
                .as_deref()
                .unwrap_or(Self::DEFAULT_CHECKPOINT_DIR),
        )
    }

    /// Overlay the configured values on the engine defaults.
    pub fn into_engine_config(self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(dir) = self.work_dir {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(secs) = self.poll_interval_s {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.transport_idle_s {
            config.transport_idle = Duration::from_secs(secs);
        }
        if let Some(user) = self.default_user {
            config.default_user = user;
        }
        if let Some(archive) = self.archive_checkpoints {
            config.archive_checkpoints = archive;
        }
        config
    }
}
