pub mod json_store;
pub mod memory_store;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::job::CalcInfo;
use crate::engine::registry::Pid;
use crate::engine::state_machine::ProcessState;
use crate::engine::types::{Context, Inputs, Outputs};

/// Where a checkpoint lives. Live processes are in `Running`; terminal ones
/// are moved to `Finished` or `Failed` (cancelled processes go to `Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointArea {
    Running,
    Finished,
    Failed,
}

impl CheckpointArea {
    pub const ALL: [CheckpointArea; 3] = [
        CheckpointArea::Running,
        CheckpointArea::Finished,
        CheckpointArea::Failed,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            CheckpointArea::Running => "running",
            CheckpointArea::Finished => "finished",
            CheckpointArea::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CheckpointArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Resumable snapshot of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pid: Pid,
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Pid>,
    pub state: ProcessState,
    pub inputs: Inputs,
    #[serde(default)]
    pub ctx: Context,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc_info: Option<CalcInfo>,
    pub saved: DateTime<Utc>,
}

/// Trait for checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint under its pid in `area`, replacing any previous one.
    async fn save(&self, area: CheckpointArea, checkpoint: &Checkpoint) -> Result<()>;

    async fn load(&self, area: CheckpointArea, pid: Pid) -> Result<Option<Checkpoint>>;

    /// Move a checkpoint out of the running area.
    async fn move_to(&self, pid: Pid, to: CheckpointArea) -> Result<()>;

    /// Every checkpoint in `area`, ordered by pid.
    async fn load_all(&self, area: CheckpointArea) -> Result<Vec<Checkpoint>>;

    /// Remove a checkpoint. Removing one that does not exist is not an error.
    async fn delete(&self, area: CheckpointArea, pid: Pid) -> Result<()>;
}
