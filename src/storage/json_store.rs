use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::engine::registry::Pid;
use crate::storage::{Checkpoint, CheckpointArea, CheckpointStore};

/// File-based checkpoint store: `<base>/<area>/<pid>.json`.
pub struct JsonCheckpointStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonCheckpointStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn area_dir(&self, area: CheckpointArea) -> PathBuf {
        self.base_dir.join(area.dir_name())
    }

    fn checkpoint_path(&self, area: CheckpointArea, pid: Pid) -> PathBuf {
        self.area_dir(area).join(format!("{}.json", pid))
    }

    async fn read_checkpoint(&self, path: &Path) -> Result<Checkpoint> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read checkpoint file: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        Ok(checkpoint)
    }

    async fn write_checkpoint(&self, area: CheckpointArea, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(self.area_dir(area)).await?;
        let path = self.checkpoint_path(area, checkpoint.pid);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, area: CheckpointArea, checkpoint: &Checkpoint) -> Result<()> {
        let _lock = self.lock.write().await;
        self.write_checkpoint(area, checkpoint).await
    }

    async fn load(&self, area: CheckpointArea, pid: Pid) -> Result<Option<Checkpoint>> {
        let _lock = self.lock.read().await;
        let path = self.checkpoint_path(area, pid);
        if !path.exists() {
            return Ok(None);
        }
        self.read_checkpoint(&path).await.map(Some)
    }

    async fn move_to(&self, pid: Pid, to: CheckpointArea) -> Result<()> {
        let _lock = self.lock.write().await;
        let from = self.checkpoint_path(CheckpointArea::Running, pid);
        if to == CheckpointArea::Running {
            return Ok(());
        }
        tokio::fs::create_dir_all(self.area_dir(to)).await?;
        let dest = self.checkpoint_path(to, pid);
        tokio::fs::rename(&from, &dest)
            .await
            .with_context(|| format!("Failed to move checkpoint {} to {}", pid, to))?;
        Ok(())
    }

    async fn load_all(&self, area: CheckpointArea) -> Result<Vec<Checkpoint>> {
        let _lock = self.lock.read().await;

        let dir = self.area_dir(area);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_checkpoint(&path).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "Skipping unreadable checkpoint"),
            }
        }

        checkpoints.sort_by_key(|c| c.pid);
        Ok(checkpoints)
    }

    async fn delete(&self, area: CheckpointArea, pid: Pid) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.checkpoint_path(area, pid);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
