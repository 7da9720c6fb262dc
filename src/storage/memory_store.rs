use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::engine::registry::Pid;
use crate::storage::{Checkpoint, CheckpointArea, CheckpointStore};

/// In-memory checkpoint store. Survives engine restarts only as long as the
/// store value itself is shared between engines.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    areas: Mutex<HashMap<CheckpointArea, BTreeMap<Pid, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CheckpointArea, BTreeMap<Pid, Checkpoint>>> {
        self.areas.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, area: CheckpointArea, checkpoint: &Checkpoint) -> Result<()> {
        self.lock()
            .entry(area)
            .or_default()
            .insert(checkpoint.pid, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, area: CheckpointArea, pid: Pid) -> Result<Option<Checkpoint>> {
        Ok(self.lock().get(&area).and_then(|a| a.get(&pid)).cloned())
    }

    async fn move_to(&self, pid: Pid, to: CheckpointArea) -> Result<()> {
        if to == CheckpointArea::Running {
            return Ok(());
        }
        let mut areas = self.lock();
        let checkpoint = areas
            .get_mut(&CheckpointArea::Running)
            .and_then(|a| a.remove(&pid))
            .ok_or_else(|| anyhow!("no running checkpoint for process {}", pid))?;
        areas.entry(to).or_default().insert(pid, checkpoint);
        Ok(())
    }

    async fn load_all(&self, area: CheckpointArea) -> Result<Vec<Checkpoint>> {
        Ok(self
            .lock()
            .get(&area)
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, area: CheckpointArea, pid: Pid) -> Result<()> {
        if let Some(a) = self.lock().get_mut(&area) {
            a.remove(&pid);
        }
        Ok(())
    }
}
