use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::engine::state_machine::StateLabel;
use crate::engine::types::{CalcState, JobInfo, JobState, Value};
use crate::error::EngineError;
use crate::records::{CalcRecord, Link, LinkType, RecordId, RecordStore};

/// In-memory record store. Ids start at 1 and are never reused.
pub struct MemoryRecordStore {
    records: Mutex<HashMap<RecordId, CalcRecord>>,
    next_id: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RecordId, CalcRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn modify(&self, id: RecordId, apply: impl FnOnce(&mut CalcRecord)) -> Result<()> {
        let mut records = self.lock();
        let record = records
            .get_mut(&id)
            .ok_or(EngineError::RecordNotFound(id))?;
        if record.sealed {
            return Err(EngineError::ModificationNotAllowed(id).into());
        }
        apply(record);
        record.modified = Utc::now();
        Ok(())
    }

    fn read<T>(&self, id: RecordId, view: impl FnOnce(&CalcRecord) -> T) -> Result<T> {
        let records = self.lock();
        let record = records.get(&id).ok_or(EngineError::RecordNotFound(id))?;
        Ok(view(record))
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, process_type: &str) -> Result<RecordId> {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, CalcRecord::new(id, process_type));
        Ok(id)
    }

    async fn get(&self, id: RecordId) -> Result<CalcRecord> {
        self.read(id, |r| r.clone())
    }

    async fn set_state(&self, id: RecordId, state: CalcState) -> Result<()> {
        self.modify(id, |r| r.calc_state = state)
    }

    async fn set_process_state(&self, id: RecordId, state: StateLabel) -> Result<()> {
        self.modify(id, |r| r.process_state = Some(state))
    }

    async fn set_job_id(&self, id: RecordId, job_id: &str) -> Result<()> {
        self.modify(id, |r| r.job_id = Some(job_id.to_string()))
    }

    async fn job_id(&self, id: RecordId) -> Result<Option<String>> {
        self.read(id, |r| r.job_id.clone())
    }

    async fn set_scheduler_state(&self, id: RecordId, state: JobState) -> Result<()> {
        self.modify(id, |r| r.scheduler_state = Some(state))
    }

    async fn last_job_info(&self, id: RecordId) -> Result<Option<JobInfo>> {
        self.read(id, |r| r.last_job_info.clone())
    }

    async fn set_last_job_info(&self, id: RecordId, info: &JobInfo) -> Result<()> {
        self.modify(id, |r| {
            r.scheduler_state = Some(info.job_state);
            r.last_job_info = Some(info.clone());
        })
    }

    async fn set_detailed_job_info(&self, id: RecordId, text: &str) -> Result<()> {
        self.modify(id, |r| r.detailed_job_info = Some(text.to_string()))
    }

    async fn set_attribute(
        &self,
        id: RecordId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.modify(id, |r| {
            r.attributes.insert(key.to_string(), value);
        })
    }

    async fn add_input(&self, id: RecordId, label: &str, value: &Value) -> Result<()> {
        self.modify(id, |r| {
            r.inputs.insert(label.to_string(), value.clone());
        })
    }

    async fn add_output(&self, id: RecordId, label: &str, value: &Value) -> Result<()> {
        self.modify(id, |r| {
            r.outputs.insert(label.to_string(), value.clone());
        })
    }

    async fn add_link_from(
        &self,
        id: RecordId,
        from: RecordId,
        link_type: LinkType,
        label: &str,
    ) -> Result<()> {
        if !self.lock().contains_key(&from) {
            return Err(EngineError::RecordNotFound(from).into());
        }
        self.modify(id, |r| {
            r.links_in.push(Link {
                from,
                link_type,
                label: label.to_string(),
            })
        })
    }

    async fn seal(&self, id: RecordId) -> Result<()> {
        self.modify(id, |r| r.sealed = true)
    }
}
