//! The durable record: the system of record a process reports into.
//!
//! A record outlives the in-memory process. While the process runs it is the
//! only writer; once the process reaches a terminal state the record is
//! sealed and handed back to the store.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::state_machine::StateLabel;
use crate::engine::types::{CalcState, JobInfo, JobState, Value};

/// Identifier assigned by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// A parent process called this one.
    Call,
    /// An input value was consumed by this one.
    Input,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub from: RecordId,
    pub link_type: LinkType,
    pub label: String,
}

/// Everything an external observer can see about a process after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalcRecord {
    pub id: RecordId,
    pub process_type: String,
    pub calc_state: CalcState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_state: Option<StateLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_state: Option<JobState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_job_info: Option<JobInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_job_info: Option<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub links_in: Vec<Link>,
    pub sealed: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl CalcRecord {
    pub fn new(id: RecordId, process_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            process_type: process_type.to_string(),
            calc_state: CalcState::New,
            process_state: None,
            job_id: None,
            scheduler_state: None,
            last_job_info: None,
            detailed_job_info: None,
            attributes: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            links_in: Vec::new(),
            sealed: false,
            created: now,
            modified: now,
        }
    }
}

/// Store of durable records. Mutations on a sealed record fail with
/// [`EngineError::ModificationNotAllowed`](crate::EngineError::ModificationNotAllowed).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a fresh record in the NEW state.
    async fn create(&self, process_type: &str) -> Result<RecordId>;

    /// Snapshot of a record.
    async fn get(&self, id: RecordId) -> Result<CalcRecord>;

    async fn set_state(&self, id: RecordId, state: CalcState) -> Result<()>;

    async fn set_process_state(&self, id: RecordId, state: StateLabel) -> Result<()>;

    async fn set_job_id(&self, id: RecordId, job_id: &str) -> Result<()>;

    async fn job_id(&self, id: RecordId) -> Result<Option<String>>;

    async fn set_scheduler_state(&self, id: RecordId, state: JobState) -> Result<()>;

    async fn last_job_info(&self, id: RecordId) -> Result<Option<JobInfo>>;

    /// Store a new scheduler snapshot; also updates the scheduler state.
    async fn set_last_job_info(&self, id: RecordId, info: &JobInfo) -> Result<()>;

    async fn set_detailed_job_info(&self, id: RecordId, text: &str) -> Result<()>;

    async fn set_attribute(&self, id: RecordId, key: &str, value: serde_json::Value)
    -> Result<()>;

    async fn add_input(&self, id: RecordId, label: &str, value: &Value) -> Result<()>;

    async fn add_output(&self, id: RecordId, label: &str, value: &Value) -> Result<()>;

    async fn add_link_from(
        &self,
        id: RecordId,
        from: RecordId,
        link_type: LinkType,
        label: &str,
    ) -> Result<()>;

    /// Make the record immutable.
    async fn seal(&self, id: RecordId) -> Result<()>;
}
