//! Remote execution resources and the adapters that reach them.
//!
//! A [`Transport`] opens stateful sessions to a computer; a [`Scheduler`]
//! speaks the batch system's protocol over such a session. Both are
//! supplied by the embedding application. Access to sessions is arbitrated
//! by the [`queue::TransportQueue`], and work that needs a session is
//! expressed as a [`task::TransportTask`].

pub mod queue;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::job::JobScript;
use crate::engine::types::JobInfo;

/// The (credential, resource) pair a session is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuthInfo {
    pub user: String,
    pub computer: String,
}

impl AuthInfo {
    pub fn new(user: impl Into<String>, computer: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            computer: computer.into(),
        }
    }
}

impl std::fmt::Display for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.computer)
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// One open, authenticated connection to a remote resource.
#[async_trait]
pub trait TransportSession: Send {
    async fn exec_command(&mut self, command: &str) -> Result<CommandOutput>;

    async fn put_file(&mut self, contents: &[u8], remote_path: &str) -> Result<()>;

    async fn get_file(&mut self, remote_path: &str) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions for a credential.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, auth: &AuthInfo) -> Result<Box<dyn TransportSession>>;
}

/// Batch scheduler adapter, driven over an open session.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Whether `get_jobs` may be narrowed to the submitting user.
    fn can_query_by_user(&self) -> bool {
        false
    }

    /// Submit a job script and return the scheduler's job id.
    async fn submit(&self, session: &mut dyn TransportSession, script: &JobScript)
    -> Result<String>;

    /// List the given jobs, keyed by job id. Jobs the scheduler no longer
    /// knows about are simply absent.
    async fn get_jobs(
        &self,
        session: &mut dyn TransportSession,
        job_ids: &[String],
        user: Option<&str>,
    ) -> Result<HashMap<String, JobInfo>>;

    /// Post-mortem accounting text for a finished job. Adapters without
    /// support return [`EngineError::Unsupported`](crate::EngineError::Unsupported).
    async fn get_detailed_job_info(
        &self,
        session: &mut dyn TransportSession,
        job_id: &str,
    ) -> Result<String>;
}

/// A remote resource: how to reach it and how to talk to its scheduler.
#[derive(Clone)]
pub struct Computer {
    pub name: String,
    pub hostname: String,
    /// Base directory under which per-job working directories are created.
    pub work_dir: String,
    pub transport: Arc<dyn Transport>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl Computer {
    pub fn new(
        name: impl Into<String>,
        hostname: impl Into<String>,
        work_dir: impl Into<String>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            work_dir: work_dir.into(),
            transport,
            scheduler,
        }
    }

    /// Remote working directory of the job belonging to `record`.
    pub fn job_dir(&self, record: crate::records::RecordId) -> String {
        format!("{}/{}", self.work_dir.trim_end_matches('/'), record)
    }
}

impl std::fmt::Debug for Computer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computer")
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}
