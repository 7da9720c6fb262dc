pub mod job;
pub mod process;
pub mod registry;
pub mod spec;
pub mod state_machine;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::engine::process::{Process, ProcessOutcome};
use crate::engine::registry::{CallContext, Pid, ProcessRegistry};
use crate::engine::spec::ProcessSpec;
use crate::engine::state_machine::{ProcessState, StateLabel, WaitCommand};
use crate::engine::types::{CalcState, Context, Inputs, Outputs};
use crate::error::EngineError;
use crate::records::{RecordId, RecordStore};
use crate::storage::{CheckpointArea, CheckpointStore};
use crate::transport::queue::TransportQueue;
use crate::transport::{AuthInfo, Computer};

/// Runtime settings of an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wait before each scheduler query.
    pub poll_interval: Duration,
    /// How long an unused transport session is kept open.
    pub transport_idle: Duration,
    /// Local directory for holding areas of retrieved files.
    pub work_dir: PathBuf,
    /// Credential job processes use to reach their computer.
    pub default_user: String,
    /// Keep terminal checkpoints in the finished/failed areas.
    pub archive_checkpoints: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            transport_idle: Duration::from_secs(5),
            work_dir: std::env::temp_dir().join("jobflow"),
            default_user: std::env::var("USER").unwrap_or_else(|_| "jobflow".to_string()),
            archive_checkpoints: true,
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<ProcessRegistry>,
    queue: Arc<TransportQueue>,
    records: Arc<dyn RecordStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    specs: RwLock<HashMap<String, Arc<ProcessSpec>>>,
    computers: RwLock<HashMap<String, Arc<Computer>>>,
    auth: RwLock<HashSet<AuthInfo>>,
    tracker: TaskTracker,
}

/// The engine context every process and task runs against.
///
/// Cloning is cheap; all clones share the same registry, queue and stores.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        records: Arc<dyn RecordStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let queue = Arc::new(TransportQueue::new(config.transport_idle));
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: Arc::new(ProcessRegistry::new()),
                queue,
                records,
                checkpoints,
                specs: RwLock::new(HashMap::new()),
                computers: RwLock::new(HashMap::new()),
                auth: RwLock::new(HashSet::new()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.inner.registry
    }

    pub fn queue(&self) -> &Arc<TransportQueue> {
        &self.inner.queue
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.inner.records
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.checkpoints
    }

    // ===== Definitions =====

    /// Register a spec under its name, replacing any previous one.
    pub fn register_spec(&self, spec: ProcessSpec) -> Arc<ProcessSpec> {
        let spec = Arc::new(spec);
        self.inner
            .specs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.name().to_string(), spec.clone());
        spec
    }

    pub fn spec(&self, name: &str) -> Result<Arc<ProcessSpec>, EngineError> {
        self.inner
            .specs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSpec(name.to_string()))
    }

    pub fn add_computer(&self, computer: Computer) -> Arc<Computer> {
        let computer = Arc::new(computer);
        self.inner
            .computers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(computer.name.clone(), computer.clone());
        computer
    }

    pub fn computer(&self, name: &str) -> Result<Arc<Computer>, EngineError> {
        self.inner
            .computers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownComputer(name.to_string()))
    }

    /// Allow `user` to open sessions to `computer`.
    pub fn authorize(&self, user: &str, computer: &str) -> Result<AuthInfo, EngineError> {
        self.computer(computer)?;
        let auth = AuthInfo::new(user, computer);
        self.inner
            .auth
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(auth.clone());
        Ok(auth)
    }

    pub fn auth_info(&self, computer: &str, user: &str) -> Result<AuthInfo, EngineError> {
        let auth = AuthInfo::new(user, computer);
        if self
            .inner
            .auth
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&auth)
        {
            Ok(auth)
        } else {
            Err(EngineError::NotConfigured {
                user: user.to_string(),
                computer: computer.to_string(),
            })
        }
    }

    // ===== Running processes =====

    /// Create a top-level process. Inputs and job options are validated
    /// here.
    pub async fn create(&self, spec: &str, inputs: Inputs) -> Result<Process> {
        let spec = self.spec(spec)?;
        Process::create(self, spec, inputs, None).await
    }

    /// Create and run a process to completion on a fresh call context.
    pub async fn run(&self, spec: &str, inputs: Inputs) -> Result<ProcessOutcome> {
        let process = self.create(spec, inputs).await?;
        Ok(process.run(CallContext::new()).await)
    }

    /// Create a process and run it in the background.
    pub async fn submit(&self, spec: &str, inputs: Inputs) -> Result<ProcessHandle> {
        let process = self.create(spec, inputs).await?;
        Ok(self.spawn(process))
    }

    /// Run `process` in the background on a fresh call context.
    ///
    /// The process is registered before this returns, so a child spawned by
    /// a step is bound to its parent even if the parent ends first.
    pub fn spawn(&self, process: Process) -> ProcessHandle {
        let pid = process.pid();
        let cancel = process.cancel_token();
        let registration = process.register(CallContext::new());
        let join = self.inner.tracker.spawn(async move {
            match registration {
                Ok(registration) => process.drive(registration).await,
                Err(e) => process.reject(e).await,
            }
        });
        ProcessHandle { pid, cancel, join }
    }

    /// Resume every root process found in the running area at the state
    /// it was checkpointed in.
    pub async fn resume_all(&self) -> Result<Vec<ProcessHandle>> {
        let store = self.checkpoints();
        let mut handles = Vec::new();

        for checkpoint in store.load_all(CheckpointArea::Running).await? {
            let pid = checkpoint.pid;
            if checkpoint.parent.is_some() {
                // The parent re-enters the step that created this child.
                info!(pid = %pid, "Dropping checkpoint of child process");
                store.delete(CheckpointArea::Running, pid).await?;
                continue;
            }
            if checkpoint.state.is_terminal() {
                let area = match checkpoint.state {
                    ProcessState::Finished => CheckpointArea::Finished,
                    _ => CheckpointArea::Failed,
                };
                store.move_to(pid, area).await?;
                continue;
            }
            if self.registry().is_running(pid) {
                continue;
            }
            match self.records().get(pid.into()).await {
                Ok(record) if record.sealed => {
                    // Terminated but stopped before filing the checkpoint.
                    let area = match record.process_state {
                        Some(StateLabel::Finished) => CheckpointArea::Finished,
                        _ => CheckpointArea::Failed,
                    };
                    info!(pid = %pid, area = %area, "Filing checkpoint of sealed process");
                    store.move_to(pid, area).await?;
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(pid = %pid, error = %format!("{:#}", e), "Could not load record of checkpointed process"),
            }

            let process = Process::from_checkpoint(self, checkpoint)
                .with_context(|| format!("Failed to restore process {}", pid))?;
            info!(pid = %pid, state = %process.state().label(), "Resuming process");
            handles.push(self.spawn(process));
        }
        Ok(handles)
    }

    /// Pick a job process up again from its durable record alone.
    pub async fn continue_job(
        &self,
        spec: &str,
        record: RecordId,
        inputs: Inputs,
    ) -> Result<ProcessHandle> {
        let spec = self.spec(spec)?;
        if !spec.is_job() {
            bail!("process '{}' is not a job", spec.name());
        }
        let calc = self.records().get(record).await?;
        if calc.sealed {
            bail!(EngineError::ModificationNotAllowed(record));
        }

        let state = match calc.calc_state {
            CalcState::New => ProcessState::Created,
            CalcState::ToSubmit | CalcState::Submitting if calc.job_id.is_some() => {
                ProcessState::waiting(WaitCommand::UpdateScheduler, None)
            }
            CalcState::ToSubmit | CalcState::Submitting => {
                ProcessState::waiting(WaitCommand::Submit, None)
            }
            CalcState::WithScheduler => ProcessState::waiting(WaitCommand::UpdateScheduler, None),
            CalcState::Computed | CalcState::Retrieving | CalcState::Parsing => {
                ProcessState::waiting(WaitCommand::Retrieve, None)
            }
            other => bail!("cannot continue job {} in state {}", record, other),
        };

        info!(pid = %record, calc_state = %calc.calc_state, "Continuing job from its record");
        let process = Process::restore(
            self,
            spec,
            Pid::from(record),
            state,
            inputs,
            Context::new(),
            Outputs::new(),
            None,
        )?;
        Ok(self.spawn(process))
    }

    pub fn cancel(&self, pid: Pid) -> bool {
        self.registry().cancel(pid)
    }

    pub fn cancel_all(&self) {
        self.registry().cancel_all();
    }

    /// Wait for spawned processes, close sessions and check nothing is left
    /// registered.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.queue().close_all().await;

        let left = self.registry().len();
        if left > 0 {
            warn!(count = left, "Processes still registered at shutdown");
            bail!(EngineError::NotDrained(left));
        }
        info!("Engine stopped");
        Ok(())
    }
}

/// Handle to a process running in the background.
pub struct ProcessHandle {
    pid: Pid,
    cancel: CancellationToken,
    join: JoinHandle<ProcessOutcome>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drop the process future without letting it reach a terminal state.
    /// Its last checkpoint stays in the running area, as after a crash.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> ProcessOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => ProcessOutcome::Cancelled(Some("aborted".to_string())),
            Err(e) => ProcessOutcome::Failed(anyhow::anyhow!("process {} panicked: {}", self.pid, e)),
        }
    }
}
