//! The remote-job sub-protocol.
//!
//! A job process waits through three commands, each carried out by a
//! transport task:
//!
//! ```text
//! Waiting(Submit) -> Waiting(UpdateScheduler)+ -> Waiting(Retrieve) -> Running(Retrieved)
//! ```
//!
//! Progress is mirrored on the durable record's calc state so a job can be
//! picked up again from the record alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::process::Process;
use crate::engine::spec::OPTIONS_INPUT;
use crate::engine::state_machine::{Continuation, ProcessState, WaitCommand};
use crate::engine::types::{CalcState, Inputs, JobState, Outputs};
use crate::error::EngineError;
use crate::records::{RecordId, RecordStore};
use crate::transport::task::{Task, TaskResolution, TransportTask};
use crate::transport::{Computer, Scheduler, TransportSession};

/// Recorded as detailed job info when the scheduler cannot provide it.
pub const DETAILED_INFO_UNSUPPORTED: &str = "This scheduler does not implement the routine \
     get_detailed_job_info. Job info not available.";

/// User passed to schedulers that can narrow listings by user. Expanded by
/// the remote shell.
const QUERY_USER: &str = "$USER";

const SUBMIT_SCRIPT: &str = "_jobflow_submit.sh";

// ===== Job description =====

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub name: String,
    pub contents: String,
}

/// What `prepare` produces: files to upload, how to run and what to bring back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalcInfo {
    pub command: Vec<String>,
    #[serde(default)]
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub retrieve_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_name: Option<String>,
}

/// The options bundle accepted by job processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobOptions {
    pub computer: Option<String>,
    pub max_wallclock_seconds: Option<u64>,
    pub resources: BTreeMap<String, serde_json::Value>,
    pub custom_scheduler_commands: String,
    pub queue_name: Option<String>,
    pub withmpi: bool,
    pub mpirun_extra_params: Vec<String>,
    pub import_sys_environment: bool,
    pub environment_variables: BTreeMap<String, String>,
    pub priority: Option<String>,
    pub max_memory_kb: Option<u64>,
    pub prepend_text: String,
    pub append_text: String,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            computer: None,
            max_wallclock_seconds: None,
            resources: BTreeMap::new(),
            custom_scheduler_commands: String::new(),
            queue_name: None,
            withmpi: false,
            mpirun_extra_params: Vec::new(),
            import_sys_environment: true,
            environment_variables: BTreeMap::new(),
            priority: None,
            max_memory_kb: None,
            prepend_text: String::new(),
            append_text: String::new(),
        }
    }
}

type OptionGetter = fn(&JobOptions) -> Option<serde_json::Value>;

/// Option name -> getter. Drives both lookups by name and what is written
/// to the record.
static OPTION_GETTERS: &[(&str, OptionGetter)] = &[
    ("computer", |o: &JobOptions| o.computer.clone().map(Into::into)),
    ("max_wallclock_seconds", |o: &JobOptions| o.max_wallclock_seconds.map(Into::into)),
    ("resources", |o: &JobOptions| {
        serde_json::to_value(&o.resources).ok()
    }),
    ("custom_scheduler_commands", |o: &JobOptions| {
        Some(o.custom_scheduler_commands.clone().into())
    }),
    ("queue_name", |o: &JobOptions| o.queue_name.clone().map(Into::into)),
    ("withmpi", |o: &JobOptions| Some(o.withmpi.into())),
    ("mpirun_extra_params", |o: &JobOptions| {
        serde_json::to_value(&o.mpirun_extra_params).ok()
    }),
    ("import_sys_environment", |o: &JobOptions| Some(o.import_sys_environment.into())),
    ("environment_variables", |o: &JobOptions| {
        serde_json::to_value(&o.environment_variables).ok()
    }),
    ("priority", |o: &JobOptions| o.priority.clone().map(Into::into)),
    ("max_memory_kb", |o: &JobOptions| o.max_memory_kb.map(Into::into)),
    ("prepend_text", |o: &JobOptions| Some(o.prepend_text.clone().into())),
    ("append_text", |o: &JobOptions| Some(o.append_text.clone().into())),
];

impl JobOptions {
    pub fn from_value(value: &crate::engine::types::Value) -> Result<Self, EngineError> {
        serde_json::from_value(serde_json::Value::from(value))
            .map_err(|e| EngineError::InvalidOptions(e.to_string()))
    }

    pub fn from_inputs(inputs: &Inputs) -> Result<Self, EngineError> {
        match inputs.get(OPTIONS_INPUT) {
            Some(value) => Self::from_value(value),
            None => Err(EngineError::MissingInput(OPTIONS_INPUT.to_string())),
        }
    }

    /// The computer the job runs on.
    pub fn computer(&self) -> Result<&str, EngineError> {
        self.computer
            .as_deref()
            .ok_or_else(|| EngineError::InvalidOptions("no computer specified".to_string()))
    }

    /// Look up an option by name. `Ok(None)` means the option is unset.
    pub fn get(&self, name: &str) -> Result<Option<serde_json::Value>, EngineError> {
        OPTION_GETTERS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, getter)| getter(self))
            .ok_or_else(|| EngineError::InvalidOptions(format!("unknown option '{}'", name)))
    }

    /// Every set option as (name, value).
    pub fn attributes(&self) -> Vec<(&'static str, serde_json::Value)> {
        OPTION_GETTERS
            .iter()
            .filter_map(|(name, getter)| getter(self).map(|v| (*name, v)))
            .collect()
    }
}

/// Everything a scheduler adapter needs to submit one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobScript {
    pub job_name: String,
    pub work_dir: String,
    pub options: JobOptions,
    pub command_line: String,
    pub stdout_name: Option<String>,
}

impl JobScript {
    pub fn new(job_name: &str, work_dir: &str, options: &JobOptions, calc: &CalcInfo) -> Self {
        let mut argv: Vec<String> = Vec::new();
        if options.withmpi {
            argv.push("mpirun".to_string());
            argv.extend(options.mpirun_extra_params.iter().cloned());
        }
        argv.extend(calc.command.iter().cloned());

        let mut command_line = argv.join(" ");
        if let Some(stdout) = &calc.stdout_name {
            command_line.push_str(" > ");
            command_line.push_str(stdout);
        }

        Self {
            job_name: job_name.to_string(),
            work_dir: work_dir.to_string(),
            options: options.clone(),
            command_line,
            stdout_name: calc.stdout_name.clone(),
        }
    }

    /// Shell script body uploaded next to the job's input files.
    pub fn render(&self) -> String {
        let mut lines = vec!["#!/bin/bash".to_string()];
        if !self.options.custom_scheduler_commands.is_empty() {
            lines.push(self.options.custom_scheduler_commands.clone());
        }
        for (key, value) in &self.options.environment_variables {
            lines.push(format!("export {}='{}'", key, value));
        }
        if !self.options.prepend_text.is_empty() {
            lines.push(self.options.prepend_text.clone());
        }
        lines.push(format!("cd '{}'", self.work_dir));
        lines.push(self.command_line.clone());
        if !self.options.append_text.is_empty() {
            lines.push(self.options.append_text.clone());
        }
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

/// Local holding area with the files brought back from a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedFolder {
    path: PathBuf,
}

impl RetrievedFolder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path.join(name);
        std::fs::read(&path).with_context(|| format!("Failed to read retrieved file: {:?}", path))
    }

    pub fn read_to_string(&self, name: &str) -> Result<String> {
        let path = self.path.join(name);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read retrieved file: {:?}", path))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path.join(name).is_file()
    }
}

pub type PrepareFn = dyn Fn(&Inputs, &JobOptions) -> Result<CalcInfo> + Send + Sync;
pub type ParseFn = dyn Fn(&RetrievedFolder) -> Result<Outputs> + Send + Sync;

/// The job-specific halves of a job process.
#[derive(Clone)]
pub struct JobSpec {
    prepare: Arc<PrepareFn>,
    parse: Arc<ParseFn>,
}

impl JobSpec {
    pub fn new<P, R>(prepare: P, parse: R) -> Self
    where
        P: Fn(&Inputs, &JobOptions) -> Result<CalcInfo> + Send + Sync + 'static,
        R: Fn(&RetrievedFolder) -> Result<Outputs> + Send + Sync + 'static,
    {
        Self {
            prepare: Arc::new(prepare),
            parse: Arc::new(parse),
        }
    }

    /// Build the job description. Runs before anything is submitted, so
    /// validation errors surface to the caller that created the process.
    pub fn prepare(&self, inputs: &Inputs, options: &JobOptions) -> Result<CalcInfo> {
        (self.prepare)(inputs, options)
    }

    pub fn parse(&self, folder: &RetrievedFolder) -> Result<Outputs> {
        (self.parse)(folder)
    }
}

// ===== Transport tasks =====

/// Upload the job's files and hand it to the scheduler.
pub struct SubmitJob {
    pub record: RecordId,
    pub records: Arc<dyn RecordStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub script: JobScript,
    pub files: Vec<InputFile>,
}

#[async_trait]
impl TransportTask for SubmitJob {
    type Output = String;

    fn name(&self) -> &'static str {
        "submit"
    }

    async fn execute(&self, session: &mut dyn TransportSession) -> Result<String> {
        // Submission is not idempotent: never hand the same record to the
        // scheduler twice.
        if let Some(job_id) = self.records.job_id(self.record).await? {
            warn!(record = %self.record, job_id = %job_id, "Job already submitted, not resubmitting");
            return Ok(job_id);
        }

        self.records
            .set_state(self.record, CalcState::Submitting)
            .await?;

        let work_dir = &self.script.work_dir;
        let mkdir = session
            .exec_command(&format!("mkdir -p '{}'", work_dir))
            .await
            .with_context(|| format!("Failed to create remote directory {}", work_dir))?;
        if !mkdir.success() {
            bail!(
                "Failed to create remote directory {}: {}",
                work_dir,
                mkdir.stderr.trim()
            );
        }

        for file in &self.files {
            let remote = format!("{}/{}", work_dir, file.name);
            session
                .put_file(file.contents.as_bytes(), &remote)
                .await
                .with_context(|| format!("Failed to upload {}", remote))?;
        }
        session
            .put_file(
                self.script.render().as_bytes(),
                &format!("{}/{}", work_dir, SUBMIT_SCRIPT),
            )
            .await
            .context("Failed to upload submit script")?;

        let job_id = self.scheduler.submit(session, &self.script).await?;

        self.records.set_job_id(self.record, &job_id).await?;
        self.records
            .set_attribute(
                self.record,
                "remote_workdir",
                serde_json::Value::String(work_dir.clone()),
            )
            .await?;
        self.records
            .set_state(self.record, CalcState::WithScheduler)
            .await?;

        info!(record = %self.record, job_id = %job_id, "Job submitted");
        Ok(job_id)
    }
}

/// Ask the scheduler about the job. Resolves to `true` once it is done.
pub struct UpdateSchedulerState {
    pub record: RecordId,
    pub records: Arc<dyn RecordStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub job_id: String,
}

#[async_trait]
impl TransportTask for UpdateSchedulerState {
    type Output = bool;

    fn name(&self) -> &'static str {
        "update_scheduler_state"
    }

    async fn execute(&self, session: &mut dyn TransportSession) -> Result<bool> {
        let user = self.scheduler.can_query_by_user().then_some(QUERY_USER);
        let jobs = self
            .scheduler
            .get_jobs(session, std::slice::from_ref(&self.job_id), user)
            .await?;

        let done = match jobs.get(&self.job_id) {
            None => {
                // Absence from the listing is taken as completion. A
                // transient listing failure looks the same from here.
                warn!(
                    record = %self.record,
                    job_id = %self.job_id,
                    "Job not found in scheduler listing, assuming it is done"
                );
                self.records
                    .set_scheduler_state(self.record, JobState::Done)
                    .await?;
                true
            }
            Some(info) => {
                let last = self.records.last_job_info(self.record).await?;
                if last.map(|l| l.job_state) != Some(info.job_state) {
                    info!(
                        record = %self.record,
                        job_id = %self.job_id,
                        state = %info.job_state,
                        "Scheduler state changed"
                    );
                    self.records.set_last_job_info(self.record, info).await?;
                }
                info.job_state == JobState::Done
            }
        };

        if done {
            let detailed = match self
                .scheduler
                .get_detailed_job_info(session, &self.job_id)
                .await
            {
                Ok(text) => text,
                Err(e) if EngineError::is_unsupported(&e) => DETAILED_INFO_UNSUPPORTED.to_string(),
                Err(e) => return Err(e),
            };
            self.records
                .set_detailed_job_info(self.record, &detailed)
                .await?;
            self.records
                .set_state(self.record, CalcState::Computed)
                .await?;
        }
        Ok(done)
    }
}

/// Copy the retrieve list into a local holding area.
pub struct RetrieveJob {
    pub record: RecordId,
    pub records: Arc<dyn RecordStore>,
    pub work_dir: String,
    pub retrieve_list: Vec<String>,
    pub holding: PathBuf,
}

#[async_trait]
impl TransportTask for RetrieveJob {
    type Output = RetrievedFolder;

    fn name(&self) -> &'static str {
        "retrieve"
    }

    async fn execute(&self, session: &mut dyn TransportSession) -> Result<RetrievedFolder> {
        self.records
            .set_state(self.record, CalcState::Retrieving)
            .await?;

        tokio::fs::create_dir_all(&self.holding)
            .await
            .with_context(|| format!("Failed to create holding area: {:?}", self.holding))?;

        for name in &self.retrieve_list {
            let remote = format!("{}/{}", self.work_dir, name);
            let data = session
                .get_file(&remote)
                .await
                .with_context(|| format!("Failed to retrieve {}", remote))?;
            let local = self.holding.join(name);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local, data)
                .await
                .with_context(|| format!("Failed to write retrieved file: {:?}", local))?;
        }

        info!(record = %self.record, files = self.retrieve_list.len(), "Job outputs retrieved");
        Ok(RetrievedFolder::new(self.holding.clone()))
    }
}

// ===== Process side =====

fn cancelled() -> ProcessState {
    ProcessState::Cancelled {
        msg: Some("cancelled while waiting".to_string()),
    }
}

impl Process {
    fn job(&self) -> Result<&JobSpec> {
        self.spec
            .job_spec()
            .ok_or_else(|| anyhow!("process '{}' is not a job", self.spec.name()))
    }

    fn options(&self) -> Result<&JobOptions> {
        self.options
            .as_ref()
            .ok_or_else(|| anyhow!("job process {} has no options", self.pid))
    }

    fn calc_info(&self) -> Result<&CalcInfo> {
        self.calc_info
            .as_ref()
            .ok_or_else(|| anyhow!("job process {} was not prepared", self.pid))
    }

    /// Record the options and queue the job for submission.
    pub(super) async fn start_job(&mut self) -> Result<ProcessState> {
        let records = self.engine.records();
        for (name, value) in self.options()?.attributes() {
            records.set_attribute(self.record, name, value).await?;
        }
        records.set_state(self.record, CalcState::ToSubmit).await?;
        Ok(ProcessState::waiting(
            WaitCommand::Submit,
            Some("Waiting for submission".to_string()),
        ))
    }

    /// Carry out one waiting command and decide the next state.
    pub(super) async fn job_command(&mut self, command: WaitCommand) -> Result<ProcessState> {
        let options = self.options()?;
        let computer = self.engine.computer(options.computer()?)?;
        let records = self.engine.records().clone();
        let work_dir = computer.job_dir(self.record);

        match command {
            WaitCommand::Submit => {
                let calc = self.calc_info()?;
                let script = JobScript::new(
                    &format!("jobflow-{}", self.pid),
                    &work_dir,
                    options,
                    calc,
                );
                let task = SubmitJob {
                    record: self.record,
                    records: records.clone(),
                    scheduler: computer.scheduler.clone(),
                    script,
                    files: calc.files.clone(),
                };
                match self.run_task(&computer, task).await? {
                    TaskResolution::Done(job_id) => Ok(ProcessState::waiting(
                        WaitCommand::UpdateScheduler,
                        Some(format!("Job {} submitted", job_id)),
                    )),
                    TaskResolution::Failed(e) => {
                        self.mark_best_effort(CalcState::SubmissionFailed).await;
                        Err(e)
                    }
                    TaskResolution::Cancelled => {
                        if let Ok(Some(job_id)) = records.job_id(self.record).await {
                            warn!(pid = %self.pid, job_id = %job_id, "Process cancelled after submission, job left with the scheduler");
                        }
                        Ok(cancelled())
                    }
                }
            }
            WaitCommand::UpdateScheduler => {
                let interval = self.engine.config().poll_interval;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(cancelled()),
                    _ = tokio::time::sleep(interval) => {}
                }

                let job_id = records
                    .job_id(self.record)
                    .await?
                    .ok_or_else(|| anyhow!("no job id recorded for process {}", self.pid))?;
                let task = UpdateSchedulerState {
                    record: self.record,
                    records,
                    scheduler: computer.scheduler.clone(),
                    job_id: job_id.clone(),
                };
                match self.run_task(&computer, task).await? {
                    TaskResolution::Done(true) => Ok(ProcessState::waiting(
                        WaitCommand::Retrieve,
                        Some(format!("Job {} done, retrieving", job_id)),
                    )),
                    TaskResolution::Done(false) => Ok(ProcessState::waiting(
                        WaitCommand::UpdateScheduler,
                        Some(format!("Job {} with scheduler", job_id)),
                    )),
                    TaskResolution::Failed(e) => Err(e),
                    TaskResolution::Cancelled => Ok(cancelled()),
                }
            }
            WaitCommand::Retrieve => {
                let task = RetrieveJob {
                    record: self.record,
                    records,
                    work_dir,
                    retrieve_list: self.calc_info()?.retrieve_list.clone(),
                    holding: self
                        .engine
                        .config()
                        .work_dir
                        .join("retrieved")
                        .join(self.pid.to_string()),
                };
                match self.run_task(&computer, task).await? {
                    TaskResolution::Done(folder) => Ok(ProcessState::running(
                        Continuation::Retrieved {
                            folder: folder.path().to_path_buf(),
                        },
                    )),
                    TaskResolution::Failed(e) => {
                        self.mark_best_effort(CalcState::RetrievalFailed).await;
                        Err(e)
                    }
                    TaskResolution::Cancelled => Ok(cancelled()),
                }
            }
        }
    }

    async fn run_task<O: TransportTask>(
        &mut self,
        computer: &Computer,
        op: O,
    ) -> Result<TaskResolution<O::Output>> {
        let auth = self
            .engine
            .auth_info(&computer.name, &self.engine.config().default_user)?;
        let task = Task::spawn(
            self.engine.queue().clone(),
            auth,
            computer.transport.clone(),
            op,
            self.cancel.child_token(),
        );
        // Left in place for the exit hook of WAITING to cancel.
        self.active_task = Some(task.token());
        Ok(task.wait().await)
    }

    /// Parse the retrieved files into outputs.
    pub(super) async fn job_retrieved(&mut self, folder: PathBuf) -> Result<ProcessState> {
        let records = self.engine.records().clone();
        records.set_state(self.record, CalcState::Parsing).await?;

        let retrieved = RetrievedFolder::new(folder);
        let parsed = match self.job()?.parse(&retrieved) {
            Ok(outputs) => outputs,
            Err(e) => {
                // Must not mask the parse error.
                if let Err(mark) = records.set_state(self.record, CalcState::ParsingFailed).await {
                    warn!(pid = %self.pid, error = %format!("{:#}", mark), "Could not mark record as PARSINGFAILED");
                }
                return Err(e);
            }
        };
        self.spec.validate_outputs(&parsed)?;
        self.outputs.extend(parsed);

        if let Err(e) = tokio::fs::remove_dir_all(retrieved.path()).await {
            warn!(pid = %self.pid, error = %e, "Failed to remove holding area");
        }
        self.finish().await
    }

    async fn mark_best_effort(&self, state: CalcState) {
        if let Err(e) = self.engine.records().set_state(self.record, state).await {
            warn!(pid = %self.pid, state = %state, error = %format!("{:#}", e), "Could not update calc state");
        }
    }
}
