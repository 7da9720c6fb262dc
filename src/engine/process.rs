//! The generic process.
//!
//! A [`Process`] is one future: it registers itself, then alternates between
//! doing the work of its current state and transitioning to the state that
//! work asked for, until it reaches a terminal state. Every non-terminal
//! state is checkpointed on entry, so a process rebuilt from a checkpoint
//! simply re-does the work of the state it was in.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::job::{CalcInfo, JobOptions};
use crate::engine::registry::{CallContext, Pid, Registration};
use crate::engine::spec::ProcessSpec;
use crate::engine::state_machine::{
    Continuation, Failure, ProcessState, StateLabel, StateMachine,
};
use crate::engine::types::{CalcState, Context, Inputs, Outputs, Value};
use crate::engine::{Engine, ProcessHandle};
use crate::error::EngineError;
use crate::records::{LinkType, RecordId};
use crate::storage::{Checkpoint, CheckpointArea};

/// How a process ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    Finished(Outputs),
    /// Carries the error that failed the process, with its original type.
    Failed(anyhow::Error),
    Cancelled(Option<String>),
}

impl ProcessOutcome {
    pub fn label(&self) -> StateLabel {
        match self {
            ProcessOutcome::Finished(_) => StateLabel::Finished,
            ProcessOutcome::Failed(_) => StateLabel::Failed,
            ProcessOutcome::Cancelled(_) => StateLabel::Cancelled,
        }
    }

    pub fn outputs(&self) -> Option<&Outputs> {
        match self {
            ProcessOutcome::Finished(outputs) => Some(outputs),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Outputs> {
        match self {
            ProcessOutcome::Finished(outputs) => Ok(outputs),
            ProcessOutcome::Failed(e) => Err(e),
            ProcessOutcome::Cancelled(msg) => Err(anyhow!(
                "process cancelled{}",
                msg.map(|m| format!(": {}", m)).unwrap_or_default()
            )),
        }
    }
}

pub struct Process {
    pub(super) engine: Engine,
    pub(super) spec: Arc<ProcessSpec>,
    pub(super) pid: Pid,
    pub(super) record: RecordId,
    pub(super) parent: Option<Pid>,
    pub(super) inputs: Arc<Inputs>,
    pub(super) ctx: Context,
    pub(super) outputs: Outputs,
    pub(super) options: Option<JobOptions>,
    pub(super) calc_info: Option<CalcInfo>,
    pub(super) machine: StateMachine,
    pub(super) cancel: CancellationToken,
    pub(super) failure: Option<anyhow::Error>,
    pub(super) active_task: Option<CancellationToken>,
}

/// Validate inputs and, for jobs, resolve options and run `prepare`.
fn prepare(
    engine: &Engine,
    spec: &ProcessSpec,
    inputs: &Inputs,
    calc_info: Option<CalcInfo>,
) -> Result<(Option<JobOptions>, Option<CalcInfo>)> {
    spec.validate_inputs(inputs)?;
    let Some(job) = spec.job_spec() else {
        return Ok((None, None));
    };
    let options = JobOptions::from_inputs(inputs)?;
    let computer = options.computer()?;
    engine.computer(computer)?;
    engine.auth_info(computer, &engine.config().default_user)?;
    let calc_info = match calc_info {
        Some(calc) => calc,
        None => job.prepare(inputs, &options)?,
    };
    Ok((Some(options), Some(calc_info)))
}

impl Process {
    /// Create a new process and its durable record. Validation happens
    /// here, before any record exists.
    pub(crate) async fn create(
        engine: &Engine,
        spec: Arc<ProcessSpec>,
        inputs: Inputs,
        parent: Option<(Pid, &CancellationToken)>,
    ) -> Result<Self> {
        let (options, calc_info) = prepare(engine, &spec, &inputs, None)?;

        let records = engine.records();
        let record = records.create(spec.name()).await?;
        let pid = Pid::from(record);

        for (name, value) in &inputs {
            for (label, recorded) in spec.record_input(name, value)? {
                records.add_input(record, &label, &recorded).await?;
            }
        }
        if let Some((parent, _)) = parent {
            records
                .add_link_from(record, parent.into(), LinkType::Call, "CALL")
                .await?;
        }

        let cancel = match parent {
            Some((_, token)) => token.child_token(),
            None => CancellationToken::new(),
        };

        info!(pid = %pid, spec = %spec.name(), "Process created");
        Ok(Self {
            engine: engine.clone(),
            spec,
            pid,
            record,
            parent: parent.map(|(p, _)| p),
            inputs: Arc::new(inputs),
            ctx: Context::new(),
            outputs: Outputs::new(),
            options,
            calc_info,
            machine: StateMachine::new(),
            cancel,
            failure: None,
            active_task: None,
        })
    }

    /// Rebuild a root process sitting in `state`. Running it re-does the
    /// work of that state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        engine: &Engine,
        spec: Arc<ProcessSpec>,
        pid: Pid,
        state: ProcessState,
        inputs: Inputs,
        ctx: Context,
        outputs: Outputs,
        calc_info: Option<CalcInfo>,
    ) -> Result<Self> {
        let (options, calc_info) = prepare(engine, &spec, &inputs, calc_info)?;
        Ok(Self {
            engine: engine.clone(),
            spec,
            pid,
            record: pid.into(),
            parent: None,
            inputs: Arc::new(inputs),
            ctx,
            outputs,
            options,
            calc_info,
            machine: StateMachine::restore(state),
            cancel: CancellationToken::new(),
            failure: None,
            active_task: None,
        })
    }

    pub(crate) fn from_checkpoint(engine: &Engine, checkpoint: Checkpoint) -> Result<Self> {
        let spec = engine.spec(&checkpoint.spec)?;
        Self::restore(
            engine,
            spec,
            checkpoint.pid,
            checkpoint.state,
            checkpoint.inputs,
            checkpoint.ctx,
            checkpoint.outputs,
            checkpoint.calc_info,
        )
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn record(&self) -> RecordId {
        self.record
    }

    pub fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    pub fn state(&self) -> &ProcessState {
        self.machine.state()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            pid: self.pid,
            spec: self.spec.name().to_string(),
            parent: self.parent,
            state: self.machine.state().clone(),
            inputs: (*self.inputs).clone(),
            ctx: self.ctx.clone(),
            outputs: self.outputs.clone(),
            calc_info: self.calc_info.clone(),
            saved: Utc::now(),
        }
    }

    /// Drive the process to a terminal state on call context `call`.
    pub async fn run(self, call: CallContext) -> ProcessOutcome {
        match self.register(call) {
            Ok(registration) => self.drive(registration).await,
            Err(e) => self.reject(e).await,
        }
    }

    /// Enter the registry on `call`. A child must register while its parent
    /// is still registered.
    pub(crate) fn register(&self, call: CallContext) -> Result<Registration, EngineError> {
        self.engine.registry().enter(
            self.pid,
            self.spec.name(),
            self.parent,
            call,
            self.cancel.clone(),
        )
    }

    /// Give up on a process that could not be registered.
    ///
    /// `AlreadyRunning` means another live process owns the record, which is
    /// left alone. Otherwise the record was made for this process only and
    /// is failed and sealed.
    pub(crate) async fn reject(self, err: EngineError) -> ProcessOutcome {
        error!(pid = %self.pid, error = %err, "Process could not be registered");
        if !matches!(err, EngineError::AlreadyRunning(_)) {
            let records = self.engine.records();
            if let Err(e) = records.set_state(self.record, CalcState::Failed).await {
                warn!(pid = %self.pid, error = %format!("{:#}", e), "Could not set final calc state");
            }
            if let Err(e) = records.set_process_state(self.record, StateLabel::Failed).await {
                warn!(pid = %self.pid, error = %format!("{:#}", e), "Could not set process state");
            }
            if let Err(e) = records.seal(self.record).await {
                warn!(pid = %self.pid, error = %format!("{:#}", e), "Could not seal record");
            }
        }
        ProcessOutcome::Failed(err.into())
    }

    /// Run the state loop of a registered process.
    pub(crate) async fn drive(mut self, registration: Registration) -> ProcessOutcome {
        let call = registration.call();

        info!(pid = %self.pid, spec = %self.spec.name(), state = %self.machine.label(), "Process running");

        loop {
            let state = self.machine.state().clone();
            if state.is_terminal() {
                break;
            }
            let next = if self.cancel.is_cancelled() && state != ProcessState::Created {
                Ok(ProcessState::Cancelled {
                    msg: Some("cancelled".to_string()),
                })
            } else {
                self.step(state, call).await
            };
            let next = match next {
                Ok(next) => next,
                Err(e) if self.cancel.is_cancelled() => ProcessState::Cancelled {
                    msg: Some(format!("{:#}", e)),
                },
                Err(e) => self.fail_with(e),
            };
            self.transition(next).await;
        }

        self.outcome()
    }

    async fn step(&mut self, state: ProcessState, call: CallContext) -> Result<ProcessState> {
        match state {
            ProcessState::Created => Ok(ProcessState::running(Continuation::Start)),
            ProcessState::Running { next } => self.step_running(next, call).await,
            ProcessState::Waiting { command, .. } => {
                if !self.spec.is_job() {
                    return Err(anyhow!(
                        "process '{}' has no waiting commands",
                        self.spec.name()
                    ));
                }
                self.job_command(command).await
            }
            terminal => Ok(terminal),
        }
    }

    async fn step_running(&mut self, next: Continuation, call: CallContext) -> Result<ProcessState> {
        match next {
            Continuation::Start if self.spec.is_job() => self.start_job().await,
            Continuation::Start => self.next_step(0).await,
            Continuation::Step { index } => {
                let step = self
                    .spec
                    .outline_step(index)
                    .ok_or_else(|| anyhow!("outline step {} out of range", index))?;

                let mut cx = StepContext {
                    engine: self.engine.clone(),
                    spec: self.spec.clone(),
                    pid: self.pid,
                    call,
                    inputs: self.inputs.clone(),
                    ctx: std::mem::take(&mut self.ctx),
                    outputs: std::mem::take(&mut self.outputs),
                    cancel: self.cancel.clone(),
                };
                let result = step.run(&mut cx).await;
                self.ctx = cx.ctx;
                self.outputs = cx.outputs;
                result?;

                self.next_step(index + 1).await
            }
            Continuation::Retrieved { folder } => self.job_retrieved(folder).await,
        }
    }

    async fn next_step(&mut self, index: usize) -> Result<ProcessState> {
        if index < self.spec.outline_len() {
            Ok(ProcessState::running(Continuation::Step { index }))
        } else {
            self.finish().await
        }
    }

    /// Validate and publish outputs. Only called on the way to FINISHED.
    pub(super) async fn finish(&mut self) -> Result<ProcessState> {
        self.spec.validate_outputs(&self.outputs)?;
        let records = self.engine.records();
        for (label, value) in &self.outputs {
            records.add_output(self.record, label, value).await?;
        }
        Ok(ProcessState::Finished)
    }

    fn fail_with(&mut self, err: anyhow::Error) -> ProcessState {
        let failure = Failure::from(&err);
        error!(pid = %self.pid, error = %format!("{:#}", err), "Process failed");
        self.failure = Some(err);
        ProcessState::Failed { failure }
    }

    async fn transition(&mut self, to: ProcessState) {
        let mut to = to;
        loop {
            let left = match self.machine.transition_to(to) {
                Ok(left) => left,
                Err(e) => {
                    to = self.fail_with(e.into());
                    continue;
                }
            };
            self.on_exit(&left);

            if self.machine.state().is_terminal() {
                self.on_terminal().await;
                return;
            }

            let checkpoint = self.checkpoint();
            match self
                .engine
                .checkpoints()
                .save(CheckpointArea::Running, &checkpoint)
                .await
            {
                Ok(()) => return,
                Err(e) => to = self.fail_with(e.context("Failed to save checkpoint")),
            }
        }
    }

    fn on_exit(&mut self, left: &ProcessState) {
        if left.label() == StateLabel::Waiting {
            if let Some(task) = self.active_task.take() {
                task.cancel();
            }
        }
    }

    /// Record the result, file the checkpoint and seal the record.
    async fn on_terminal(&mut self) {
        let label = self.machine.label();
        let records = self.engine.records().clone();

        let calc_state = match label {
            StateLabel::Finished => Some(CalcState::Finished),
            StateLabel::Failed => match records.get(self.record).await {
                Ok(record) if record.calc_state.is_failed() => None,
                _ => Some(CalcState::Failed),
            },
            _ => None,
        };
        if let Some(state) = calc_state {
            if let Err(e) = records.set_state(self.record, state).await {
                warn!(pid = %self.pid, error = %format!("{:#}", e), "Could not set final calc state");
            }
        }
        if let Err(e) = records.set_process_state(self.record, label).await {
            warn!(pid = %self.pid, error = %format!("{:#}", e), "Could not set process state");
        }

        // Filed before sealing: a sealed record never has a live checkpoint
        // left in the running area by this process.
        let area = match label {
            StateLabel::Finished => CheckpointArea::Finished,
            _ => CheckpointArea::Failed,
        };
        if let Err(e) = self.file_checkpoint(area).await {
            warn!(pid = %self.pid, error = %format!("{:#}", e), "Could not file final checkpoint");
        }

        if let Err(e) = records.seal(self.record).await {
            warn!(pid = %self.pid, error = %format!("{:#}", e), "Could not seal record");
        }

        info!(pid = %self.pid, spec = %self.spec.name(), state = %label, "Process terminated");
    }

    async fn file_checkpoint(&self, area: CheckpointArea) -> Result<()> {
        let store = self.engine.checkpoints();
        store
            .save(CheckpointArea::Running, &self.checkpoint())
            .await?;
        store.move_to(self.pid, area).await?;
        if !self.engine.config().archive_checkpoints {
            store.delete(area, self.pid).await?;
        }
        Ok(())
    }

    fn outcome(&mut self) -> ProcessOutcome {
        match self.machine.state() {
            ProcessState::Finished => ProcessOutcome::Finished(self.outputs.clone()),
            ProcessState::Failed { failure } => ProcessOutcome::Failed(
                self.failure
                    .take()
                    .unwrap_or_else(|| anyhow!("{}", failure)),
            ),
            ProcessState::Cancelled { msg } => ProcessOutcome::Cancelled(msg.clone()),
            other => ProcessOutcome::Failed(anyhow!(
                "process stopped in non-terminal state {}",
                other.label()
            )),
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(task) = self.active_task.take() {
            task.cancel();
        }
    }
}

/// What an outline step sees of its process.
pub struct StepContext {
    engine: Engine,
    spec: Arc<ProcessSpec>,
    pid: Pid,
    call: CallContext,
    inputs: Arc<Inputs>,
    ctx: Context,
    outputs: Outputs,
    cancel: CancellationToken,
}

impl StepContext {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Result<&Value, EngineError> {
        if self.spec.input_port(name).is_none() {
            return Err(EngineError::UnknownInput(name.to_string()));
        }
        self.inputs
            .get(name)
            .ok_or_else(|| EngineError::MissingInput(name.to_string()))
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Attach an output. Published to the record when the process finishes.
    pub fn out(&mut self, label: &str, value: Value) -> Result<(), EngineError> {
        self.spec.validate_output(label, &value)?;
        self.outputs.insert(label.to_string(), value);
        Ok(())
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Innermost process on this step's call context.
    pub fn current(&self) -> Option<Pid> {
        self.engine.registry().current(self.call)
    }

    pub fn stack(&self) -> Vec<Pid> {
        self.engine.registry().stack(self.call)
    }

    /// Run a child process to completion on this call context.
    pub async fn run_child(&self, spec: &str, inputs: Inputs) -> Result<Outputs> {
        let spec = self.engine.spec(spec)?;
        let child = Process::create(&self.engine, spec, inputs, Some((self.pid, &self.cancel))).await?;
        let child_pid = child.pid();
        match child.run(self.call).await {
            ProcessOutcome::Finished(outputs) => Ok(outputs),
            ProcessOutcome::Failed(e) => Err(e),
            ProcessOutcome::Cancelled(_) => Err(EngineError::ChildCancelled(child_pid).into()),
        }
    }

    /// Spawn a child process on its own call context.
    pub async fn submit_child(&self, spec: &str, inputs: Inputs) -> Result<ProcessHandle> {
        let spec = self.engine.spec(spec)?;
        let child = Process::create(&self.engine, spec, inputs, Some((self.pid, &self.cancel))).await?;
        Ok(self.engine.spawn(child))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::engine::state_machine::WaitCommand;
    use crate::records::memory::MemoryRecordStore;
    use crate::storage::memory_store::MemoryCheckpointStore;

    fn engine() -> Engine {
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryCheckpointStore::new()),
        );
        engine.register_spec(ProcessSpec::new("idle"));
        engine
    }

    async fn idle(engine: &Engine, parent: Option<(Pid, &CancellationToken)>) -> Process {
        let spec = engine.spec("idle").unwrap();
        Process::create(engine, spec, Inputs::new(), parent).await.unwrap()
    }

    #[tokio::test]
    async fn leaving_waiting_cancels_the_active_task() {
        let engine = engine();
        let mut process = idle(&engine, None).await;
        process.machine = StateMachine::restore(ProcessState::waiting(WaitCommand::Retrieve, None));
        let task = CancellationToken::new();
        process.active_task = Some(task.clone());

        process
            .transition(ProcessState::running(Continuation::Start))
            .await;

        assert!(task.is_cancelled());
        assert!(process.active_task.is_none());
        assert_eq!(process.state().label(), StateLabel::Running);
    }

    #[tokio::test]
    async fn unregistered_parent_fails_and_seals_the_child_record() {
        let engine = engine();
        let parent = idle(&engine, None).await;
        let token = parent.cancel_token();
        let child = idle(&engine, Some((parent.pid(), &token))).await;
        let record = child.record();

        let err = match child.run(CallContext::new()).await {
            ProcessOutcome::Failed(err) => err,
            other => panic!("expected failure, got {}", other.label()),
        };
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ParentNotRegistered(p)) if *p == parent.pid()
        ));

        let rec = engine.records().get(record).await.unwrap();
        assert!(rec.sealed);
        assert_eq!(rec.calc_state, CalcState::Failed);
        assert_eq!(rec.process_state, Some(StateLabel::Failed));
        assert!(engine.registry().is_empty());
    }
}
