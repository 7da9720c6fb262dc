//! Generic process lifecycle.
//!
//! ```text
//! CREATED -> RUNNING <-> WAITING -> FINISHED | FAILED | CANCELLED
//! ```
//!
//! The machine only validates and records transitions. Side effects on
//! entering and leaving states are run by the owning process, which is also
//! the only code that interprets the payload a state carries.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The state names without their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateLabel {
    Created,
    Running,
    Waiting,
    Finished,
    Failed,
    Cancelled,
}

impl StateLabel {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateLabel::Finished | StateLabel::Failed | StateLabel::Cancelled
        )
    }

    /// Whether the machine may move from `self` to `to`.
    pub fn can_transition_to(&self, to: StateLabel) -> bool {
        use StateLabel::*;
        match self {
            Created => matches!(to, Running | Failed),
            Running => matches!(to, Running | Waiting | Finished | Failed | Cancelled),
            Waiting => matches!(to, Waiting | Running | Failed | Cancelled),
            Finished | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for StateLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateLabel::Created => write!(f, "created"),
            StateLabel::Running => write!(f, "running"),
            StateLabel::Waiting => write!(f, "waiting"),
            StateLabel::Finished => write!(f, "finished"),
            StateLabel::Failed => write!(f, "failed"),
            StateLabel::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a RUNNING process does next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Continuation {
    /// Begin executing: run the first outline step or start a job.
    Start,
    /// Run outline step `index`.
    Step { index: usize },
    /// A job's files are in the local holding area; parse them.
    Retrieved { folder: PathBuf },
}

/// Pending sub-command of a WAITING job process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCommand {
    Submit,
    UpdateScheduler,
    Retrieve,
}

impl std::fmt::Display for WaitCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitCommand::Submit => write!(f, "submit"),
            WaitCommand::UpdateScheduler => write!(f, "update_scheduler"),
            WaitCommand::Retrieve => write!(f, "retrieve"),
        }
    }
}

/// Serialisable description of the error that failed a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl From<&anyhow::Error> for Failure {
    fn from(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            causes: err.chain().skip(1).map(|c| c.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// A state together with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running {
        next: Continuation,
    },
    Waiting {
        command: WaitCommand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    Finished,
    Failed {
        failure: Failure,
    },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
}

impl ProcessState {
    pub fn label(&self) -> StateLabel {
        match self {
            ProcessState::Created => StateLabel::Created,
            ProcessState::Running { .. } => StateLabel::Running,
            ProcessState::Waiting { .. } => StateLabel::Waiting,
            ProcessState::Finished => StateLabel::Finished,
            ProcessState::Failed { .. } => StateLabel::Failed,
            ProcessState::Cancelled { .. } => StateLabel::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.label().is_terminal()
    }

    pub fn running(next: Continuation) -> Self {
        ProcessState::Running { next }
    }

    pub fn waiting(command: WaitCommand, msg: Option<String>) -> Self {
        ProcessState::Waiting { command, msg }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: StateLabel,
    pub to: StateLabel,
    pub at: DateTime<Utc>,
}

/// The single active state of a process plus the transitions that led there.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ProcessState,
    history: Vec<Transition>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Created,
            history: Vec::new(),
        }
    }

    /// Rebuild a machine sitting in `state`. Used when loading a checkpoint;
    /// the owner must re-enter the state so its pending work is re-armed.
    pub fn restore(state: ProcessState) -> Self {
        Self {
            state,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn label(&self) -> StateLabel {
        self.state.label()
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Move to `to`, returning the state that was left.
    ///
    /// Cancelling a process that already terminated is a no-op: the state
    /// is kept, nothing is added to the history and the current state is
    /// returned.
    pub fn transition_to(&mut self, to: ProcessState) -> Result<ProcessState, EngineError> {
        let from = self.state.label();
        let to_label = to.label();
        if from.is_terminal() && to_label == StateLabel::Cancelled {
            return Ok(self.state.clone());
        }
        if !from.can_transition_to(to_label) {
            return Err(EngineError::InvalidTransition { from, to: to_label });
        }
        self.history.push(Transition {
            from,
            to: to_label,
            at: Utc::now(),
        });
        Ok(std::mem::replace(&mut self.state, to))
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
