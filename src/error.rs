use thiserror::Error;

use crate::engine::registry::Pid;
use crate::engine::state_machine::StateLabel;
use crate::engine::types::ValueKind;
use crate::records::RecordId;

/// Failures the engine reports by kind. Everything else travels as
/// `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown input '{0}'")]
    UnknownInput(String),

    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("input '{name}' expects {expected}, got {found}")]
    InputKind {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("unknown output '{0}'")]
    UnknownOutput(String),

    #[error("output '{name}' expects {expected}, got {found}")]
    OutputKind {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("missing required output '{0}'")]
    MissingOutput(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: StateLabel, to: StateLabel },

    #[error("no process spec registered under '{0}'")]
    UnknownSpec(String),

    #[error("unknown computer '{0}'")]
    UnknownComputer(String),

    #[error("user '{user}' is not configured to use computer '{computer}'")]
    NotConfigured { user: String, computer: String },

    #[error("failed to open transport session for {key}: {reason}")]
    SessionOpen { key: String, reason: String },

    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    #[error("record {0} is sealed and can no longer be modified")]
    ModificationNotAllowed(RecordId),

    #[error("scheduler does not support {0}")]
    Unsupported(&'static str),

    #[error("process {0} is already running")]
    AlreadyRunning(Pid),

    #[error("parent process {0} is not registered")]
    ParentNotRegistered(Pid),

    #[error("child process {0} was cancelled")]
    ChildCancelled(Pid),

    #[error("engine stopped with {0} process(es) still registered")]
    NotDrained(usize),
}

impl EngineError {
    /// True when `err` is an [`EngineError::Unsupported`] anywhere in its chain.
    pub fn is_unsupported(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<EngineError>(),
                Some(EngineError::Unsupported(_))
            )
        })
    }
}
