use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A value flowing into or out of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

/// Named inputs of a process. Immutable once the process starts.
pub type Inputs = BTreeMap<String, Value>;

/// Named outputs of a process, published to the durable record on success.
pub type Outputs = BTreeMap<String, Value>;

/// Scratch space shared between the outline steps of one process.
pub type Context = HashMap<String, Value>;

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Dict(_) => ValueKind::Dict,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Numeric addition. Int + Int stays Int; any Float promotes.
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int),
            _ => Some(Value::Float(self.as_f64()? + other.as_f64()?)),
        }
    }

    /// Numeric multiplication with the same promotion rules as `checked_add`.
    pub fn checked_mul(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(*b).map(Value::Int),
            _ => Some(Value::Float(self.as_f64()? * other.as_f64()?)),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Dict(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// The kind of value a port accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Int,
    Float,
    /// Int or Float.
    Numeric,
    Bool,
    Str,
    List,
    Dict,
    Any,
}

impl ValueKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::Numeric => matches!(value, Value::Int(_) | Value::Float(_)),
            kind => *kind == value.kind(),
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Int => write!(f, "int"),
            ValueKind::Float => write!(f, "float"),
            ValueKind::Numeric => write!(f, "numeric"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Str => write!(f, "str"),
            ValueKind::List => write!(f, "list"),
            ValueKind::Dict => write!(f, "dict"),
            ValueKind::Any => write!(f, "any"),
        }
    }
}

/// Lifecycle of a job calculation as recorded on its durable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalcState {
    New,
    ToSubmit,
    Submitting,
    WithScheduler,
    Computed,
    Retrieving,
    Parsing,
    Finished,
    SubmissionFailed,
    RetrievalFailed,
    ParsingFailed,
    Failed,
}

impl CalcState {
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            CalcState::SubmissionFailed
                | CalcState::RetrievalFailed
                | CalcState::ParsingFailed
                | CalcState::Failed
        )
    }
}

impl std::fmt::Display for CalcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalcState::New => write!(f, "NEW"),
            CalcState::ToSubmit => write!(f, "TOSUBMIT"),
            CalcState::Submitting => write!(f, "SUBMITTING"),
            CalcState::WithScheduler => write!(f, "WITHSCHEDULER"),
            CalcState::Computed => write!(f, "COMPUTED"),
            CalcState::Retrieving => write!(f, "RETRIEVING"),
            CalcState::Parsing => write!(f, "PARSING"),
            CalcState::Finished => write!(f, "FINISHED"),
            CalcState::SubmissionFailed => write!(f, "SUBMISSIONFAILED"),
            CalcState::RetrievalFailed => write!(f, "RETRIEVALFAILED"),
            CalcState::ParsingFailed => write!(f, "PARSINGFAILED"),
            CalcState::Failed => write!(f, "FAILED"),
        }
    }
}

/// State of a job as reported by the batch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Undetermined,
    Queued,
    QueuedHeld,
    Running,
    Suspended,
    Done,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Undetermined => write!(f, "undetermined"),
            JobState::Queued => write!(f, "queued"),
            JobState::QueuedHeld => write!(f, "queued_held"),
            JobState::Running => write!(f, "running"),
            JobState::Suspended => write!(f, "suspended"),
            JobState::Done => write!(f, "done"),
        }
    }
}

/// One scheduler listing entry for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub job_state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallclock_time_seconds: Option<u64>,
    pub observed: DateTime<Utc>,
}

impl JobInfo {
    pub fn new(job_id: impl Into<String>, job_state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            job_state,
            title: None,
            queue_name: None,
            wallclock_time_seconds: None,
            observed: Utc::now(),
        }
    }
}
