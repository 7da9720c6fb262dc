//! Process specs: the data that turns the one generic process into a
//! particular kind of work.
//!
//! A spec declares typed input and output ports and either an outline of
//! steps (work chains) or a [`JobSpec`] (remote jobs). New kinds of process
//! are new spec values, built once and registered with the engine.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::engine::job::JobSpec;
use crate::engine::process::StepContext;
use crate::engine::types::{Inputs, Outputs, Value, ValueKind};
use crate::error::EngineError;

/// Name of the input carrying the job options bundle.
pub const OPTIONS_INPUT: &str = "options";

#[derive(Debug, Clone)]
pub struct InputPort {
    pub name: String,
    pub kind: ValueKind,
    pub required: bool,
    /// Consumed by the process but not recorded on the durable record.
    pub non_db: bool,
}

#[derive(Debug, Clone)]
pub struct OutputPort {
    pub name: String,
    pub kind: ValueKind,
    pub required: bool,
}

/// Turns an input value into the (label, value) pairs recorded for it.
pub type InputHandler = Arc<dyn Fn(&Value) -> Result<Vec<(String, Value)>> + Send + Sync>;

/// One step of a work chain outline.
#[async_trait]
pub trait OutlineStep: Send + Sync {
    async fn run(&self, cx: &mut StepContext) -> Result<()>;
}

/// Adapter for steps written as plain closures.
struct FnStep<F>(F);

#[async_trait]
impl<F> OutlineStep for FnStep<F>
where
    F: Fn(&mut StepContext) -> Result<()> + Send + Sync + 'static,
{
    async fn run(&self, cx: &mut StepContext) -> Result<()> {
        (self.0)(cx)
    }
}

pub struct ProcessSpec {
    name: String,
    inputs: Vec<InputPort>,
    handlers: HashMap<String, InputHandler>,
    outputs: Vec<OutputPort>,
    outline: Vec<Arc<dyn OutlineStep>>,
    job: Option<JobSpec>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            handlers: HashMap::new(),
            outputs: Vec::new(),
            outline: Vec::new(),
            job: None,
        }
    }

    fn add_input(mut self, port: InputPort, handler: InputHandler) -> Self {
        self.inputs.retain(|p| p.name != port.name);
        self.handlers.insert(port.name.clone(), handler);
        self.inputs.push(port);
        self
    }

    fn plain_handler(name: &str, non_db: bool) -> InputHandler {
        let label = name.to_string();
        Arc::new(move |value: &Value| {
            if non_db {
                Ok(Vec::new())
            } else {
                Ok(vec![(label.clone(), value.clone())])
            }
        })
    }

    pub fn input(self, name: &str, kind: ValueKind) -> Self {
        let port = InputPort {
            name: name.to_string(),
            kind,
            required: true,
            non_db: false,
        };
        self.add_input(port, Self::plain_handler(name, false))
    }

    pub fn optional_input(self, name: &str, kind: ValueKind) -> Self {
        let port = InputPort {
            name: name.to_string(),
            kind,
            required: false,
            non_db: false,
        };
        self.add_input(port, Self::plain_handler(name, false))
    }

    /// A dict input whose entries are recorded individually as
    /// `<name>_<key>`.
    pub fn input_namespace(self, name: &str) -> Self {
        let prefix = name.to_string();
        let handler: InputHandler = Arc::new(move |value: &Value| match value {
            Value::Dict(entries) => Ok(entries
                .iter()
                .map(|(k, v)| (format!("{}_{}", prefix, k), v.clone()))
                .collect()),
            other => bail!(EngineError::InputKind {
                name: prefix.clone(),
                expected: ValueKind::Dict,
                found: other.kind(),
            }),
        });
        let port = InputPort {
            name: name.to_string(),
            kind: ValueKind::Dict,
            required: false,
            non_db: false,
        };
        self.add_input(port, handler)
    }

    pub fn output(mut self, name: &str, kind: ValueKind) -> Self {
        self.outputs.push(OutputPort {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional_output(mut self, name: &str, kind: ValueKind) -> Self {
        self.outputs.push(OutputPort {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn step(mut self, step: impl OutlineStep + 'static) -> Self {
        self.outline.push(Arc::new(step));
        self
    }

    pub fn step_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut StepContext) -> Result<()> + Send + Sync + 'static,
    {
        self.step(FnStep(f))
    }

    /// Make this a job process. Adds the `options` input.
    pub fn job(mut self, job: JobSpec) -> Self {
        self.job = Some(job);
        let port = InputPort {
            name: OPTIONS_INPUT.to_string(),
            kind: ValueKind::Dict,
            required: true,
            non_db: true,
        };
        self.add_input(port, Self::plain_handler(OPTIONS_INPUT, true))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn input_port(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&OutputPort> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn outline_len(&self) -> usize {
        self.outline.len()
    }

    pub fn outline_step(&self, index: usize) -> Option<Arc<dyn OutlineStep>> {
        self.outline.get(index).cloned()
    }

    pub fn job_spec(&self) -> Option<&JobSpec> {
        self.job.as_ref()
    }

    pub fn is_job(&self) -> bool {
        self.job.is_some()
    }

    /// The (label, value) pairs to record for input `name`.
    pub fn record_input(&self, name: &str, value: &Value) -> Result<Vec<(String, Value)>> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| EngineError::UnknownInput(name.to_string()))?;
        handler(value)
    }

    /// Reject undeclared, missing or mistyped inputs.
    pub fn validate_inputs(&self, inputs: &Inputs) -> Result<(), EngineError> {
        if let Some(name) = inputs.keys().find(|n| self.input_port(n).is_none()) {
            return Err(EngineError::UnknownInput(name.clone()));
        }
        for port in &self.inputs {
            match inputs.get(&port.name) {
                None if port.required => return Err(EngineError::MissingInput(port.name.clone())),
                Some(value) if !port.kind.accepts(value) => {
                    return Err(EngineError::InputKind {
                        name: port.name.clone(),
                        expected: port.kind,
                        found: value.kind(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate_output(&self, label: &str, value: &Value) -> Result<(), EngineError> {
        let port = self
            .output_port(label)
            .ok_or_else(|| EngineError::UnknownOutput(label.to_string()))?;
        if !port.kind.accepts(value) {
            return Err(EngineError::OutputKind {
                name: label.to_string(),
                expected: port.kind,
                found: value.kind(),
            });
        }
        Ok(())
    }

    pub fn validate_outputs(&self, outputs: &Outputs) -> Result<(), EngineError> {
        for (label, value) in outputs {
            self.validate_output(label, value)?;
        }
        if let Some(port) = self
            .outputs
            .iter()
            .find(|p| p.required && !outputs.contains_key(&p.name))
        {
            return Err(EngineError::MissingOutput(port.name.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("outline", &self.outline.len())
            .field("job", &self.job.is_some())
            .finish()
    }
}
