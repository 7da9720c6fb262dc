//! Table of currently executing processes.
//!
//! Every running process holds a [`Registration`]; dropping it removes the
//! process from the table and from its call stack, so the table cannot leak
//! entries whichever way a process ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;
use crate::records::RecordId;

/// Identity of a process. Equal to the id of its durable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u64);

impl From<RecordId> for Pid {
    fn from(id: RecordId) -> Self {
        Pid(id.0)
    }
}

impl From<Pid> for RecordId {
    fn from(pid: Pid) -> Self {
        RecordId(pid.0)
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical execution context. Processes awaited inline by a parent share
/// the parent's context; spawned processes get a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallContext(Uuid);

impl CallContext {
    pub fn new() -> Self {
        CallContext(Uuid::new_v4())
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Entry {
    spec: String,
    parent: Option<Pid>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    running: HashMap<Pid, Entry>,
    stacks: HashMap<CallContext, Vec<Pid>>,
}

/// Summary of one registered process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: Pid,
    pub spec: String,
    pub parent: Option<Pid>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `pid` and push it on the stack of `call`.
    pub fn enter(
        self: &Arc<Self>,
        pid: Pid,
        spec: &str,
        parent: Option<Pid>,
        call: CallContext,
        cancel: CancellationToken,
    ) -> Result<Registration, EngineError> {
        let mut inner = self.lock();
        if inner.running.contains_key(&pid) {
            return Err(EngineError::AlreadyRunning(pid));
        }
        if let Some(parent) = parent {
            if !inner.running.contains_key(&parent) {
                return Err(EngineError::ParentNotRegistered(parent));
            }
        }
        inner.running.insert(
            pid,
            Entry {
                spec: spec.to_string(),
                parent,
                cancel,
            },
        );
        inner.stacks.entry(call).or_default().push(pid);
        Ok(Registration {
            registry: self.clone(),
            pid,
            call,
        })
    }

    fn leave(&self, pid: Pid, call: CallContext) {
        let mut inner = self.lock();
        inner.running.remove(&pid);
        if let Some(stack) = inner.stacks.get_mut(&call) {
            if let Some(pos) = stack.iter().rposition(|p| *p == pid) {
                stack.remove(pos);
            }
            if stack.is_empty() {
                inner.stacks.remove(&call);
            }
        }
    }

    /// Innermost active process on `call`.
    pub fn current(&self, call: CallContext) -> Option<Pid> {
        self.lock().stacks.get(&call).and_then(|s| s.last().copied())
    }

    /// Active processes on `call`, outermost first.
    pub fn stack(&self, call: CallContext) -> Vec<Pid> {
        self.lock().stacks.get(&call).cloned().unwrap_or_default()
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        self.lock().running.contains_key(&pid)
    }

    pub fn running(&self) -> Vec<RunningProcess> {
        let mut list: Vec<RunningProcess> = self
            .lock()
            .running
            .iter()
            .map(|(pid, e)| RunningProcess {
                pid: *pid,
                spec: e.spec.clone(),
                parent: e.parent,
            })
            .collect();
        list.sort_by_key(|p| p.pid);
        list
    }

    /// Request cancellation of a running process. Returns false if it is
    /// not registered.
    pub fn cancel(&self, pid: Pid) -> bool {
        match self.lock().running.get(&pid) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.lock().running.values() {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().running.is_empty()
    }
}

/// Proof that a process is registered. Unregisters on drop.
pub struct Registration {
    registry: Arc<ProcessRegistry>,
    pid: Pid,
    call: CallContext,
}

impl Registration {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn call(&self) -> CallContext {
        self.call
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.leave(self.pid, self.call);
    }
}
