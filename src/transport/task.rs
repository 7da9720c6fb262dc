use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::transport::queue::TransportQueue;
use crate::transport::{AuthInfo, Transport, TransportSession};

/// How a task ended. Exactly one of these is produced per task.
#[derive(Debug)]
pub enum TaskResolution<T> {
    Done(T),
    Failed(anyhow::Error),
    Cancelled,
}

impl<T> TaskResolution<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskResolution::Cancelled)
    }

    /// Collapse into a `Result`, mapping cancellation to `None`.
    pub fn into_result(self) -> Option<Result<T>> {
        match self {
            TaskResolution::Done(value) => Some(Ok(value)),
            TaskResolution::Failed(err) => Some(Err(err)),
            TaskResolution::Cancelled => None,
        }
    }
}

/// An operation that needs exclusive use of a transport session.
#[async_trait]
pub trait TransportTask: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Perform the operation. Runs at most once per task; implementations
    /// that are not idempotent must guard against being re-run after a
    /// restart themselves.
    async fn execute(&self, session: &mut dyn TransportSession) -> Result<Self::Output>;
}

/// Handle to a spawned [`TransportTask`].
///
/// The request for a session is queued as soon as the task is spawned.
/// Cancelling before the session is granted withdraws the request. Once
/// `execute` is running, cancellation is cooperative: the operation is let
/// finish, its result is discarded, and the task resolves as cancelled.
/// Dropping the handle cancels the task.
pub struct Task<T> {
    name: &'static str,
    key: AuthInfo,
    cancel: CancellationToken,
    handle: JoinHandle<TaskResolution<T>>,
    _guard: DropGuard,
}

impl<T: Send + 'static> Task<T> {
    pub fn spawn<O>(
        queue: Arc<TransportQueue>,
        auth: AuthInfo,
        transport: Arc<dyn Transport>,
        op: O,
        cancel: CancellationToken,
    ) -> Self
    where
        O: TransportTask<Output = T>,
    {
        let name = op.name();
        let key = auth.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let lease = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(task = name, key = %auth, "Task withdrawn before a session was granted");
                    return TaskResolution::Cancelled;
                }
                lease = queue.request(&auth, &transport) => lease,
            };

            let mut lease = match lease {
                Ok(lease) => lease,
                Err(e) => return TaskResolution::Failed(e),
            };
            if token.is_cancelled() {
                return TaskResolution::Cancelled;
            }

            debug!(task = name, key = %auth, "Session granted");
            let result = match lease.session() {
                Ok(session) => op.execute(session).await,
                Err(e) => Err(e),
            };
            drop(lease);

            if token.is_cancelled() {
                debug!(task = name, key = %auth, "Discarding completion of cancelled task");
                return TaskResolution::Cancelled;
            }
            match result {
                Ok(value) => TaskResolution::Done(value),
                Err(e) => TaskResolution::Failed(e),
            }
        });

        Self {
            name,
            key,
            _guard: cancel.clone().drop_guard(),
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn key(&self) -> &AuthInfo {
        &self.key
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to resolve.
    pub async fn wait(self) -> TaskResolution<T> {
        let Task {
            name,
            handle,
            _guard,
            ..
        } = self;
        match handle.await {
            Ok(resolution) => resolution,
            Err(e) if e.is_cancelled() => TaskResolution::Cancelled,
            Err(e) => TaskResolution::Failed(anyhow!("task '{}' panicked: {}", name, e)),
        }
    }
}
