//! Serialized, multiplexed access to transport sessions.
//!
//! Each (credential, resource) key owns one slot guarded by a fair async
//! mutex, so requests for a key are granted one at a time in arrival order
//! and keys never wait on each other. The session opened for a key is kept
//! warm for `idle_timeout` after its last use and then closed.
//!
//! Every request draws a ticket before queueing. When opening a session
//! fails, all tickets drawn up to that point observe the failure; later
//! requests get a fresh attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::transport::{AuthInfo, Transport, TransportSession};

pub struct TransportQueue {
    slots: StdMutex<HashMap<AuthInfo, Arc<KeySlot>>>,
    idle_timeout: Duration,
}

struct KeySlot {
    tickets: AtomicU64,
    state: Arc<Mutex<SessionSlot>>,
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Box<dyn TransportSession>>,
    /// Bumped on every grant; an idle closer only fires if nobody used the
    /// session after it was scheduled.
    generation: u64,
    /// Tickets below this value fail with `failure`.
    failed_before: u64,
    failure: Option<String>,
}

impl TransportQueue {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<AuthInfo, Arc<KeySlot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, auth: &AuthInfo) -> Arc<KeySlot> {
        self.lock_slots()
            .entry(auth.clone())
            .or_insert_with(|| {
                Arc::new(KeySlot {
                    tickets: AtomicU64::new(0),
                    state: Arc::new(Mutex::new(SessionSlot::default())),
                })
            })
            .clone()
    }

    /// Wait for exclusive use of the session for `auth`, opening it through
    /// `transport` if none is open. The session is released when the
    /// returned lease is dropped. Dropping the future before it resolves
    /// withdraws the request.
    pub async fn request(
        &self,
        auth: &AuthInfo,
        transport: &Arc<dyn Transport>,
    ) -> Result<TransportLease> {
        let slot = self.slot(auth);
        let ticket = slot.tickets.fetch_add(1, Ordering::SeqCst);
        let mut guard = slot.state.clone().lock_owned().await;

        if ticket < guard.failed_before {
            return Err(EngineError::SessionOpen {
                key: auth.to_string(),
                reason: guard.failure.clone().unwrap_or_default(),
            }
            .into());
        }

        if guard.session.is_none() {
            debug!(key = %auth, "Opening transport session");
            match transport.open(auth).await {
                Ok(session) => guard.session = Some(session),
                Err(e) => {
                    let reason = format!("{:#}", e);
                    guard.failed_before = slot.tickets.load(Ordering::SeqCst);
                    guard.failure = Some(reason.clone());
                    warn!(key = %auth, error = %reason, "Failed to open transport session");
                    return Err(e.context(EngineError::SessionOpen {
                        key: auth.to_string(),
                        reason,
                    }));
                }
            }
        }

        guard.generation += 1;
        Ok(TransportLease {
            guard,
            state: slot.state.clone(),
            key: auth.clone(),
            idle_timeout: self.idle_timeout,
        })
    }

    /// Whether a session is currently open for `auth`. Waits for any
    /// in-flight lease on that key.
    pub async fn is_open(&self, auth: &AuthInfo) -> bool {
        let slot = match self.lock_slots().get(auth) {
            Some(slot) => slot.clone(),
            None => return false,
        };
        let state = slot.state.lock().await;
        state.session.is_some()
    }

    /// Close every open session. Used on engine shutdown.
    pub async fn close_all(&self) {
        let slots: Vec<(AuthInfo, Arc<KeySlot>)> = self
            .lock_slots()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, slot) in slots {
            let mut state = slot.state.lock().await;
            state.generation += 1;
            if let Some(mut session) = state.session.take() {
                debug!(key = %key, "Closing transport session");
                if let Err(e) = session.close().await {
                    warn!(key = %key, error = %format!("{:#}", e), "Failed to close transport session");
                }
            }
        }
    }
}

/// Exclusive use of one open session.
pub struct TransportLease {
    guard: OwnedMutexGuard<SessionSlot>,
    state: Arc<Mutex<SessionSlot>>,
    key: AuthInfo,
    idle_timeout: Duration,
}

impl TransportLease {
    pub fn key(&self) -> &AuthInfo {
        &self.key
    }

    pub fn session(&mut self) -> Result<&mut (dyn TransportSession + 'static)> {
        match self.guard.session.as_mut() {
            Some(session) => Ok(&mut **session),
            None => Err(anyhow!("transport session for {} is closed", self.key)),
        }
    }
}

impl Drop for TransportLease {
    fn drop(&mut self) {
        let generation = self.guard.generation;
        let state = self.state.clone();
        let key = self.key.clone();
        let idle = self.idle_timeout;

        // Outside a runtime the session simply stays open until close_all.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            tokio::time::sleep(idle).await;
            let mut slot = state.lock().await;
            if slot.generation != generation {
                return;
            }
            if let Some(mut session) = slot.session.take() {
                debug!(key = %key, "Closing idle transport session");
                if let Err(e) = session.close().await {
                    warn!(key = %key, error = %format!("{:#}", e), "Failed to close idle session");
                }
            }
        });
    }
}
