//! Per-host connection slots.
//!
//! The slot manager caps concurrent outbound connections per host
//! across every audit. Acquisition is FIFO-fair per host. A freed slot
//! is handed directly to the oldest waiter, so a caller that must not
//! block (the orchestrator thread answering a worker RPC) can park a
//! callback instead of waiting.

use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use tracing::trace;

enum Waiter {
    /// A blocked local thread waiting on a rendezvous channel.
    Local(SyncSender<()>),
    /// A parked grant callback (RPC acquisition path).
    Parked(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct HostState {
    in_use: usize,
    waiters: VecDeque<Waiter>,
}

/// Process-wide per-host connection limiter.
pub struct SlotManager {
    max_per_host: usize,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl SlotManager {
    /// Create a manager allowing `max_per_host` concurrent slots per
    /// host. A cap of zero is treated as one.
    pub fn new(max_per_host: usize) -> Self {
        Self {
            max_per_host: max_per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostState>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire a slot for `host`, blocking until one is free.
    pub fn acquire(self: &Arc<Self>, host: &str) -> Result<ConnectionSlot> {
        let receiver = {
            let mut hosts = self.lock();
            let state = hosts.entry(host.to_string()).or_default();
            if state.in_use < self.max_per_host {
                state.in_use += 1;
                trace!(host, in_use = state.in_use, "slot acquired");
                return Ok(ConnectionSlot::new(Arc::clone(self), host));
            }
            let (tx, rx) = sync_channel(1);
            state.waiters.push_back(Waiter::Local(tx));
            rx
        };

        receiver
            .recv()
            .map_err(|_| Error::Internal("slot manager dropped while waiting".to_string()))?;
        Ok(ConnectionSlot::new(Arc::clone(self), host))
    }

    /// Try to acquire a slot without blocking.
    pub fn try_acquire(self: &Arc<Self>, host: &str) -> Option<ConnectionSlot> {
        let mut hosts = self.lock();
        let state = hosts.entry(host.to_string()).or_default();
        if state.in_use < self.max_per_host {
            state.in_use += 1;
            Some(ConnectionSlot::new(Arc::clone(self), host))
        } else {
            None
        }
    }

    /// Acquire a slot, invoking `grant` when it is available:
    /// immediately, or later from the thread that releases a slot.
    /// The grantee owns the slot and must release it.
    pub fn acquire_with(&self, host: &str, grant: Box<dyn FnOnce() + Send>) {
        {
            let mut hosts = self.lock();
            let state = hosts.entry(host.to_string()).or_default();
            if state.in_use >= self.max_per_host {
                state.waiters.push_back(Waiter::Parked(grant));
                return;
            }
            state.in_use += 1;
        }
        // The grant never runs under the lock.
        grant();
    }

    /// Release a slot on `host`. Called by guards and by the RPC
    /// release path.
    pub fn release(&self, host: &str) {
        let handoff = {
            let mut hosts = self.lock();
            let Some(state) = hosts.get_mut(host) else {
                return;
            };
            match state.waiters.pop_front() {
                // The slot transfers to the waiter; in_use is unchanged.
                Some(waiter) => Some(waiter),
                None => {
                    state.in_use = state.in_use.saturating_sub(1);
                    if state.in_use == 0 && state.waiters.is_empty() {
                        hosts.remove(host);
                    }
                    None
                }
            }
        };

        match handoff {
            Some(Waiter::Local(tx)) => {
                // A dropped waiter (errored caller) just frees the slot.
                if tx.send(()).is_err() {
                    self.release(host);
                }
            }
            Some(Waiter::Parked(grant)) => grant(),
            None => {}
        }
    }

    /// Number of active slots on a host.
    pub fn active(&self, host: &str) -> usize {
        self.lock().get(host).map(|s| s.in_use).unwrap_or(0)
    }
}

/// RAII guard for one connection slot. Releases on drop, on every exit
/// path.
pub struct ConnectionSlot {
    manager: Arc<SlotManager>,
    host: String,
}

impl ConnectionSlot {
    fn new(manager: Arc<SlotManager>, host: &str) -> Self {
        Self {
            manager,
            host: host.to_string(),
        }
    }

    /// The host this slot is held on.
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.manager.release(&self.host);
    }
}
