//! Per-endpoint request gate: a capacity-1 cooperative semaphore with
//! an explicit FIFO queue and deferred wake.
//!
//! Every in-flight request on an endpoint holds that endpoint's gate
//! for its full lifetime, which is what serialises the wire. The
//! subtle requirement is on release: the next awaiter must never be
//! resumed on the releasing call stack. Release therefore only hands
//! ownership to the head waiter through its wake channel - that
//! schedules the waiter on the event loop, and it runs on a later
//! tick, after the current stack unwinds and after any new acquirers
//! have taken their place in the queue. This is what keeps
//! event-handler → release → next-sensor → new-request chains bounded.

use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// The endpoint went offline while waiting; the queue was broken.
    #[error("endpoint gate broken: endpoint offline")]
    Offline,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct GateState {
    available: bool,
    broken: bool,
    next_awaiter_id: u64,
    queue: VecDeque<Waiter>,
}

struct GateShared {
    eid_hint: u8,
    state: Mutex<GateState>,
}

impl GateShared {
    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if state.broken {
            state.available = true;
            return;
        }
        loop {
            match state.queue.pop_front() {
                Some(waiter) => {
                    // Hand-off, not resumption: a successful send only
                    // schedules the waiter; it cannot run before this
                    // stack unwinds.
                    if waiter.tx.send(()).is_ok() {
                        trace!("[gate] eid={} handed off to awaiter {}", self.eid_hint, waiter.id);
                        return;
                    }
                    // Awaiter cancelled while queued; skip it without
                    // resuming anything.
                }
                None => {
                    state.available = true;
                    return;
                }
            }
        }
    }
}

/// The gate itself. Clone-cheap; all clones share one queue.
#[derive(Clone)]
pub struct EndpointGate {
    shared: Arc<GateShared>,
}

/// Ownership of the gate. Dropping the permit releases it.
pub struct GatePermit {
    shared: Arc<GateShared>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl EndpointGate {
    pub fn new(eid_hint: u8) -> Self {
        Self {
            shared: Arc::new(GateShared {
                eid_hint,
                state: Mutex::new(GateState {
                    available: true,
                    broken: false,
                    next_awaiter_id: 0,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Acquire the gate. Captures synchronously when free; otherwise
    /// parks in FIFO order. Dropping the returned future while queued
    /// is cancellation: the entry is skipped at release time without
    /// being resumed.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            if state.broken {
                return Err(GateError::Offline);
            }
            if state.available {
                state.available = false;
                return Ok(GatePermit {
                    shared: Arc::clone(&self.shared),
                });
            }
            let id = state.next_awaiter_id;
            state.next_awaiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { id, tx });
            debug!(
                "[gate] eid={} awaiter {} queued (depth {})",
                self.shared.eid_hint,
                id,
                state.queue.len()
            );
            rx
        };
        match rx.await {
            Ok(()) => Ok(GatePermit {
                shared: Arc::clone(&self.shared),
            }),
            // Sender dropped without a hand-off: the queue was broken.
            Err(_) => Err(GateError::Offline),
        }
    }

    /// Offline transition: fail every queued awaiter and refuse new
    /// acquires until `reopen`.
    pub fn break_waiters(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.broken = true;
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            debug!(
                "[gate] eid={} broke {} queued awaiters",
                self.shared.eid_hint, dropped
            );
        }
    }

    pub fn reopen(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.broken = false;
    }

    pub fn is_available(&self) -> bool {
        self.shared.state.lock().unwrap().available
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }
}
