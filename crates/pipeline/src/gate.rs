//! Dynamic-capacity worker gate.
//!
//! The logical cap is mutable at runtime (keyboard events), which rules out
//! a plain semaphore: permits would have to be clawed back. Instead the
//! gate keeps a small state block behind a mutex and broadcasts on every
//! change; waiters re-check the condition, exactly like a condition
//! variable. Shutdown wakes all waiters and makes them drop instead of
//! starting.

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Result of a thread-cap adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAdjust {
    pub old: u32,
    pub new: u32,
}

#[derive(Debug)]
struct GateState {
    max_threads: u32,
    active: u32,
    shutdown: bool,
}

/// Shared admission gate for worker jobs.
#[derive(Debug)]
pub struct WorkerGate {
    state: Mutex<GateState>,
    notify: Notify,
    runtime_max: u32,
}

impl WorkerGate {
    /// `initial_max` is clamped into `[1, runtime_max]`.
    pub fn new(initial_max: u32, runtime_max: u32) -> Arc<Self> {
        let runtime_max = runtime_max.max(1);
        Arc::new(Self {
            state: Mutex::new(GateState {
                max_threads: initial_max.clamp(1, runtime_max),
                active: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
            runtime_max,
        })
    }

    pub fn runtime_max(&self) -> u32 {
        self.runtime_max
    }

    pub fn max_threads(&self) -> u32 {
        self.state.lock().expect("gate lock").max_threads
    }

    pub fn active_count(&self) -> u32 {
        self.state.lock().expect("gate lock").active
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().expect("gate lock").shutdown
    }

    /// Wait for a slot. Returns `None` when shutdown was requested before a
    /// slot became available; the caller must then drop the job.
    pub async fn acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a broadcast between the
            // check and the await cannot be missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().expect("gate lock");
                if state.shutdown {
                    return None;
                }
                if state.active < state.max_threads {
                    state.active += 1;
                    return Some(SlotGuard {
                        gate: self.clone(),
                    });
                }
            }

            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock().expect("gate lock");
            state.active = state.active.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Move the cap by `delta`, clamped to `[1, runtime_max]`.
    pub fn adjust_max(&self, delta: i32) -> ThreadAdjust {
        let mut state = self.state.lock().expect("gate lock");
        let old = state.max_threads;
        let requested = (old as i64 + delta as i64).clamp(1, self.runtime_max as i64) as u32;
        state.max_threads = requested;
        drop(state);
        self.notify.notify_waiters();
        ThreadAdjust {
            old,
            new: requested,
        }
    }

    /// Toggle graceful shutdown. Returns the new state (true = shutting
    /// down).
    pub fn toggle_shutdown(&self) -> bool {
        let new_state = {
            let mut state = self.state.lock().expect("gate lock");
            state.shutdown = !state.shutdown;
            state.shutdown
        };
        self.notify.notify_waiters();
        new_state
    }

    /// Set shutdown unconditionally (immediate interrupt; not toggleable).
    pub fn force_shutdown(&self) {
        {
            let mut state = self.state.lock().expect("gate lock");
            state.shutdown = true;
        }
        self.notify.notify_waiters();
    }
}

/// An acquired worker slot; released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    gate: Arc<WorkerGate>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}
