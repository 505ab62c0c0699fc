//! # Fences
//!
//! One-shot completion signal for a whole submission. A fence is bound to a
//! submission when it is passed to `execute_command_lists` and is signaled
//! by the queue worker once every command of that submission has run.
//! Reusing a fence requires an explicit `reset` in between.

use std::sync::Arc;
use std::time::Instant;

use ember_core::wait::{WaitResult, WaitTimeout};
use ember_hal::{Error, Result};
use parking_lot::{Condvar, Mutex};

use crate::queue::CommandQueue;

/// Fence status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The bound submission has completed
    Signaled,
    /// Not bound, or the bound submission is still pending
    NotReady,
}

#[derive(Debug, Default)]
struct FenceState {
    /// Submission sequence number this fence reports on
    bound: Option<u64>,
    signaled: bool,
}

#[derive(Debug)]
struct FenceInner {
    id: u64,
    queue_id: u64,
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// Fence handle
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Create a fence for a queue
    pub fn create(queue: &CommandQueue) -> Self {
        let id = queue.context().driver().allocate_id();
        log::debug!("Creating fence {} on queue {}", id, queue.id());
        Self {
            inner: Arc::new(FenceInner {
                id,
                queue_id: queue.id(),
                state: Mutex::new(FenceState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Get fence ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the queue the fence belongs to
    #[inline]
    pub fn queue_id(&self) -> u64 {
        self.inner.queue_id
    }

    /// Non-blocking status query
    pub fn query_status(&self) -> FenceStatus {
        if self.inner.state.lock().signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::NotReady
        }
    }

    /// Block until signaled or the timeout elapses
    pub fn host_synchronize(&self, timeout: WaitTimeout) -> WaitResult {
        let deadline = timeout.deadline();
        let mut state = self.inner.state.lock();
        while !state.signaled {
            match deadline {
                None => self.inner.cond.wait(&mut state),
                Some(at) => {
                    if Instant::now() >= at
                        || self.inner.cond.wait_until(&mut state, at).timed_out()
                    {
                        return if state.signaled {
                            WaitResult::Success
                        } else {
                            WaitResult::Timeout
                        };
                    }
                }
            }
        }
        WaitResult::Success
    }

    /// Return to the unbound, unsignaled state
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        *state = FenceState::default();
        log::trace!("Reset fence {}", self.inner.id);
    }

    /// Bind to submission `seq`; a fence must be reset before it is rebound
    pub(crate) fn bind(&self, seq: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.bound.is_some() || state.signaled {
            log::warn!("Fence {} reused without reset", self.inner.id);
            return Err(Error::InvalidState);
        }
        state.bound = Some(seq);
        Ok(())
    }

    /// Signal if still bound to `seq`
    pub(crate) fn complete(&self, seq: u64) {
        let mut state = self.inner.state.lock();
        if state.bound == Some(seq) {
            state.signaled = true;
            self.inner.cond.notify_all();
        }
    }
}

static_assertions::assert_impl_all!(Fence: Send, Sync);
