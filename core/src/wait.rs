//! Wait Utilities
//!
//! Timeouts, wait results and the notifier every blocking host call is
//! built on.

use std::time::{Duration, Instant};

use ember_hal::{Error, Result};
use parking_lot::{Condvar, Mutex};

// ============================================================================
// Wait Result
// ============================================================================

/// Wait result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Wait completed successfully.
    Success,
    /// Wait timed out.
    Timeout,
}

impl WaitResult {
    /// Check if successful.
    pub fn is_success(&self) -> bool {
        *self == WaitResult::Success
    }

    /// Check if timed out.
    pub fn is_timeout(&self) -> bool {
        *self == WaitResult::Timeout
    }

    /// Convert to a `Result`, mapping a timeout to `Error::Timeout`.
    pub fn into_result(self) -> Result<()> {
        match self {
            WaitResult::Success => Ok(()),
            WaitResult::Timeout => Err(Error::Timeout),
        }
    }
}

// ============================================================================
// Wait Timeout
// ============================================================================

/// Wait timeout specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// No timeout (return immediately).
    None,
    /// Wait with timeout.
    Duration(Duration),
    /// Wait indefinitely.
    Infinite,
}

impl WaitTimeout {
    /// Create a timeout in milliseconds.
    pub fn millis(ms: u64) -> Self {
        WaitTimeout::Duration(Duration::from_millis(ms))
    }

    /// Create a timeout from a driver-style nanosecond count.
    ///
    /// `0` polls, `u64::MAX` waits forever.
    pub fn nanos(ns: u64) -> Self {
        match ns {
            0 => WaitTimeout::None,
            u64::MAX => WaitTimeout::Infinite,
            ns => WaitTimeout::Duration(Duration::from_nanos(ns)),
        }
    }

    /// Get duration or None for infinite.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            WaitTimeout::None => Some(Duration::ZERO),
            WaitTimeout::Duration(d) => Some(*d),
            WaitTimeout::Infinite => None,
        }
    }

    /// Check if infinite.
    pub fn is_infinite(&self) -> bool {
        matches!(self, WaitTimeout::Infinite)
    }

    /// Whatever is left of this timeout after time spent since `start`.
    pub fn remaining_since(&self, start: Instant) -> Self {
        match self {
            WaitTimeout::Duration(d) => match d.checked_sub(start.elapsed()) {
                Some(left) if !left.is_zero() => WaitTimeout::Duration(left),
                _ => WaitTimeout::None,
            },
            other => *other,
        }
    }

    /// Absolute deadline, or `None` to wait forever.
    ///
    /// A duration too large for `Instant` counts as infinite.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            WaitTimeout::None => Some(Instant::now()),
            WaitTimeout::Duration(d) => Instant::now().checked_add(*d),
            WaitTimeout::Infinite => None,
        }
    }
}

impl Default for WaitTimeout {
    fn default() -> Self {
        WaitTimeout::Infinite
    }
}

impl From<Duration> for WaitTimeout {
    fn from(d: Duration) -> Self {
        WaitTimeout::Duration(d)
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Condition notifier for host waits.
///
/// Writers publish their state change first and call [`Notifier::notify_all`]
/// second. Waiters evaluate their predicate under the notifier lock, so a
/// notification can never slip between the check and the sleep.
#[derive(Debug, Default)]
pub struct Notifier {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Notifier {
    /// Create a new notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `ready` returns true or the timeout elapses.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool, timeout: WaitTimeout) -> WaitResult {
        let deadline = timeout.deadline();
        let mut guard = self.lock.lock();
        loop {
            if ready() {
                return WaitResult::Success;
            }
            match deadline {
                None => self.cond.wait(&mut guard),
                Some(at) => {
                    if Instant::now() >= at {
                        return WaitResult::Timeout;
                    }
                    if self.cond.wait_until(&mut guard, at).timed_out() {
                        return if ready() {
                            WaitResult::Success
                        } else {
                            WaitResult::Timeout
                        };
                    }
                }
            }
        }
    }
}

static_assertions::assert_impl_all!(Notifier: Send, Sync);
