//! # Events
//!
//! A binary flag in an event pool slot. State changes are slot-local: an
//! atomic word plus a per-slot notifier. Queries and waits never mutate the
//! state; only `signal` and `reset` do.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ember_core::wait::{WaitResult, WaitTimeout};
use ember_hal::{DeviceId, Result};

use crate::pool::{EventPool, PoolInner, Slot};

pub(crate) const EVENT_RESET: u32 = 0;
pub(crate) const EVENT_SIGNALED: u32 = 1;

// =============================================================================
// DESCRIPTOR
// =============================================================================

bitflags::bitflags! {
    /// Memory visibility scope of a signal or wait
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventScope: u32 {
        /// Visible within the sub-device
        const SUBDEVICE = 1 << 0;
        /// Visible across the device
        const DEVICE = 1 << 1;
        /// Visible to the host
        const HOST = 1 << 2;
    }
}

/// Event descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDesc {
    /// Slot to claim; `None` takes the first free one
    pub index: Option<u32>,
    /// Scope made visible when signaled
    pub signal: EventScope,
    /// Scope made visible after a wait
    pub wait: EventScope,
}

impl Default for EventDesc {
    fn default() -> Self {
        Self {
            index: None,
            signal: EventScope::HOST,
            wait: EventScope::HOST,
        }
    }
}

impl EventDesc {
    /// Claim a specific slot
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Set signal scope
    pub fn with_signal_scope(mut self, scope: EventScope) -> Self {
        self.signal = scope;
        self
    }

    /// Set wait scope
    pub fn with_wait_scope(mut self, scope: EventScope) -> Self {
        self.wait = scope;
        self
    }
}

/// Event status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Signaled
    Signaled,
    /// Not signaled yet
    NotReady,
}

// =============================================================================
// EVENT
// =============================================================================

struct EventInner {
    pool: Arc<PoolInner>,
    index: u32,
    desc: EventDesc,
}

impl EventInner {
    #[inline]
    fn slot(&self) -> &Slot {
        &self.pool.storage.slots[self.index as usize]
    }
}

impl Drop for EventInner {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Event handle
///
/// Cloning gives another handle to the same slot; the slot is released when
/// the last handle is dropped.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Create an event in a pool
    ///
    /// Events of an origin pool start reset. Events of an imported pool keep
    /// whatever state the shared slot holds.
    pub fn create(pool: &EventPool, desc: EventDesc) -> Result<Self> {
        let inner = pool.inner();
        let index = inner.claim(desc.index)?;
        let event = Self {
            inner: Arc::new(EventInner {
                pool: Arc::clone(inner),
                index,
                desc,
            }),
        };
        if !inner.is_imported() {
            event.reset();
        }
        log::trace!("Created event {}:{}", inner.id(), index);
        Ok(event)
    }

    /// Get slot index
    #[inline]
    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// Get owning pool ID
    #[inline]
    pub fn pool_id(&self) -> u64 {
        self.inner.pool.id()
    }

    /// Get owning context ID
    #[inline]
    pub fn context_id(&self) -> u64 {
        self.inner.pool.context.id()
    }

    /// Devices allowed to use the event; empty means every device
    pub fn devices(&self) -> &[DeviceId] {
        self.inner.pool.devices()
    }

    /// Check if `device` may signal or wait on the event
    pub fn is_usable_on(&self, device: DeviceId) -> bool {
        let devices = self.devices();
        devices.is_empty() || devices.contains(&device)
    }

    /// Get descriptor
    #[inline]
    pub fn desc(&self) -> &EventDesc {
        &self.inner.desc
    }

    /// Set the event, waking every waiter
    pub fn signal(&self) {
        let slot = self.inner.slot();
        slot.state.store(EVENT_SIGNALED, Ordering::Release);
        slot.notifier.notify_all();
    }

    /// Clear the event; resetting a reset event is a no-op
    pub fn reset(&self) {
        self.inner.slot().state.store(EVENT_RESET, Ordering::Release);
    }

    /// Non-blocking status query
    pub fn query_status(&self) -> EventStatus {
        if self.is_signaled() {
            EventStatus::Signaled
        } else {
            EventStatus::NotReady
        }
    }

    /// Check if signaled
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.inner.slot().state.load(Ordering::Acquire) == EVENT_SIGNALED
    }

    /// Block until signaled or the timeout elapses; never resets
    pub fn host_synchronize(&self, timeout: WaitTimeout) -> WaitResult {
        let slot = self.inner.slot();
        slot.notifier.wait_until(
            || slot.state.load(Ordering::Acquire) == EVENT_SIGNALED,
            timeout,
        )
    }

    /// Check whether two handles name the same slot storage
    pub fn same_slot(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner.pool.storage, &other.inner.pool.storage)
            && self.inner.index == other.inner.index
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("pool", &self.pool_id())
            .field("index", &self.index())
            .field("status", &self.query_status())
            .finish()
    }
}

static_assertions::assert_impl_all!(Event: Send, Sync);
