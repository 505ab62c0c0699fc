//! # Event Pools
//!
//! Fixed-capacity slot allocators. Slot state lives in an `EventStorage`
//! that IPC imports share; slot *claims* are per pool handle, so the origin
//! and an importer each decide which indices they hand out.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use ember_core::wait::Notifier;
use ember_core::Context;
use ember_hal::{DeviceId, Error, IpcHandle, IpcHandleKind, Result};
use spin::Mutex;

use crate::event::{Event, EventDesc, EVENT_RESET};

// =============================================================================
// DESCRIPTOR
// =============================================================================

bitflags::bitflags! {
    /// Event pool flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventPoolFlags: u32 {
        /// Events are visible to host queries and waits
        const HOST_VISIBLE = 1 << 0;
        /// Pool may be exported to another process
        const IPC = 1 << 1;
    }
}

/// Event pool descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPoolDesc {
    /// Number of slots
    pub count: u32,
    /// Flags
    pub flags: EventPoolFlags,
    /// Devices that may use the events; empty means every device
    pub devices: Vec<DeviceId>,
}

impl Default for EventPoolDesc {
    fn default() -> Self {
        Self {
            count: 1,
            flags: EventPoolFlags::HOST_VISIBLE,
            devices: Vec::new(),
        }
    }
}

impl EventPoolDesc {
    /// Set slot count
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Set flags
    pub fn with_flags(mut self, flags: EventPoolFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Restrict to a device set
    pub fn with_devices(mut self, devices: &[DeviceId]) -> Self {
        self.devices = devices.to_vec();
        self
    }
}

// =============================================================================
// STORAGE
// =============================================================================

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: AtomicU32,
    pub(crate) notifier: Notifier,
}

/// Signal storage shared by a pool and its IPC imports
#[derive(Debug)]
pub(crate) struct EventStorage {
    pub(crate) slots: Vec<Slot>,
    flags: EventPoolFlags,
    devices: Vec<DeviceId>,
}

impl EventStorage {
    fn new(count: u32, flags: EventPoolFlags, devices: Vec<DeviceId>) -> Self {
        Self {
            slots: (0..count)
                .map(|_| Slot {
                    state: AtomicU32::new(EVENT_RESET),
                    notifier: Notifier::new(),
                })
                .collect(),
            flags,
            devices,
        }
    }
}

// =============================================================================
// POOL
// =============================================================================

#[derive(Debug)]
struct PoolState {
    claimed: Vec<bool>,
    live: usize,
    destroyed: bool,
    export: Option<IpcHandle>,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    id: u64,
    pub(crate) context: Arc<Context>,
    pub(crate) storage: Arc<EventStorage>,
    imported: bool,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn new(context: &Arc<Context>, storage: Arc<EventStorage>, imported: bool) -> Arc<Self> {
        let capacity = storage.slots.len();
        Arc::new(Self {
            id: context.driver().allocate_id(),
            context: Arc::clone(context),
            storage,
            imported,
            state: Mutex::new(PoolState {
                claimed: vec![false; capacity],
                live: 0,
                destroyed: false,
                export: None,
            }),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn devices(&self) -> &[DeviceId] {
        &self.storage.devices
    }

    pub(crate) fn claim(&self, index: Option<u32>) -> Result<u32> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::InvalidState);
        }
        let index = match index {
            Some(i) => {
                if state.claimed.get(i as usize).copied().unwrap_or(true) {
                    return Err(Error::InvalidParameter);
                }
                i
            }
            None => state
                .claimed
                .iter()
                .position(|c| !c)
                .ok_or(Error::OutOfPoolCapacity)? as u32,
        };
        state.claimed[index as usize] = true;
        state.live += 1;
        Ok(index)
    }

    pub(crate) fn release(&self, index: u32) {
        let mut state = self.state.lock();
        if let Some(claimed) = state.claimed.get_mut(index as usize) {
            *claimed = false;
            state.live -= 1;
        }
    }

    #[inline]
    pub(crate) fn is_imported(&self) -> bool {
        self.imported
    }

    fn shut_down(&self, state: &mut PoolState) {
        state.destroyed = true;
        if let Some(handle) = state.export.take() {
            self.context.driver().ipc().revoke(handle.export_id());
        }
    }
}

/// A pool of events
#[derive(Debug)]
pub struct EventPool {
    inner: Arc<PoolInner>,
}

impl EventPool {
    /// Create a pool
    pub fn create(context: &Arc<Context>, desc: EventPoolDesc) -> Result<Self> {
        if desc.count == 0 {
            return Err(Error::InvalidParameter);
        }
        let mut devices = desc.devices;
        devices.sort();
        devices.dedup();
        for device in &devices {
            context.check_device(*device)?;
        }
        for (i, a) in devices.iter().enumerate() {
            for b in &devices[i + 1..] {
                if !context.driver().can_access_peer(*a, *b)? {
                    log::warn!("Event pool spans {} and {} without P2P", a, b);
                    return Err(Error::PeerAccessDenied);
                }
            }
        }

        let storage = Arc::new(EventStorage::new(desc.count, desc.flags, devices));
        let inner = PoolInner::new(context, storage, false);
        log::debug!(
            "Creating event pool {} ({} slots, {:?})",
            inner.id,
            desc.count,
            desc.flags
        );
        Ok(Self { inner })
    }

    /// Open a pool exported by another context
    pub fn open_ipc(context: &Arc<Context>, handle: &IpcHandle) -> Result<Self> {
        let object = context
            .driver()
            .ipc()
            .import(handle, IpcHandleKind::EventPool)?;
        let storage = object
            .downcast::<EventStorage>()
            .map_err(|_| Error::InvalidIpcHandle)?;
        let inner = PoolInner::new(context, storage, true);
        log::debug!(
            "Opened IPC event pool {} in context {}",
            inner.id,
            context.id()
        );
        Ok(Self { inner })
    }

    /// Export the pool; repeated calls return the same token
    pub fn ipc_handle(&self) -> Result<IpcHandle> {
        if self.inner.imported {
            return Err(Error::InvalidParameter);
        }
        if !self.inner.storage.flags.contains(EventPoolFlags::IPC) {
            return Err(Error::Unsupported);
        }
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return Err(Error::InvalidState);
        }
        if let Some(handle) = state.export {
            return Ok(handle);
        }
        let storage: Arc<EventStorage> = Arc::clone(&self.inner.storage);
        let handle = self.inner.context.driver().ipc().export(
            IpcHandleKind::EventPool,
            storage,
            self.capacity() as u64,
        );
        state.export = Some(handle);
        Ok(handle)
    }

    /// Create an event in this pool
    pub fn create_event(&self, desc: EventDesc) -> Result<Event> {
        Event::create(self, desc)
    }

    /// Destroy the pool; fails while events are alive
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.destroyed || state.live > 0 {
            return Err(Error::InvalidState);
        }
        self.inner.shut_down(&mut state);
        log::debug!("Destroying event pool {}", self.inner.id);
        Ok(())
    }

    /// Release an imported pool's mapping
    pub fn close_ipc(&self) -> Result<()> {
        if !self.inner.imported {
            return Err(Error::InvalidParameter);
        }
        self.destroy()
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    /// Get pool ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.inner.storage.slots.len()
    }

    /// Get flags
    pub fn flags(&self) -> EventPoolFlags {
        self.inner.storage.flags
    }

    /// Get the device set
    pub fn devices(&self) -> &[DeviceId] {
        self.inner.devices()
    }

    /// Check if this pool was opened from an IPC token
    pub fn is_imported(&self) -> bool {
        self.inner.imported
    }

    /// Number of live events
    pub fn live_events(&self) -> usize {
        self.inner.state.lock().live
    }

    /// Check if destroyed
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        if state.live > 0 {
            log::warn!(
                "Event pool {} dropped with {} live event(s)",
                self.inner.id,
                state.live
            );
        }
        self.inner.shut_down(&mut state);
        log::debug!("Destroying event pool {}", self.inner.id);
    }
}

static_assertions::assert_impl_all!(EventPool: Send, Sync);
