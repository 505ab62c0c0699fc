//! # Context
//!
//! A context is the per-process root object. It holds the driver, owns the
//! process's address space and keeps track of the queues working on each
//! device so a system barrier can wait for all of them. Every command list,
//! queue and event pool is created against a context and carries an `Arc`
//! to it; nothing is reached through a global.

use std::sync::{Arc, Weak};
use std::time::Instant;

use ember_hal::{DeviceId, Driver, Error, GpuAddr, IpcHandle, IpcHandleKind, Result};
use spin::Mutex;

use crate::memory::{AddressSpace, AllocationInfo, Backing, MemoryKind};
use crate::wait::{WaitResult, WaitTimeout};

// =============================================================================
// DEVICE ACTIVITY
// =============================================================================

/// Something that executes work on a device and can be waited on
pub trait DeviceActivity: Send + Sync {
    /// Device the work runs on
    fn device(&self) -> DeviceId;

    /// Block until all accepted work has completed
    fn wait_idle(&self, timeout: WaitTimeout) -> WaitResult;
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Per-process driver context
pub struct Context {
    id: u64,
    driver: Arc<Driver>,
    memory: AddressSpace,
    activity: Mutex<Vec<Weak<dyn DeviceActivity>>>,
}

impl Context {
    /// Create a context on a driver
    pub fn new(driver: Arc<Driver>) -> Arc<Self> {
        let id = driver.allocate_id();
        log::debug!("Creating context {} on driver {}", id, driver.id());
        Arc::new(Self {
            id,
            driver,
            memory: AddressSpace::new(),
            activity: Mutex::new(Vec::new()),
        })
    }

    /// Get context ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the driver
    #[inline]
    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// Get the address space
    #[inline]
    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    /// Fail with `DeviceNotFound` unless the driver has this device
    pub fn check_device(&self, device: DeviceId) -> Result<()> {
        self.driver.device(device).map(|_| ())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate host memory
    pub fn alloc_host(&self, size: u64) -> Result<GpuAddr> {
        self.memory.allocate(MemoryKind::Host, size, 0)
    }

    /// Allocate device memory
    pub fn alloc_device(&self, device: DeviceId, size: u64) -> Result<GpuAddr> {
        self.check_device(device)?;
        self.memory.allocate(MemoryKind::Device(device), size, 0)
    }

    /// Allocate shared memory bound to a device
    pub fn alloc_shared(&self, device: DeviceId, size: u64) -> Result<GpuAddr> {
        self.check_device(device)?;
        self.memory.allocate(MemoryKind::Shared(device), size, 0)
    }

    /// Free an allocation; revokes its IPC export, if any
    pub fn free(&self, base: GpuAddr) -> Result<()> {
        if let Some(export_id) = self.memory.free(base)? {
            self.driver.ipc().revoke(export_id);
        }
        Ok(())
    }

    /// Host read
    pub fn read(&self, addr: GpuAddr, buf: &mut [u8]) -> Result<()> {
        self.memory.host_read(addr, buf)
    }

    /// Host write
    pub fn write(&self, addr: GpuAddr, data: &[u8]) -> Result<()> {
        self.memory.host_write(addr, data)
    }

    /// Get information about the allocation containing `addr`
    pub fn allocation(&self, addr: GpuAddr) -> Result<AllocationInfo> {
        self.memory.info(addr)
    }

    // =========================================================================
    // IPC memory
    // =========================================================================

    /// Export a device allocation; `base` must be the allocation's base
    pub fn ipc_memory_handle(&self, base: GpuAddr) -> Result<IpcHandle> {
        let (backing, export_id) = self.memory.export_source(base)?;
        let size = backing.size();
        if let Some(id) = export_id {
            self.driver.ipc().revoke(id);
        }
        let handle = self.driver.ipc().export(IpcHandleKind::Memory, backing, size);
        self.memory.set_export(base, handle.export_id())?;
        Ok(handle)
    }

    /// Map memory exported by another context
    pub fn open_ipc_memory(&self, handle: &IpcHandle) -> Result<GpuAddr> {
        let object = self.driver.ipc().import(handle, IpcHandleKind::Memory)?;
        let backing = object
            .downcast::<Backing>()
            .map_err(|_| Error::InvalidIpcHandle)?;
        let base = self.memory.map_import(backing);
        log::debug!("Context {} opened IPC memory at {}", self.id, base);
        Ok(base)
    }

    /// Unmap memory opened with [`Context::open_ipc_memory`]
    pub fn close_ipc_memory(&self, base: GpuAddr) -> Result<()> {
        self.memory.unmap_import(base)
    }

    // =========================================================================
    // Device activity
    // =========================================================================

    /// Track a queue for system barriers
    pub fn register_activity(&self, activity: Weak<dyn DeviceActivity>) {
        let mut list = self.activity.lock();
        list.retain(|w| w.strong_count() > 0);
        list.push(activity);
    }

    /// Wait until all work accepted on `device` has completed
    pub fn system_barrier(&self, device: DeviceId, timeout: WaitTimeout) -> Result<WaitResult> {
        self.check_device(device)?;
        let active: Vec<Arc<dyn DeviceActivity>> = self
            .activity
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|a| a.device() == device)
            .collect();

        let start = Instant::now();
        for activity in active {
            if activity.wait_idle(timeout.remaining_since(start)).is_timeout() {
                return Ok(WaitResult::Timeout);
            }
        }
        Ok(WaitResult::Success)
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("driver", &self.driver.id())
            .field("mappings", &self.memory.mapping_count())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for export_id in self.memory.export_ids() {
            self.driver.ipc().revoke(export_id);
        }
        log::debug!("Destroying context {}", self.id);
    }
}

static_assertions::assert_impl_all!(Context: Send, Sync);
