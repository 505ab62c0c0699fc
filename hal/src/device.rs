//! # Devices
//!
//! Per-device properties: engine counts (used to validate queue ordinals)
//! and the memory access capabilities advertised for each allocation type.

use crate::types::DeviceId;

// =============================================================================
// MEMORY ACCESS CAPABILITIES
// =============================================================================

bitflags::bitflags! {
    /// Memory access capabilities for one allocation type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAccessCapabilities: u32 {
        /// Plain reads and writes
        const RW = 1 << 0;
        /// Atomic operations from a single device
        const ATOMIC = 1 << 1;
        /// Concurrent access from several devices
        const CONCURRENT = 1 << 2;
        /// Concurrent atomic access from several devices
        const CONCURRENT_ATOMIC = 1 << 3;
    }
}

/// Capabilities of a device for each allocation type it can touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessProperties {
    /// Host allocations
    pub host: MemoryAccessCapabilities,
    /// Device allocations
    pub device: MemoryAccessCapabilities,
    /// Shared allocations bound to this device
    pub shared_single_device: MemoryAccessCapabilities,
    /// Shared allocations bound to another device
    pub shared_cross_device: MemoryAccessCapabilities,
}

impl MemoryAccessProperties {
    /// Every capability on every allocation type
    pub const fn full() -> Self {
        Self {
            host: MemoryAccessCapabilities::all(),
            device: MemoryAccessCapabilities::all(),
            shared_single_device: MemoryAccessCapabilities::all(),
            shared_cross_device: MemoryAccessCapabilities::all(),
        }
    }

    /// Reads and writes only
    pub const fn rw_only() -> Self {
        Self {
            host: MemoryAccessCapabilities::RW,
            device: MemoryAccessCapabilities::RW,
            shared_single_device: MemoryAccessCapabilities::RW,
            shared_cross_device: MemoryAccessCapabilities::RW,
        }
    }
}

impl Default for MemoryAccessProperties {
    fn default() -> Self {
        Self {
            host: MemoryAccessCapabilities::RW | MemoryAccessCapabilities::ATOMIC,
            device: MemoryAccessCapabilities::all(),
            shared_single_device: MemoryAccessCapabilities::RW
                | MemoryAccessCapabilities::ATOMIC
                | MemoryAccessCapabilities::CONCURRENT,
            shared_cross_device: MemoryAccessCapabilities::RW,
        }
    }
}

// =============================================================================
// DEVICE CONFIG
// =============================================================================

/// Configuration of one simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Marketing name
    pub name: String,
    /// Number of compute engines (compute queue ordinals)
    pub compute_engines: u32,
    /// Number of copy engines (copy queue ordinals)
    pub copy_engines: u32,
    /// Number of sub-devices
    pub sub_devices: u32,
    /// Memory access capabilities
    pub memory_access: MemoryAccessProperties,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::from("Ember Simulated GPU"),
            compute_engines: 2,
            copy_engines: 1,
            sub_devices: 0,
            memory_access: MemoryAccessProperties::default(),
        }
    }
}

impl DeviceConfig {
    /// Set name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Set engine counts
    pub fn with_engines(mut self, compute: u32, copy: u32) -> Self {
        self.compute_engines = compute;
        self.copy_engines = copy;
        self
    }

    /// Set sub-device count
    pub fn with_sub_devices(mut self, count: u32) -> Self {
        self.sub_devices = count;
        self
    }

    /// Set memory access capabilities
    pub fn with_memory_access(mut self, access: MemoryAccessProperties) -> Self {
        self.memory_access = access;
        self
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// A device enumerated by the driver
#[derive(Debug, Clone)]
pub struct Device {
    id: DeviceId,
    config: DeviceConfig,
}

impl Device {
    pub(crate) fn new(id: DeviceId, config: DeviceConfig) -> Self {
        Self { id, config }
    }

    /// Get device ID
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Get name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get number of compute engines
    #[inline]
    pub fn compute_engines(&self) -> u32 {
        self.config.compute_engines
    }

    /// Get number of copy engines
    #[inline]
    pub fn copy_engines(&self) -> u32 {
        self.config.copy_engines
    }

    /// Get number of sub-devices
    #[inline]
    pub fn sub_devices(&self) -> u32 {
        self.config.sub_devices
    }

    /// Get memory access capabilities
    #[inline]
    pub fn memory_access(&self) -> &MemoryAccessProperties {
        &self.config.memory_access
    }
}
