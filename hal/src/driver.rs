//! # Driver
//!
//! The simulated platform: a fixed set of devices, their P2P topology, the
//! driver-wide IPC export table and a few policy knobs. A driver is shared
//! by every `Context` built on it, which is how two contexts stand in for two
//! processes talking to the same kernel driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::{Device, DeviceConfig};
use crate::error::{Error, Result};
use crate::ipc::IpcRegistry;
use crate::topology::{P2pProperties, PeerLink, Topology};
use crate::types::DeviceId;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Object IDs are unique across drivers
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// What `append` does on a closed command list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosedAppendPolicy {
    /// Accept the call, drop the command and log a warning
    #[default]
    Drop,
    /// Fail with `InvalidState`
    Reject,
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Devices, indexed by `DeviceId`
    pub devices: Vec<DeviceConfig>,
    /// P2P links between devices
    pub peer_links: Vec<PeerLink>,
    /// Append-after-close behavior
    pub closed_append_policy: ClosedAppendPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceConfig::default()],
            peer_links: Vec::new(),
            closed_append_policy: ClosedAppendPolicy::Drop,
        }
    }
}

impl DriverConfig {
    /// `count` default devices, all linked with atomics
    pub fn multi_device(count: u32) -> Self {
        let mut links = Vec::new();
        for a in 0..count {
            for b in (a + 1)..count {
                links.push(PeerLink::new(DeviceId(a), DeviceId(b)).with_atomics(true));
            }
        }
        Self {
            devices: (0..count).map(|_| DeviceConfig::default()).collect(),
            peer_links: links,
            closed_append_policy: ClosedAppendPolicy::Drop,
        }
    }

    /// Replace the device list
    pub fn with_devices(mut self, devices: Vec<DeviceConfig>) -> Self {
        self.devices = devices;
        self
    }

    /// Add a P2P link
    pub fn with_peer_link(mut self, link: PeerLink) -> Self {
        self.peer_links.push(link);
        self
    }

    /// Remove every P2P link
    pub fn without_peer_links(mut self) -> Self {
        self.peer_links.clear();
        self
    }

    /// Set append-after-close policy
    pub fn with_closed_append_policy(mut self, policy: ClosedAppendPolicy) -> Self {
        self.closed_append_policy = policy;
        self
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// A driver instance and its devices
#[derive(Debug)]
pub struct Driver {
    id: u64,
    devices: Vec<Device>,
    topology: Topology,
    closed_append_policy: ClosedAppendPolicy,
    ipc: IpcRegistry,
}

impl Driver {
    /// Bring up a driver from its configuration
    pub fn new(config: DriverConfig) -> Result<Arc<Self>> {
        if config.devices.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let count = config.devices.len() as u32;
        let topology = Topology::new(count, &config.peer_links)?;
        let id = NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed);
        let devices = config
            .devices
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| Device::new(DeviceId(i as u32), cfg))
            .collect();

        log::debug!(
            "Driver {} up: {} device(s), {} peer link(s)",
            id,
            count,
            topology.link_count()
        );

        Ok(Arc::new(Self {
            id,
            devices,
            topology,
            closed_append_policy: config.closed_append_policy,
            ipc: IpcRegistry::new(id),
        }))
    }

    /// Get driver ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get all devices
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Get a device by ID
    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices.get(id.index()).ok_or(Error::DeviceNotFound)
    }

    /// Number of devices
    #[inline]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Check whether two devices can access each other's memory
    pub fn can_access_peer(&self, a: DeviceId, b: DeviceId) -> Result<bool> {
        self.topology.can_access_peer(a, b)
    }

    /// Get P2P properties of a device pair
    pub fn p2p_properties(&self, a: DeviceId, b: DeviceId) -> Result<P2pProperties> {
        self.topology.p2p_properties(a, b)
    }

    /// Get append-after-close policy
    #[inline]
    pub fn closed_append_policy(&self) -> ClosedAppendPolicy {
        self.closed_append_policy
    }

    /// Get the IPC export table
    #[inline]
    pub fn ipc(&self) -> &IpcRegistry {
        &self.ipc
    }

    /// Allocate a process-unique object ID
    #[inline]
    pub fn allocate_id(&self) -> u64 {
        NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
    }
}

static_assertions::assert_impl_all!(Driver: Send, Sync);
