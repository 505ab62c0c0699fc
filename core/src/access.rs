//! # Peer Access Checks
//!
//! Every command that touches memory is checked against the platform
//! before it is recorded. Three multi-device tiers are modeled, plus plain
//! single-device atomics:
//!
//! | tier               | device memory of a peer          | capability needed   |
//! |--------------------|----------------------------------|---------------------|
//! | `Exclusive`        | P2P access                       | `RW`                |
//! | `Atomic`           | P2P access + P2P atomics         | `ATOMIC`            |
//! | `Concurrent`       | P2P access                       | `CONCURRENT`        |
//! | `ConcurrentAtomic` | P2P access + P2P atomics         | `CONCURRENT_ATOMIC` |

use ember_hal::{DeviceId, Error, GpuAddr, MemoryAccessCapabilities, Result};

use crate::context::Context;
use crate::memory::MemoryKind;

/// How a device intends to access a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessTier {
    /// One writer at a time, serialized through events
    #[default]
    Exclusive,
    /// Atomic updates from this device only
    Atomic,
    /// Several devices touch disjoint parts without serialization
    Concurrent,
    /// Several devices atomically update the same location
    ConcurrentAtomic,
}

impl AccessTier {
    /// Capability the tier requires
    pub fn required_capability(&self) -> MemoryAccessCapabilities {
        match self {
            Self::Exclusive => MemoryAccessCapabilities::RW,
            Self::Atomic => MemoryAccessCapabilities::ATOMIC,
            Self::Concurrent => MemoryAccessCapabilities::CONCURRENT,
            Self::ConcurrentAtomic => MemoryAccessCapabilities::CONCURRENT_ATOMIC,
        }
    }

    /// Check if the tier issues atomics
    pub fn is_atomic(&self) -> bool {
        matches!(self, Self::Atomic | Self::ConcurrentAtomic)
    }
}

impl Context {
    /// Check that `device` may access `len` bytes at `addr` in `tier`
    pub fn check_peer_access(
        &self,
        device: DeviceId,
        addr: GpuAddr,
        len: u64,
        tier: AccessTier,
    ) -> Result<()> {
        let region = self.memory().resolve(addr, len)?;
        self.check_kind_access(device, region.kind(), tier)
    }

    /// Check that `device` may access memory of `kind` in `tier`
    pub fn check_kind_access(
        &self,
        device: DeviceId,
        kind: MemoryKind,
        tier: AccessTier,
    ) -> Result<()> {
        let accessor = self.driver().device(device)?;
        let required = tier.required_capability();

        let caps = match kind {
            MemoryKind::Host => accessor.memory_access().host,
            MemoryKind::Shared(owner) if owner == device => {
                accessor.memory_access().shared_single_device
            }
            MemoryKind::Shared(_) => accessor.memory_access().shared_cross_device,
            MemoryKind::Device(owner) if owner == device => accessor.memory_access().device,
            MemoryKind::Device(owner) => {
                let p2p = self.driver().p2p_properties(device, owner)?;
                if !p2p.access_supported {
                    log::warn!("{} has no P2P path to memory on {}", device, owner);
                    return Err(Error::PeerAccessDenied);
                }
                if tier.is_atomic() && !p2p.atomics_supported {
                    return Err(Error::CapabilityUnsupported);
                }
                self.driver().device(owner)?.memory_access().device
            }
        };

        if caps.contains(required) {
            Ok(())
        } else {
            Err(Error::CapabilityUnsupported)
        }
    }
}
