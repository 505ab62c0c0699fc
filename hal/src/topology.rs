//! # Peer-to-Peer Topology
//!
//! Links are stored under an unordered key, so `can_access_peer(a, b)` and
//! `can_access_peer(b, a)` read the same entry and can never disagree.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::DeviceId;

// =============================================================================
// PEER LINK
// =============================================================================

/// A bidirectional P2P link between two devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    /// First endpoint
    pub a: DeviceId,
    /// Second endpoint
    pub b: DeviceId,
    /// Atomics across the link
    pub atomics: bool,
}

impl PeerLink {
    /// Create a link without atomic support
    pub const fn new(a: DeviceId, b: DeviceId) -> Self {
        Self {
            a,
            b,
            atomics: false,
        }
    }

    /// Set atomic support
    pub const fn with_atomics(mut self, atomics: bool) -> Self {
        self.atomics = atomics;
        self
    }

    fn key(&self) -> (DeviceId, DeviceId) {
        normalize(self.a, self.b)
    }
}

/// P2P properties between two devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct P2pProperties {
    /// Memory on one device is reachable from the other
    pub access_supported: bool,
    /// Atomic operations work across the link
    pub atomics_supported: bool,
}

#[inline]
fn normalize(a: DeviceId, b: DeviceId) -> (DeviceId, DeviceId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// =============================================================================
// TOPOLOGY
// =============================================================================

/// Symmetric link table for a fixed set of devices
#[derive(Debug, Clone, Default)]
pub struct Topology {
    device_count: u32,
    links: BTreeMap<(DeviceId, DeviceId), P2pProperties>,
}

impl Topology {
    /// Build a topology, rejecting links to unknown devices
    pub fn new(device_count: u32, links: &[PeerLink]) -> Result<Self> {
        let mut map = BTreeMap::new();
        for link in links {
            if link.a.0 >= device_count || link.b.0 >= device_count {
                log::warn!("Peer link {} <-> {} names an unknown device", link.a, link.b);
                return Err(Error::InvalidParameter);
            }
            if link.a == link.b {
                continue;
            }
            let entry = map.entry(link.key()).or_insert(P2pProperties::default());
            entry.access_supported = true;
            entry.atomics_supported |= link.atomics;
        }
        Ok(Self {
            device_count,
            links: map,
        })
    }

    /// Fully connected topology
    pub fn fully_connected(device_count: u32, atomics: bool) -> Self {
        let mut links = BTreeMap::new();
        for a in 0..device_count {
            for b in (a + 1)..device_count {
                links.insert(
                    (DeviceId(a), DeviceId(b)),
                    P2pProperties {
                        access_supported: true,
                        atomics_supported: atomics,
                    },
                );
            }
        }
        Self {
            device_count,
            links,
        }
    }

    fn check(&self, id: DeviceId) -> Result<()> {
        if id.0 < self.device_count {
            Ok(())
        } else {
            Err(Error::DeviceNotFound)
        }
    }

    /// Check whether `a` can access memory of `b` (and vice versa)
    pub fn can_access_peer(&self, a: DeviceId, b: DeviceId) -> Result<bool> {
        Ok(self.p2p_properties(a, b)?.access_supported)
    }

    /// Get the P2P properties of a device pair
    pub fn p2p_properties(&self, a: DeviceId, b: DeviceId) -> Result<P2pProperties> {
        self.check(a)?;
        self.check(b)?;
        if a == b {
            return Ok(P2pProperties {
                access_supported: true,
                atomics_supported: true,
            });
        }
        Ok(self
            .links
            .get(&normalize(a, b))
            .copied()
            .unwrap_or_default())
    }

    /// Number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}
