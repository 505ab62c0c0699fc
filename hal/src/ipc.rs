//! # IPC Tokens
//!
//! Cross-process sharing is capability based: the exporter registers an
//! object with the driver and receives a fixed-size token. The token is plain
//! bytes and may travel over any channel. An importer presents the bytes back
//! to the same driver to obtain the shared object.
//!
//! ## Token Layout
//!
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────────
//!      0     4  magic "EMBR"
//!      4     1  kind (1 = event pool, 2 = memory)
//!      5     3  reserved, zero
//!      8     8  driver id (LE)
//!     16     8  export id (LE)
//!     24     8  payload size (LE): pool slots or allocation bytes
//!     32    32  reserved, zero
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};

/// Size of an IPC token in bytes
pub const IPC_HANDLE_SIZE: usize = 64;

const IPC_MAGIC: [u8; 4] = *b"EMBR";

// =============================================================================
// TOKEN
// =============================================================================

/// Kind of object an IPC token refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcHandleKind {
    /// Event pool signal storage
    EventPool = 1,
    /// Device memory allocation
    Memory    = 2,
}

impl IpcHandleKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::EventPool),
            2 => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Opaque, fixed-size IPC token
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IpcHandle([u8; IPC_HANDLE_SIZE]);

impl IpcHandle {
    fn encode(kind: IpcHandleKind, driver_id: u64, export_id: u64, size: u64) -> Self {
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        bytes[0..4].copy_from_slice(&IPC_MAGIC);
        bytes[4] = kind as u8;
        bytes[8..16].copy_from_slice(&driver_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&export_id.to_le_bytes());
        bytes[24..32].copy_from_slice(&size.to_le_bytes());
        Self(bytes)
    }

    /// Parse a token received from another process
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; IPC_HANDLE_SIZE] =
            bytes.try_into().map_err(|_| Error::InvalidIpcHandle)?;
        if raw[0..4] != IPC_MAGIC || IpcHandleKind::from_raw(raw[4]).is_none() {
            return Err(Error::InvalidIpcHandle);
        }
        Ok(Self(raw))
    }

    /// Raw token bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.0
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[offset..offset + 8]);
        u64::from_le_bytes(word)
    }

    /// Get the object kind
    pub fn kind(&self) -> IpcHandleKind {
        // Tokens are only built by `encode` or validated by `from_bytes`.
        IpcHandleKind::from_raw(self.0[4]).unwrap_or(IpcHandleKind::Memory)
    }

    /// Get the issuing driver
    pub fn driver_id(&self) -> u64 {
        self.read_u64(8)
    }

    /// Get the export ID
    pub fn export_id(&self) -> u64 {
        self.read_u64(16)
    }

    /// Get the payload size
    pub fn size(&self) -> u64 {
        self.read_u64(24)
    }
}

impl core::fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcHandle")
            .field("kind", &self.kind())
            .field("driver", &self.driver_id())
            .field("export", &self.export_id())
            .field("size", &self.size())
            .finish()
    }
}

// =============================================================================
// EXPORT TABLE
// =============================================================================

struct Export {
    kind: IpcHandleKind,
    object: Arc<dyn Any + Send + Sync>,
}

/// Driver-wide table of exported objects
pub struct IpcRegistry {
    driver_id: u64,
    exports: Mutex<BTreeMap<u64, Export>>,
    next_id: Mutex<u64>,
}

impl IpcRegistry {
    /// Create an empty table for a driver
    pub fn new(driver_id: u64) -> Self {
        Self {
            driver_id,
            exports: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Export an object and get its token
    pub fn export(
        &self,
        kind: IpcHandleKind,
        object: Arc<dyn Any + Send + Sync>,
        size: u64,
    ) -> IpcHandle {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        self.exports.lock().insert(id, Export { kind, object });
        log::debug!("Exported IPC object {} ({:?}, {} bytes)", id, kind, size);
        IpcHandle::encode(kind, self.driver_id, id, size)
    }

    /// Look up the object behind a token
    pub fn import(
        &self,
        handle: &IpcHandle,
        kind: IpcHandleKind,
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        if handle.driver_id() != self.driver_id || handle.kind() != kind {
            return Err(Error::InvalidIpcHandle);
        }
        let exports = self.exports.lock();
        let export = exports
            .get(&handle.export_id())
            .ok_or(Error::InvalidIpcHandle)?;
        if export.kind != kind {
            return Err(Error::InvalidIpcHandle);
        }
        Ok(Arc::clone(&export.object))
    }

    /// Revoke an export; existing importers keep their mapping
    pub fn revoke(&self, export_id: u64) -> bool {
        let removed = self.exports.lock().remove(&export_id).is_some();
        if removed {
            log::debug!("Revoked IPC object {}", export_id);
        }
        removed
    }

    /// Number of live exports
    pub fn export_count(&self) -> usize {
        self.exports.lock().len()
    }
}

impl core::fmt::Debug for IpcRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcRegistry")
            .field("driver_id", &self.driver_id)
            .field("exports", &self.export_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(IpcRegistry: Send, Sync);
static_assertions::const_assert_eq!(IPC_HANDLE_SIZE, 64);
