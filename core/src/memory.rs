//! # Unified Memory
//!
//! Every context owns one GPU virtual address space. Allocations are
//! host, device or shared memory and are backed by a reference counted
//! byte store, so an IPC import can map the same store at another address
//! in another context.
//!
//! ```text
//!   AddressSpace (context A)          AddressSpace (context B)
//!   0x1_0000_0000 ─┐                  0x1_0000_0000 ─┐
//!                  ├──► Backing ◄─────────────────────┘ (imported)
//!   0x1_0001_1000 ─┘    (bytes)
//! ```
//!
//! Addresses are never reused, so a command that outlives its allocation
//! faults on lookup instead of touching a newer allocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use ember_hal::{DeviceId, Error, GpuAddr, Result};
use spin::{Mutex, RwLock};

/// Granularity of the address space
pub const PAGE_SIZE: u64 = 0x1000;

/// Largest single allocation
pub const MAX_ALLOCATION_SIZE: u64 = 1 << 32;

const ADDRESS_SPACE_BASE: u64 = 0x1_0000_0000;

// =============================================================================
// MEMORY KIND
// =============================================================================

/// Memory type of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Host memory, reachable from every device
    Host,
    /// Device-local memory, invisible to the host
    Device(DeviceId),
    /// Shared memory, migrates between host and its device
    Shared(DeviceId),
}

impl MemoryKind {
    /// Get the device the allocation is bound to
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Self::Host => None,
            Self::Device(d) | Self::Shared(d) => Some(*d),
        }
    }

    /// Check if the host can read and write it directly
    pub fn is_host_accessible(&self) -> bool {
        !matches!(self, Self::Device(_))
    }
}

/// Memory advice hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAdvice {
    /// Mostly read, rarely written
    SetReadMostly,
    /// Undo `SetReadMostly`
    ClearReadMostly,
    /// Prefer keeping the pages on a device
    SetPreferredLocation(DeviceId),
    /// Undo `SetPreferredLocation`
    ClearPreferredLocation,
}

// =============================================================================
// BACKING STORE
// =============================================================================

/// Byte storage behind one or more mappings
#[derive(Debug)]
pub struct Backing {
    kind: MemoryKind,
    size: u64,
    bytes: Mutex<Vec<u8>>,
}

impl Backing {
    fn new(kind: MemoryKind, size: u64) -> Self {
        Self {
            kind,
            size,
            bytes: Mutex::new(vec![0u8; size as usize]),
        }
    }

    /// Get memory kind
    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Get size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }
}

// =============================================================================
// REGION
// =============================================================================

/// A bounds-checked window into a backing store
#[derive(Debug, Clone)]
pub struct Region {
    backing: Arc<Backing>,
    offset: usize,
    len: usize,
}

impl Region {
    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Memory kind of the underlying allocation
    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.backing.kind
    }

    /// Check whether two regions share a backing store
    pub fn same_backing(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.backing, &other.backing)
    }

    fn span(&self, at: usize, len: usize) -> Result<core::ops::Range<usize>> {
        let end = at.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > self.len {
            return Err(Error::OutOfBounds);
        }
        Ok(self.offset + at..self.offset + end)
    }

    /// Copy the whole region out
    pub fn read(&self) -> Vec<u8> {
        let bytes = self.backing.bytes.lock();
        bytes[self.offset..self.offset + self.len].to_vec()
    }

    /// Read `buf.len()` bytes at a region-relative offset
    pub fn read_at(&self, at: usize, buf: &mut [u8]) -> Result<()> {
        let span = self.span(at, buf.len())?;
        buf.copy_from_slice(&self.backing.bytes.lock()[span]);
        Ok(())
    }

    /// Write `data` at a region-relative offset
    pub fn write_at(&self, at: usize, data: &[u8]) -> Result<()> {
        let span = self.span(at, data.len())?;
        self.backing.bytes.lock()[span].copy_from_slice(data);
        Ok(())
    }

    /// Fill the region by repeating `pattern`
    pub fn fill(&self, pattern: &[u8]) -> Result<()> {
        if pattern.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let mut bytes = self.backing.bytes.lock();
        let dst = &mut bytes[self.offset..self.offset + self.len];
        for (i, b) in dst.iter_mut().enumerate() {
            *b = pattern[i % pattern.len()];
        }
        Ok(())
    }

    /// Read a little-endian u32 at a region-relative offset
    pub fn read_u32(&self, at: usize) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_at(at, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Atomically add to a little-endian u32, returning the previous value
    ///
    /// The backing lock is held across the read and the write, so concurrent
    /// adds from several devices never lose an update.
    pub fn fetch_add_u32(&self, at: usize, value: u32) -> Result<u32> {
        let span = self.span(at, 4)?;
        let mut bytes = self.backing.bytes.lock();
        let word = &mut bytes[span];
        let old = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        word.copy_from_slice(&old.wrapping_add(value).to_le_bytes());
        Ok(old)
    }
}

// =============================================================================
// ALLOCATION INFO
// =============================================================================

/// Snapshot of an allocation's properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Base address
    pub base: GpuAddr,
    /// Size in bytes
    pub size: u64,
    /// Memory kind
    pub kind: MemoryKind,
    /// Mapped from another context through IPC
    pub imported: bool,
    /// Read-mostly advice in effect
    pub read_mostly: bool,
    /// Preferred location advice in effect
    pub preferred_location: Option<DeviceId>,
    /// Number of prefetches executed against it
    pub prefetch_count: u64,
}

#[derive(Debug)]
struct Mapping {
    backing: Arc<Backing>,
    imported: bool,
    export_id: Option<u64>,
    read_mostly: bool,
    preferred_location: Option<DeviceId>,
    prefetch_count: u64,
}

impl Mapping {
    fn new(backing: Arc<Backing>, imported: bool) -> Self {
        Self {
            backing,
            imported,
            export_id: None,
            read_mostly: false,
            preferred_location: None,
            prefetch_count: 0,
        }
    }
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

#[derive(Debug)]
struct SpaceInner {
    next_base: u64,
    mappings: BTreeMap<u64, Mapping>,
}

/// A context's unified virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    inner: RwLock<SpaceInner>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    /// Create an empty address space
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SpaceInner {
                next_base: ADDRESS_SPACE_BASE,
                mappings: BTreeMap::new(),
            }),
        }
    }

    fn map(&self, mapping: Mapping, alignment: u64) -> GpuAddr {
        let size = mapping.backing.size;
        let mut inner = self.inner.write();
        let base = GpuAddr::new(inner.next_base).align_up(alignment.max(PAGE_SIZE));
        // One unmapped guard page between allocations.
        inner.next_base = base
            .offset(size)
            .align_up(PAGE_SIZE)
            .offset(PAGE_SIZE)
            .raw();
        inner.mappings.insert(base.raw(), mapping);
        base
    }

    /// Allocate `size` bytes of `kind` memory
    pub fn allocate(&self, kind: MemoryKind, size: u64, alignment: u64) -> Result<GpuAddr> {
        if size == 0 || (alignment != 0 && !alignment.is_power_of_two()) {
            return Err(Error::InvalidParameter);
        }
        if size > MAX_ALLOCATION_SIZE {
            return Err(Error::OutOfMemory);
        }
        let backing = Arc::new(Backing::new(kind, size));
        let base = self.map(Mapping::new(backing, false), alignment);
        log::trace!("Allocated {:?} at {} ({} bytes)", kind, base, size);
        Ok(base)
    }

    /// Free an allocation by its base address; returns its IPC export, if any
    pub fn free(&self, base: GpuAddr) -> Result<Option<u64>> {
        let mut inner = self.inner.write();
        let imported = inner
            .mappings
            .get(&base.raw())
            .map(|m| m.imported)
            .ok_or(Error::InvalidGpuAddress)?;
        if imported {
            return Err(Error::InvalidParameter);
        }
        Ok(inner
            .mappings
            .remove(&base.raw())
            .and_then(|m| m.export_id))
    }

    /// Map an imported backing store
    pub fn map_import(&self, backing: Arc<Backing>) -> GpuAddr {
        self.map(Mapping::new(backing, true), 0)
    }

    /// Unmap an imported allocation by its base address
    pub fn unmap_import(&self, base: GpuAddr) -> Result<()> {
        let mut inner = self.inner.write();
        let imported = inner
            .mappings
            .get(&base.raw())
            .map(|m| m.imported)
            .ok_or(Error::InvalidGpuAddress)?;
        if !imported {
            return Err(Error::InvalidParameter);
        }
        inner.mappings.remove(&base.raw());
        Ok(())
    }

    fn with_mapping<R>(&self, addr: GpuAddr, f: impl FnOnce(u64, &Mapping) -> R) -> Result<R> {
        let inner = self.inner.read();
        let (base, mapping) = inner
            .mappings
            .range(..=addr.raw())
            .next_back()
            .ok_or(Error::InvalidGpuAddress)?;
        if addr.raw() >= base + mapping.backing.size {
            return Err(Error::InvalidGpuAddress);
        }
        Ok(f(*base, mapping))
    }

    fn with_mapping_mut<R>(
        &self,
        addr: GpuAddr,
        f: impl FnOnce(u64, &mut Mapping) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.write();
        let (base, mapping) = inner
            .mappings
            .range_mut(..=addr.raw())
            .next_back()
            .ok_or(Error::InvalidGpuAddress)?;
        if addr.raw() >= *base + mapping.backing.size {
            return Err(Error::InvalidGpuAddress);
        }
        Ok(f(*base, mapping))
    }

    /// Resolve `len` bytes at `addr` to a region of one allocation
    pub fn resolve(&self, addr: GpuAddr, len: u64) -> Result<Region> {
        let (base, backing) = self.with_mapping(addr, |base, m| (base, Arc::clone(&m.backing)))?;
        let offset = addr.raw() - base;
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > backing.size {
            return Err(Error::OutOfBounds);
        }
        Ok(Region {
            backing,
            offset: offset as usize,
            len: len as usize,
        })
    }

    /// Get information about the allocation containing `addr`
    pub fn info(&self, addr: GpuAddr) -> Result<AllocationInfo> {
        self.with_mapping(addr, |base, m| AllocationInfo {
            base: GpuAddr::new(base),
            size: m.backing.size,
            kind: m.backing.kind,
            imported: m.imported,
            read_mostly: m.read_mostly,
            preferred_location: m.preferred_location,
            prefetch_count: m.prefetch_count,
        })
    }

    /// Number of live mappings
    pub fn mapping_count(&self) -> usize {
        self.inner.read().mappings.len()
    }

    // =========================================================================
    // Host access
    // =========================================================================

    fn host_region(&self, addr: GpuAddr, len: u64) -> Result<Region> {
        let region = self.resolve(addr, len)?;
        if !region.kind().is_host_accessible() {
            return Err(Error::HostInaccessible);
        }
        Ok(region)
    }

    /// Host read
    pub fn host_read(&self, addr: GpuAddr, buf: &mut [u8]) -> Result<()> {
        self.host_region(addr, buf.len() as u64)?.read_at(0, buf)
    }

    /// Host write
    pub fn host_write(&self, addr: GpuAddr, data: &[u8]) -> Result<()> {
        self.host_region(addr, data.len() as u64)?.write_at(0, data)
    }

    // =========================================================================
    // Hints
    // =========================================================================

    /// Record advice for a shared allocation
    pub fn advise(&self, addr: GpuAddr, advice: MemAdvice) -> Result<()> {
        self.with_mapping_mut(addr, |_, m| {
            if !matches!(m.backing.kind, MemoryKind::Shared(_)) {
                return Err(Error::InvalidParameter);
            }
            match advice {
                MemAdvice::SetReadMostly => m.read_mostly = true,
                MemAdvice::ClearReadMostly => m.read_mostly = false,
                MemAdvice::SetPreferredLocation(d) => m.preferred_location = Some(d),
                MemAdvice::ClearPreferredLocation => m.preferred_location = None,
            }
            Ok(())
        })?
    }

    /// Record a prefetch
    pub fn prefetch(&self, addr: GpuAddr) -> Result<()> {
        self.with_mapping_mut(addr, |_, m| m.prefetch_count += 1)
    }

    // =========================================================================
    // IPC bookkeeping
    // =========================================================================

    /// Get the backing store and existing export of an exportable allocation
    pub(crate) fn export_source(&self, base: GpuAddr) -> Result<(Arc<Backing>, Option<u64>)> {
        let inner = self.inner.read();
        let mapping = inner
            .mappings
            .get(&base.raw())
            .ok_or(Error::InvalidGpuAddress)?;
        if mapping.imported || !matches!(mapping.backing.kind, MemoryKind::Device(_)) {
            return Err(Error::InvalidParameter);
        }
        Ok((Arc::clone(&mapping.backing), mapping.export_id))
    }

    pub(crate) fn set_export(&self, base: GpuAddr, export_id: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let mapping = inner
            .mappings
            .get_mut(&base.raw())
            .ok_or(Error::InvalidGpuAddress)?;
        mapping.export_id = Some(export_id);
        Ok(())
    }

    pub(crate) fn export_ids(&self) -> Vec<u64> {
        self.inner
            .read()
            .mappings
            .values()
            .filter_map(|m| m.export_id)
            .collect()
    }
}

static_assertions::assert_impl_all!(AddressSpace: Send, Sync);
static_assertions::assert_impl_all!(Region: Send, Sync);
