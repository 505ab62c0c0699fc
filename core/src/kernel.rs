//! # Kernel Contract
//!
//! Kernel compilation is out of scope: a kernel is an opaque object that
//! runs one work-group at a time against the context's memory. Arguments
//! are snapshotted when the launch is recorded, so later edits by the
//! caller never leak into an already recorded command.

use std::fmt;
use std::sync::Arc;

use ember_hal::{Error, GpuAddr, Result};

use crate::access::AccessTier;
use crate::memory::AddressSpace;

// =============================================================================
// GROUP COUNT
// =============================================================================

/// Number of work-groups in each dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCount {
    /// X dimension
    pub x: u32,
    /// Y dimension
    pub y: u32,
    /// Z dimension
    pub z: u32,
}

/// Size of a group count in memory (three little-endian u32)
pub const GROUP_COUNT_SIZE: u64 = 12;

impl GroupCount {
    /// Create a group count
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional launch
    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Total number of groups
    pub fn total(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Decode from the in-memory layout
    pub fn from_le_bytes(bytes: [u8; 12]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            x: word(0),
            y: word(4),
            z: word(8),
        }
    }

    /// Encode to the in-memory layout
    pub fn to_le_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.z.to_le_bytes());
        out
    }
}

// =============================================================================
// ARGUMENTS
// =============================================================================

/// One kernel argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    /// Pointer into the context's address space
    Buffer {
        /// Address
        addr: GpuAddr,
        /// Access tier the kernel uses
        tier: AccessTier,
    },
    /// Plain value bytes
    Value(Vec<u8>),
}

/// Ordered kernel arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer argument with exclusive access
    pub fn buffer(self, addr: GpuAddr) -> Self {
        self.buffer_with(addr, AccessTier::Exclusive)
    }

    /// Append a buffer argument with an explicit access tier
    pub fn buffer_with(mut self, addr: GpuAddr, tier: AccessTier) -> Self {
        self.args.push(KernelArg::Buffer { addr, tier });
        self
    }

    /// Append a u32 value argument
    pub fn value_u32(self, value: u32) -> Self {
        self.value(&value.to_le_bytes())
    }

    /// Append raw value bytes
    pub fn value(mut self, bytes: &[u8]) -> Self {
        self.args.push(KernelArg::Value(bytes.to_vec()));
        self
    }

    /// Get all arguments
    pub fn as_slice(&self) -> &[KernelArg] {
        &self.args
    }

    /// Iterate over buffer arguments
    pub fn buffers(&self) -> impl Iterator<Item = (GpuAddr, AccessTier)> + '_ {
        self.args.iter().filter_map(|a| match a {
            KernelArg::Buffer { addr, tier } => Some((*addr, *tier)),
            KernelArg::Value(_) => None,
        })
    }
}

// =============================================================================
// KERNEL
// =============================================================================

/// An executable kernel
pub trait Kernel: Send + Sync + fmt::Debug {
    /// Kernel name
    fn name(&self) -> &str;

    /// Run one work-group
    fn run_group(&self, launch: &mut LaunchContext<'_>) -> Result<()>;
}

/// Shared kernel handle
pub type KernelHandle = Arc<dyn Kernel>;

/// What a running work-group sees
pub struct LaunchContext<'a> {
    memory: &'a AddressSpace,
    args: &'a KernelArgs,
    group_id: [u32; 3],
    group_count: GroupCount,
}

impl<'a> LaunchContext<'a> {
    /// Build a launch context for one group
    pub fn new(
        memory: &'a AddressSpace,
        args: &'a KernelArgs,
        group_id: [u32; 3],
        group_count: GroupCount,
    ) -> Self {
        Self {
            memory,
            args,
            group_id,
            group_count,
        }
    }

    /// Current group ID
    #[inline]
    pub fn group_id(&self) -> [u32; 3] {
        self.group_id
    }

    /// Group count of the launch
    #[inline]
    pub fn group_count(&self) -> GroupCount {
        self.group_count
    }

    /// Get a buffer argument
    pub fn arg_buffer(&self, index: usize) -> Result<GpuAddr> {
        match self.args.as_slice().get(index) {
            Some(KernelArg::Buffer { addr, .. }) => Ok(*addr),
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Get a u32 value argument
    pub fn arg_u32(&self, index: usize) -> Result<u32> {
        match self.args.as_slice().get(index) {
            Some(KernelArg::Value(bytes)) if bytes.len() == 4 => {
                Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Device read
    pub fn read(&self, addr: GpuAddr, buf: &mut [u8]) -> Result<()> {
        self.memory.resolve(addr, buf.len() as u64)?.read_at(0, buf)
    }

    /// Device write
    pub fn write(&self, addr: GpuAddr, data: &[u8]) -> Result<()> {
        self.memory.resolve(addr, data.len() as u64)?.write_at(0, data)
    }

    /// Device read of a little-endian u32
    pub fn read_u32(&self, addr: GpuAddr) -> Result<u32> {
        self.memory.resolve(addr, 4)?.read_u32(0)
    }

    /// Device write of a little-endian u32
    pub fn write_u32(&self, addr: GpuAddr, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Device atomic add on a little-endian u32; returns the previous value
    pub fn atomic_add_u32(&self, addr: GpuAddr, value: u32) -> Result<u32> {
        self.memory.resolve(addr, 4)?.fetch_add_u32(0, value)
    }
}

impl fmt::Debug for LaunchContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchContext")
            .field("group_id", &self.group_id)
            .field("group_count", &self.group_count)
            .finish()
    }
}

/// Run every group of a launch in order
pub fn run_kernel(
    kernel: &dyn Kernel,
    memory: &AddressSpace,
    args: &KernelArgs,
    groups: GroupCount,
) -> Result<()> {
    for z in 0..groups.z {
        for y in 0..groups.y {
            for x in 0..groups.x {
                let mut launch = LaunchContext::new(memory, args, [x, y, z], groups);
                kernel.run_group(&mut launch)?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// CLOSURE KERNEL
// =============================================================================

/// Kernel backed by a closure
pub struct FnKernel<F> {
    name: String,
    body: F,
}

impl<F> FnKernel<F>
where
    F: Fn(&mut LaunchContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    /// Wrap a closure as a kernel handle
    pub fn new(name: &str, body: F) -> KernelHandle {
        Arc::new(Self {
            name: String::from(name),
            body,
        })
    }
}

impl<F> Kernel for FnKernel<F>
where
    F: Fn(&mut LaunchContext<'_>) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run_group(&self, launch: &mut LaunchContext<'_>) -> Result<()> {
        (self.body)(launch)
    }
}

impl<F> fmt::Debug for FnKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKernel").field("name", &self.name).finish()
    }
}
