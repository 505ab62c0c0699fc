//! # Commands
//!
//! One closed sum type for every operation a command list can record.
//! Each command may also carry one event to signal once its effect is
//! globally visible and any number of events that must be signaled before
//! it starts.

use ember_core::{GroupCount, Image, ImageRegion, KernelArgs, KernelHandle, MemAdvice};
use ember_hal::GpuAddr;
use ember_sync::Event;

/// Largest fill pattern in bytes
pub const MAX_FILL_PATTERN: usize = 128;

// =============================================================================
// REGIONS
// =============================================================================

/// A box of bytes inside a pitched linear buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyRegion {
    /// Origin X in bytes
    pub x: u32,
    /// Origin row
    pub y: u32,
    /// Origin slice
    pub z: u32,
    /// Width in bytes
    pub width: u32,
    /// Rows
    pub height: u32,
    /// Slices
    pub depth: u32,
}

impl CopyRegion {
    /// Create a region
    pub const fn new(x: u32, y: u32, z: u32, width: u32, height: u32, depth: u32) -> Self {
        Self {
            x,
            y,
            z,
            width,
            height,
            depth,
        }
    }

    /// Check if two regions have the same extent
    pub fn same_extent(&self, other: &CopyRegion) -> bool {
        self.width == other.width && self.height == other.height && self.depth == other.depth
    }

    /// Check if the region holds no bytes
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }
}

/// A region of a pitched buffer at an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedRegion {
    /// Buffer base
    pub addr: GpuAddr,
    /// Region inside the buffer
    pub region: CopyRegion,
    /// Bytes per row
    pub pitch: u32,
    /// Bytes per slice; only read when the region spans slices
    pub slice_pitch: u32,
}

impl PitchedRegion {
    /// Create a pitched region
    pub const fn new(addr: GpuAddr, region: CopyRegion, pitch: u32, slice_pitch: u32) -> Self {
        Self {
            addr,
            region,
            pitch,
            slice_pitch,
        }
    }

    /// Check that rows fit their pitch and slices fit their slice pitch
    pub fn is_well_formed(&self) -> bool {
        let r = &self.region;
        let row_end = r.x as u64 + r.width as u64;
        if row_end > self.pitch as u64 {
            return false;
        }
        if r.z as u64 + r.depth as u64 > 1 {
            let slice_bytes = self.pitch as u64 * (r.y as u64 + r.height as u64);
            return self.slice_pitch as u64 >= slice_bytes;
        }
        true
    }

    /// Bytes from `addr` to one past the last byte touched
    pub fn extent(&self) -> u64 {
        let r = &self.region;
        if r.is_empty() {
            return 0;
        }
        self.row_offset(r.height - 1, r.depth - 1) + r.width as u64
    }

    /// Offset of row `row` of slice `slice`, both relative to the region
    pub fn row_offset(&self, row: u32, slice: u32) -> u64 {
        let r = &self.region;
        (r.z as u64 + slice as u64) * self.slice_pitch as u64
            + (r.y as u64 + row as u64) * self.pitch as u64
            + r.x as u64
    }
}

// =============================================================================
// IMAGE COPIES
// =============================================================================

/// The image copy directions
#[derive(Debug, Clone)]
pub enum ImageCopy {
    /// Image texels to linear memory
    ToMemory {
        /// Destination buffer
        dst: GpuAddr,
        /// Source image
        src: Image,
        /// Source region
        region: ImageRegion,
    },
    /// Linear memory to image texels
    FromMemory {
        /// Destination image
        dst: Image,
        /// Destination region
        region: ImageRegion,
        /// Source buffer
        src: GpuAddr,
    },
    /// Whole image to a same-shaped image
    ImageToImage {
        /// Destination image
        dst: Image,
        /// Source image
        src: Image,
    },
    /// Region of one image to a region of another
    Region {
        /// Destination image
        dst: Image,
        /// Destination region
        dst_region: ImageRegion,
        /// Source image
        src: Image,
        /// Source region
        src_region: ImageRegion,
    },
}

// =============================================================================
// COMMAND KIND
// =============================================================================

/// One kernel of a multi-kernel indirect launch
#[derive(Debug, Clone)]
pub struct IndirectLaunch {
    /// Kernel
    pub kernel: KernelHandle,
    /// Arguments
    pub args: KernelArgs,
}

/// What a command does
#[derive(Debug, Clone)]
pub enum CommandKind {
    /// Fill `size` bytes at `dst` with a repeating pattern
    MemoryFill {
        /// Destination
        dst: GpuAddr,
        /// Pattern, a power of two up to 128 bytes
        pattern: Vec<u8>,
        /// Bytes to fill
        size: u64,
    },
    /// Linear copy
    MemoryCopy {
        /// Destination
        dst: GpuAddr,
        /// Source
        src: GpuAddr,
        /// Bytes to copy
        size: u64,
    },
    /// Pitched region copy
    MemoryCopyRegion {
        /// Destination
        dst: PitchedRegion,
        /// Source
        src: PitchedRegion,
    },
    /// Image copy
    ImageCopy(ImageCopy),
    /// Kernel launch with a fixed group count
    LaunchKernel {
        /// Kernel
        kernel: KernelHandle,
        /// Group count
        groups: GroupCount,
        /// Arguments
        args: KernelArgs,
    },
    /// Kernel launch reading its group count from memory at execution time
    LaunchKernelIndirect {
        /// Kernel
        kernel: KernelHandle,
        /// Address of the group count
        groups: GpuAddr,
        /// Arguments
        args: KernelArgs,
    },
    /// Launch of up to `launches.len()` kernels, count and group counts read from memory
    LaunchMultipleKernelsIndirect {
        /// Kernels
        launches: Vec<IndirectLaunch>,
        /// Address of the u32 kernel count
        count: GpuAddr,
        /// Address of the group count array
        groups: GpuAddr,
    },
    /// Execution and memory barrier
    Barrier,
    /// Barrier limited to address ranges
    MemoryRangesBarrier {
        /// (address, size) ranges
        ranges: Vec<(GpuAddr, u64)>,
    },
    /// Signal an event
    SignalEvent(Event),
    /// Wait until all events are signaled
    WaitOnEvents(Vec<Event>),
    /// Reset an event when the queue reaches this command
    ResetEvent(Event),
    /// Prefetch a range to the device
    MemoryPrefetch {
        /// Address
        addr: GpuAddr,
        /// Size
        size: u64,
    },
    /// Memory advice for a shared range
    MemAdvise {
        /// Address
        addr: GpuAddr,
        /// Size
        size: u64,
        /// Advice
        advice: MemAdvice,
    },
}

impl CommandKind {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::MemoryFill { .. } => "MemoryFill",
            Self::MemoryCopy { .. } => "MemoryCopy",
            Self::MemoryCopyRegion { .. } => "MemoryCopyRegion",
            Self::ImageCopy(_) => "ImageCopy",
            Self::LaunchKernel { .. } => "LaunchKernel",
            Self::LaunchKernelIndirect { .. } => "LaunchKernelIndirect",
            Self::LaunchMultipleKernelsIndirect { .. } => "LaunchMultipleKernelsIndirect",
            Self::Barrier => "Barrier",
            Self::MemoryRangesBarrier { .. } => "MemoryRangesBarrier",
            Self::SignalEvent(_) => "SignalEvent",
            Self::WaitOnEvents(_) => "WaitOnEvents",
            Self::ResetEvent(_) => "ResetEvent",
            Self::MemoryPrefetch { .. } => "MemoryPrefetch",
            Self::MemAdvise { .. } => "MemAdvise",
        }
    }

    /// Check if this launches a kernel
    pub fn is_kernel_launch(&self) -> bool {
        matches!(
            self,
            Self::LaunchKernel { .. }
                | Self::LaunchKernelIndirect { .. }
                | Self::LaunchMultipleKernelsIndirect { .. }
        )
    }
}

// =============================================================================
// COMMAND
// =============================================================================

/// A recorded unit of work
#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    signal: Option<Event>,
    waits: Vec<Event>,
}

impl Command {
    /// Wrap a command kind with no events attached
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            signal: None,
            waits: Vec::new(),
        }
    }

    /// Fill with a single byte
    pub fn memory_fill(dst: GpuAddr, value: u8, size: u64) -> Self {
        Self::memory_fill_pattern(dst, &[value], size)
    }

    /// Fill with a repeating pattern
    pub fn memory_fill_pattern(dst: GpuAddr, pattern: &[u8], size: u64) -> Self {
        Self::new(CommandKind::MemoryFill {
            dst,
            pattern: pattern.to_vec(),
            size,
        })
    }

    /// Linear copy
    pub fn memory_copy(dst: GpuAddr, src: GpuAddr, size: u64) -> Self {
        Self::new(CommandKind::MemoryCopy { dst, src, size })
    }

    /// Pitched region copy
    pub fn memory_copy_region(dst: PitchedRegion, src: PitchedRegion) -> Self {
        Self::new(CommandKind::MemoryCopyRegion { dst, src })
    }

    /// Image copy
    pub fn image_copy(copy: ImageCopy) -> Self {
        Self::new(CommandKind::ImageCopy(copy))
    }

    /// Kernel launch
    pub fn launch_kernel(kernel: KernelHandle, groups: GroupCount, args: KernelArgs) -> Self {
        Self::new(CommandKind::LaunchKernel {
            kernel,
            groups,
            args,
        })
    }

    /// Indirect kernel launch
    pub fn launch_kernel_indirect(kernel: KernelHandle, groups: GpuAddr, args: KernelArgs) -> Self {
        Self::new(CommandKind::LaunchKernelIndirect {
            kernel,
            groups,
            args,
        })
    }

    /// Multi-kernel indirect launch
    pub fn launch_multiple_kernels_indirect(
        launches: Vec<IndirectLaunch>,
        count: GpuAddr,
        groups: GpuAddr,
    ) -> Self {
        Self::new(CommandKind::LaunchMultipleKernelsIndirect {
            launches,
            count,
            groups,
        })
    }

    /// Barrier
    pub fn barrier() -> Self {
        Self::new(CommandKind::Barrier)
    }

    /// Barrier over address ranges
    pub fn memory_ranges_barrier(ranges: &[(GpuAddr, u64)]) -> Self {
        Self::new(CommandKind::MemoryRangesBarrier {
            ranges: ranges.to_vec(),
        })
    }

    /// Signal an event
    pub fn signal_event(event: &Event) -> Self {
        Self::new(CommandKind::SignalEvent(event.clone()))
    }

    /// Wait on events
    pub fn wait_on_events(events: &[Event]) -> Self {
        Self::new(CommandKind::WaitOnEvents(events.to_vec()))
    }

    /// Reset an event
    pub fn reset_event(event: &Event) -> Self {
        Self::new(CommandKind::ResetEvent(event.clone()))
    }

    /// Prefetch
    pub fn memory_prefetch(addr: GpuAddr, size: u64) -> Self {
        Self::new(CommandKind::MemoryPrefetch { addr, size })
    }

    /// Memory advice
    pub fn mem_advise(addr: GpuAddr, size: u64, advice: MemAdvice) -> Self {
        Self::new(CommandKind::MemAdvise { addr, size, advice })
    }

    /// Signal `event` once this command completes
    pub fn with_signal(mut self, event: &Event) -> Self {
        self.signal = Some(event.clone());
        self
    }

    /// Do not start before all `events` are signaled
    pub fn with_waits(mut self, events: &[Event]) -> Self {
        self.waits.extend(events.iter().cloned());
        self
    }

    /// Get the kind
    #[inline]
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Get the completion event
    #[inline]
    pub fn signal(&self) -> Option<&Event> {
        self.signal.as_ref()
    }

    /// Get the start dependencies
    #[inline]
    pub fn waits(&self) -> &[Event] {
        &self.waits
    }

    /// Every event the command touches
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        let inner: &[Event] = match &self.kind {
            CommandKind::SignalEvent(e) | CommandKind::ResetEvent(e) => core::slice::from_ref(e),
            CommandKind::WaitOnEvents(events) => events,
            _ => &[],
        };
        self.signal.iter().chain(self.waits.iter()).chain(inner.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitched_region_extent() {
        let region = PitchedRegion::new(GpuAddr::new(0), CopyRegion::new(2, 1, 0, 4, 2, 1), 8, 0);
        assert!(region.is_well_formed());
        // Rows 1 and 2, bytes 2..6 of each.
        assert_eq!(region.row_offset(0, 0), 10);
        assert_eq!(region.row_offset(1, 0), 18);
        assert_eq!(region.extent(), 22);
    }

    #[test]
    fn test_pitched_region_slices() {
        let region = PitchedRegion::new(GpuAddr::new(0), CopyRegion::new(0, 0, 0, 4, 2, 2), 4, 8);
        assert!(region.is_well_formed());
        assert_eq!(region.extent(), 16);

        let cramped = PitchedRegion::new(GpuAddr::new(0), CopyRegion::new(0, 0, 0, 4, 2, 2), 4, 4);
        assert!(!cramped.is_well_formed());
        let wide = PitchedRegion::new(GpuAddr::new(0), CopyRegion::new(2, 0, 0, 4, 1, 1), 4, 0);
        assert!(!wide.is_well_formed());
    }

    #[test]
    fn test_empty_region() {
        let region = PitchedRegion::new(GpuAddr::new(0), CopyRegion::new(0, 0, 0, 0, 4, 1), 4, 0);
        assert_eq!(region.extent(), 0);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Command::barrier().kind().name(), "Barrier");
        assert_eq!(Command::memory_fill(GpuAddr::new(1), 0, 1).kind().name(), "MemoryFill");
        assert!(!Command::barrier().kind().is_kernel_launch());
    }
}
