//! # Execution Engine
//!
//! Carries out one command against the context's memory. Queues call into
//! this from their worker thread; nothing here blocks except event waits,
//! which are sliced so a dying queue can abandon them.

use std::sync::atomic::{AtomicBool, Ordering};

use ember_core::{run_kernel, Context, GroupCount, WaitTimeout, GROUP_COUNT_SIZE};
use ember_hal::{Error, GpuAddr, Result};
use ember_sync::Event;

use crate::command::{Command, CommandKind, ImageCopy, PitchedRegion};

/// How long one slice of a device-side event wait lasts
const WAIT_SLICE_MS: u64 = 2;

/// Result of executing one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Effect applied, signal event fired
    Completed,
    /// Effect failed; signal event not fired
    Faulted(Error),
    /// Queue shut down while the command was waiting
    Aborted,
}

enum Stop {
    Fault(Error),
    Aborted,
}

impl From<Error> for Stop {
    fn from(err: Error) -> Self {
        Stop::Fault(err)
    }
}

/// Executes commands for one queue
pub(crate) struct Engine<'a> {
    context: &'a Context,
    abort: &'a AtomicBool,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(context: &'a Context, abort: &'a AtomicBool) -> Self {
        Self { context, abort }
    }

    /// Run one command: wait for its dependencies, apply it, signal it
    pub(crate) fn execute(&self, command: &Command) -> Outcome {
        let result = self
            .wait_all(command.waits())
            .and_then(|()| self.apply(command.kind()));
        match result {
            Ok(()) => {
                if let Some(event) = command.signal() {
                    event.signal();
                }
                Outcome::Completed
            }
            Err(Stop::Fault(err)) => Outcome::Faulted(err),
            Err(Stop::Aborted) => Outcome::Aborted,
        }
    }

    fn wait_all(&self, events: &[Event]) -> core::result::Result<(), Stop> {
        for event in events {
            while !event
                .host_synchronize(WaitTimeout::millis(WAIT_SLICE_MS))
                .is_success()
            {
                if self.abort.load(Ordering::Acquire) {
                    return Err(Stop::Aborted);
                }
            }
        }
        Ok(())
    }

    fn apply(&self, kind: &CommandKind) -> core::result::Result<(), Stop> {
        let memory = self.context.memory();
        match kind {
            CommandKind::MemoryFill { dst, pattern, size } => {
                memory.resolve(*dst, *size)?.fill(pattern)?;
            }
            CommandKind::MemoryCopy { dst, src, size } => {
                let data = memory.resolve(*src, *size)?.read();
                memory.resolve(*dst, *size)?.write_at(0, &data)?;
            }
            CommandKind::MemoryCopyRegion { dst, src } => self.copy_region(dst, src)?,
            CommandKind::ImageCopy(copy) => self.copy_image(copy)?,
            CommandKind::LaunchKernel {
                kernel,
                groups,
                args,
            } => run_kernel(kernel.as_ref(), memory, args, *groups)?,
            CommandKind::LaunchKernelIndirect {
                kernel,
                groups,
                args,
            } => {
                let groups = self.read_groups(*groups)?;
                run_kernel(kernel.as_ref(), memory, args, groups)?;
            }
            CommandKind::LaunchMultipleKernelsIndirect {
                launches,
                count,
                groups,
            } => {
                let count = memory.resolve(*count, 4)?.read_u32(0)? as usize;
                for (i, launch) in launches.iter().take(count).enumerate() {
                    let at = groups.offset(i as u64 * GROUP_COUNT_SIZE);
                    let groups = self.read_groups(at)?;
                    run_kernel(launch.kernel.as_ref(), memory, &launch.args, groups)?;
                }
            }
            // The queue runs commands strictly in order, so a barrier only
            // has to confirm its ranges are still mapped.
            CommandKind::Barrier => {}
            CommandKind::MemoryRangesBarrier { ranges } => {
                for (addr, size) in ranges {
                    memory.resolve(*addr, *size)?;
                }
            }
            CommandKind::SignalEvent(event) => event.signal(),
            CommandKind::WaitOnEvents(events) => self.wait_all(events)?,
            CommandKind::ResetEvent(event) => event.reset(),
            CommandKind::MemoryPrefetch { addr, size } => {
                memory.resolve(*addr, *size)?;
                memory.prefetch(*addr)?;
            }
            CommandKind::MemAdvise { addr, size, advice } => {
                memory.resolve(*addr, *size)?;
                memory.advise(*addr, *advice)?;
            }
        }
        Ok(())
    }

    fn read_groups(&self, addr: GpuAddr) -> Result<GroupCount> {
        let mut raw = [0u8; GROUP_COUNT_SIZE as usize];
        self.context
            .memory()
            .resolve(addr, GROUP_COUNT_SIZE)?
            .read_at(0, &mut raw)?;
        Ok(GroupCount::from_le_bytes(raw))
    }

    fn copy_region(&self, dst: &PitchedRegion, src: &PitchedRegion) -> Result<()> {
        let memory = self.context.memory();
        let src_mem = memory.resolve(src.addr, src.extent())?;
        let dst_mem = memory.resolve(dst.addr, dst.extent())?;
        let width = src.region.width as usize;
        let mut row = vec![0u8; width];
        for slice in 0..src.region.depth {
            for y in 0..src.region.height {
                src_mem.read_at(src.row_offset(y, slice) as usize, &mut row)?;
                dst_mem.write_at(dst.row_offset(y, slice) as usize, &row)?;
            }
        }
        Ok(())
    }

    fn copy_image(&self, copy: &ImageCopy) -> Result<()> {
        let memory = self.context.memory();
        match copy {
            ImageCopy::ToMemory { dst, src, region } => {
                let texels = src.read_region(region)?;
                memory
                    .resolve(*dst, texels.len() as u64)?
                    .write_at(0, &texels)
            }
            ImageCopy::FromMemory { dst, region, src } => {
                let texels = memory.resolve(*src, dst.region_size(region))?.read();
                dst.write_region(region, &texels)
            }
            ImageCopy::ImageToImage { dst, src } => {
                let full = src.desc().full_region();
                let texels = src.read_region(&full)?;
                dst.write_region(&full, &texels)
            }
            ImageCopy::Region {
                dst,
                dst_region,
                src,
                src_region,
            } => {
                let texels = src.read_region(src_region)?;
                dst.write_region(dst_region, &texels)
            }
        }
    }
}
