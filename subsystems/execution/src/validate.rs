//! # Append-Time Validation
//!
//! Everything that can be decided from the command and the platform is
//! decided here, before the command is recorded. Capability mismatches never
//! reach a queue.

use ember_core::{AccessTier, Context, Image, ImageRegion, MemoryKind, GROUP_COUNT_SIZE};
use ember_hal::{DeviceId, Error, GpuAddr, Result};
use ember_sync::Event;

use crate::command::{Command, CommandKind, ImageCopy, PitchedRegion, MAX_FILL_PATTERN};

/// Where a command is being recorded
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub(crate) context: &'a Context,
    pub(crate) device: DeviceId,
    pub(crate) copy_only: bool,
}

impl Target<'_> {
    /// Validate a command for this target
    pub(crate) fn check(&self, command: &Command) -> Result<()> {
        for event in command.events() {
            self.check_event(event)?;
        }
        if self.copy_only && command.kind().is_kernel_launch() {
            log::warn!(
                "{} rejected on a copy-only list",
                command.kind().name()
            );
            return Err(Error::Unsupported);
        }
        self.check_kind(command.kind())
    }

    fn check_event(&self, event: &Event) -> Result<()> {
        if event.context_id() != self.context.id() {
            return Err(Error::InvalidParameter);
        }
        if !event.is_usable_on(self.device) {
            log::warn!(
                "Event {}:{} is not shared with {}",
                event.pool_id(),
                event.index(),
                self.device
            );
            return Err(Error::PeerAccessDenied);
        }
        Ok(())
    }

    fn range(&self, addr: GpuAddr, size: u64, tier: AccessTier) -> Result<()> {
        self.context.check_peer_access(self.device, addr, size, tier)
    }

    fn pitched(&self, region: &PitchedRegion) -> Result<()> {
        if !region.is_well_formed() {
            return Err(Error::InvalidParameter);
        }
        self.range(region.addr, region.extent().max(1), AccessTier::Exclusive)
    }

    fn image(&self, image: &Image, region: &ImageRegion) -> Result<()> {
        if image.context_id() != self.context.id() {
            return Err(Error::InvalidParameter);
        }
        self.context.check_kind_access(
            self.device,
            MemoryKind::Device(image.device()),
            AccessTier::Exclusive,
        )?;
        image.check_region(region)
    }

    fn check_kind(&self, kind: &CommandKind) -> Result<()> {
        match kind {
            CommandKind::MemoryFill { dst, pattern, size } => {
                let len = pattern.len();
                if len == 0 || len > MAX_FILL_PATTERN || !len.is_power_of_two() {
                    return Err(Error::InvalidParameter);
                }
                self.range(*dst, *size, AccessTier::Exclusive)
            }
            CommandKind::MemoryCopy { dst, src, size } => {
                self.range(*dst, *size, AccessTier::Exclusive)?;
                self.range(*src, *size, AccessTier::Exclusive)
            }
            CommandKind::MemoryCopyRegion { dst, src } => {
                if !dst.region.same_extent(&src.region) {
                    return Err(Error::InvalidParameter);
                }
                self.pitched(dst)?;
                self.pitched(src)
            }
            CommandKind::ImageCopy(copy) => self.check_image_copy(copy),
            CommandKind::LaunchKernel { args, .. } => self.check_args(args),
            CommandKind::LaunchKernelIndirect { groups, args, .. } => {
                self.range(*groups, GROUP_COUNT_SIZE, AccessTier::Exclusive)?;
                self.check_args(args)
            }
            CommandKind::LaunchMultipleKernelsIndirect {
                launches,
                count,
                groups,
            } => {
                if launches.is_empty() {
                    return Err(Error::InvalidParameter);
                }
                self.range(*count, 4, AccessTier::Exclusive)?;
                self.range(
                    *groups,
                    GROUP_COUNT_SIZE * launches.len() as u64,
                    AccessTier::Exclusive,
                )?;
                launches.iter().try_for_each(|l| self.check_args(&l.args))
            }
            CommandKind::Barrier
            | CommandKind::SignalEvent(_)
            | CommandKind::WaitOnEvents(_)
            | CommandKind::ResetEvent(_) => Ok(()),
            CommandKind::MemoryRangesBarrier { ranges } => ranges
                .iter()
                .try_for_each(|(addr, size)| self.range(*addr, *size, AccessTier::Exclusive)),
            CommandKind::MemoryPrefetch { addr, size } => {
                self.range(*addr, *size, AccessTier::Exclusive)
            }
            CommandKind::MemAdvise { addr, size, .. } => {
                let region = self.context.memory().resolve(*addr, *size)?;
                if !matches!(region.kind(), MemoryKind::Shared(_)) {
                    return Err(Error::InvalidParameter);
                }
                Ok(())
            }
        }
    }

    fn check_args(&self, args: &ember_core::KernelArgs) -> Result<()> {
        args.buffers()
            .try_for_each(|(addr, tier)| self.range(addr, 1, tier))
    }

    fn check_image_copy(&self, copy: &ImageCopy) -> Result<()> {
        match copy {
            ImageCopy::ToMemory { dst, src, region } => {
                self.image(src, region)?;
                self.range(*dst, src.region_size(region), AccessTier::Exclusive)
            }
            ImageCopy::FromMemory { dst, region, src } => {
                self.image(dst, region)?;
                self.range(*src, dst.region_size(region), AccessTier::Exclusive)
            }
            ImageCopy::ImageToImage { dst, src } => {
                if dst.desc() != src.desc() {
                    return Err(Error::InvalidParameter);
                }
                self.image(dst, &dst.desc().full_region())?;
                self.image(src, &src.desc().full_region())
            }
            ImageCopy::Region {
                dst,
                dst_region,
                src,
                src_region,
            } => {
                if !dst_region.same_extent(src_region)
                    || dst.desc().bytes_per_texel != src.desc().bytes_per_texel
                {
                    return Err(Error::InvalidParameter);
                }
                self.image(dst, dst_region)?;
                self.image(src, src_region)
            }
        }
    }
}
