//! # Images
//!
//! Images are opaque to the host: their texels are only reachable through
//! image copy commands. Storage is a tightly packed device-local buffer,
//! row-major, `bytes_per_texel` bytes per texel.

use std::sync::Arc;

use ember_hal::{DeviceId, Error, Result};
use spin::Mutex;

use crate::context::Context;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Image descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels
    pub depth: u32,
    /// Bytes per texel
    pub bytes_per_texel: u32,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
            bytes_per_texel: 4,
        }
    }
}

impl ImageDesc {
    /// 2D image
    pub fn new_2d(width: u32, height: u32, bytes_per_texel: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
            bytes_per_texel,
        }
    }

    /// Size of the packed texel data
    pub fn size_bytes(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64 * self.bytes_per_texel as u64
    }

    /// Region covering the whole image
    pub fn full_region(&self) -> ImageRegion {
        ImageRegion::new(0, 0, 0, self.width, self.height, self.depth)
    }
}

/// A box of texels inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageRegion {
    /// Origin X
    pub x: u32,
    /// Origin Y
    pub y: u32,
    /// Origin Z
    pub z: u32,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels
    pub depth: u32,
}

impl ImageRegion {
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

    /// Number of texels
    pub fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Check if two regions have the same extent
    pub fn same_extent(&self, other: &ImageRegion) -> bool {
        self.width == other.width && self.height == other.height && self.depth == other.depth
    }

    fn fits(&self, desc: &ImageDesc) -> bool {
        self.x as u64 + self.width as u64 <= desc.width as u64
            && self.y as u64 + self.height as u64 <= desc.height as u64
            && self.z as u64 + self.depth as u64 <= desc.depth as u64
    }
}

// =============================================================================
// IMAGE
// =============================================================================

#[derive(Debug)]
struct ImageInner {
    id: u64,
    context_id: u64,
    device: DeviceId,
    desc: ImageDesc,
    texels: Mutex<Vec<u8>>,
}

/// A device image
#[derive(Debug, Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

impl Image {
    /// Create an image on a device
    pub fn create(context: &Context, device: DeviceId, desc: ImageDesc) -> Result<Self> {
        context.check_device(device)?;
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.bytes_per_texel == 0 {
            return Err(Error::InvalidParameter);
        }
        if desc.size_bytes() > crate::memory::MAX_ALLOCATION_SIZE {
            return Err(Error::OutOfMemory);
        }
        let id = context.driver().allocate_id();
        log::debug!("Creating image {} ({}x{}x{})", id, desc.width, desc.height, desc.depth);
        Ok(Self {
            inner: Arc::new(ImageInner {
                id,
                context_id: context.id(),
                device,
                desc,
                texels: Mutex::new(vec![0u8; desc.size_bytes() as usize]),
            }),
        })
    }

    /// Get image ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get owning context ID
    #[inline]
    pub fn context_id(&self) -> u64 {
        self.inner.context_id
    }

    /// Get device
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    /// Get descriptor
    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.inner.desc
    }

    /// Size in bytes of a region's packed texels
    pub fn region_size(&self, region: &ImageRegion) -> u64 {
        region.texel_count() * self.inner.desc.bytes_per_texel as u64
    }

    /// Fail with `InvalidParameter` unless `region` lies inside the image
    pub fn check_region(&self, region: &ImageRegion) -> Result<()> {
        if region.fits(&self.inner.desc) {
            Ok(())
        } else {
            Err(Error::InvalidParameter)
        }
    }

    fn rows(&self, region: &ImageRegion) -> impl Iterator<Item = (usize, usize)> {
        let desc = self.inner.desc;
        let bpt = desc.bytes_per_texel as usize;
        let row_len = region.width as usize * bpt;
        let region = *region;
        (0..region.depth).flat_map(move |dz| {
            (0..region.height).map(move |dy| {
                let z = (region.z + dz) as usize;
                let y = (region.y + dy) as usize;
                let start = ((z * desc.height as usize + y) * desc.width as usize
                    + region.x as usize)
                    * bpt;
                (start, row_len)
            })
        })
    }

    /// Read a region as packed texels
    pub fn read_region(&self, region: &ImageRegion) -> Result<Vec<u8>> {
        self.check_region(region)?;
        let texels = self.inner.texels.lock();
        let mut out = Vec::with_capacity(self.region_size(region) as usize);
        for (start, len) in self.rows(region) {
            out.extend_from_slice(&texels[start..start + len]);
        }
        Ok(out)
    }

    /// Write packed texels into a region
    pub fn write_region(&self, region: &ImageRegion, data: &[u8]) -> Result<()> {
        self.check_region(region)?;
        if data.len() as u64 != self.region_size(region) {
            return Err(Error::InvalidParameter);
        }
        let mut texels = self.inner.texels.lock();
        let mut consumed = 0;
        for (start, len) in self.rows(region) {
            texels[start..start + len].copy_from_slice(&data[consumed..consumed + len]);
            consumed += len;
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(Image: Send, Sync);
