// MIT/Apache2 License

//! The seam to the rest of the driver.
//!
//! Image memory, GPU fences and device quirks come from the generic
//! window-system-integration layer of the driver; the engine consumes
//! them through [`Device`]. Hardware images are exported as DMA-buf file
//! descriptors so the server can wrap them in pixmaps; software images
//! are plain CPU mappings, optionally placed in SysV shared memory via
//! the allocation hook.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use thiserror::Error;

/// A width and height in pixels.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// The DRM format modifier value meaning "no modifier negotiated".
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// How the backing memory of a swapchain image is to be allocated.
#[derive(Debug, Clone)]
pub enum ImageBacking {
    /// GPU memory exported as a DMA-buf.
    Drm {
        /// Whether the server's DRI3 device is the rendering device.
        /// Cross-device chains need an extra linear copy the driver takes
        /// care of internally.
        same_gpu: bool,
        /// Format-modifier tranches acceptable to the server, most
        /// preferred first. Empty when modifiers are not in play.
        modifier_lists: Vec<Vec<u64>>,
    },
    /// CPU memory for software rasterizers.
    Cpu {
        /// Whether the pixels should go through the shared-memory
        /// allocation hook so the server can map them directly.
        with_shm: bool,
    },
}

/// Allocation hook for CPU images placed in shared memory. Receives the
/// required size in bytes and returns the mapping, or `None` on failure.
pub type ShmAllocFn<'a> = &'a mut dyn FnMut(usize) -> Option<NonNull<u8>>;

/// A swapchain image created by the driver.
#[derive(Debug)]
pub struct CreatedImage<I> {
    /// The driver's image object, handed back on destruction.
    pub image: I,
    /// Exported DMA-buf; present exactly for hardware images.
    pub dma_buf_fd: Option<OwnedFd>,
    pub num_planes: u32,
    pub row_pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub sizes: [u32; 4],
    /// The negotiated format modifier, or [`DRM_FORMAT_MOD_INVALID`].
    pub drm_modifier: u64,
    /// CPU mapping; present exactly for software images.
    pub cpu_map: Option<NonNull<u8>>,
}

/// The driver could not allocate an image.
#[derive(Debug, Copy, Clone, Error)]
#[error("image allocation failed")]
pub struct AllocError;

/// Waiting on a GPU fence failed; the swapchain winds itself down.
#[derive(Debug, Copy, Clone, Error)]
#[error("fence wait failed")]
pub struct FenceError;

/// The driver device backing a presentation engine.
pub trait Device: Send + Sync + 'static {
    /// The driver's per-image object.
    type Image: Send + Sync + 'static;

    /// Whether this is a software rasterizer presenting CPU images.
    fn is_software(&self) -> bool;

    /// Whether the driver can allocate images with explicit format
    /// modifiers.
    fn supports_modifiers(&self) -> bool;

    /// Whether host memory can be imported as image memory; required for
    /// the shared-memory software path.
    fn has_host_memory_import(&self) -> bool;

    /// Whether the adaptive-sync window property should be set.
    fn enable_adaptive_sync(&self) -> bool;

    /// Whether `B8G8R8A8_UNORM` should be sorted first in the surface
    /// format list, for applications that blindly pick entry zero.
    fn force_bgra8_unorm_first(&self) -> bool {
        false
    }

    /// Whether the DRM device behind `fd` is the device this driver
    /// renders on.
    fn matches_drm_fd(&self, fd: BorrowedFd<'_>) -> bool;

    /// Allocate one swapchain image.
    fn create_image(
        &self,
        extent: Extent,
        backing: &ImageBacking,
        shm_alloc: Option<ShmAllocFn<'_>>,
    ) -> Result<CreatedImage<Self::Image>, AllocError>;

    /// Release an image previously returned by
    /// [`create_image`](Self::create_image).
    fn destroy_image(&self, image: Self::Image);

    /// Block until the GPU has finished rendering to the image in the
    /// given swapchain slot.
    fn wait_for_fence(&self, image_index: u32, timeout_ns: u64) -> Result<(), FenceError>;
}
