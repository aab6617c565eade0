// MIT/Apache2 License

//! Per-slot image provisioning.
//!
//! A swapchain slot is the driver's image plus the server-side resources
//! that let the server display and release it: a pixmap (imported DMA-buf
//! or shared-memory segment), a long-lived damage region and a
//! cross-process fence. Software chains without MIT-SHM get none of
//! those; their pixels travel by `PutImage`.

use crate::fence::ShmFence;
use crate::status::SwapchainError;
use crate::wsi::{CreatedImage, Device, Extent, ImageBacking, DRM_FORMAT_MOD_INVALID};
use crate::x11::{Connection, Pixmap, Region, ShmSeg, SyncFence, Window, X11Error};
use std::os::fd::OwnedFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32};

const BPP: u8 = 32;

/// One slot of the swapchain ring.
#[derive(Debug)]
pub(crate) struct ImageSlot<I> {
    /// The driver's image, handed back on finish.
    pub image: Option<I>,
    pub dma_buf_fd: Option<OwnedFd>,
    pub num_planes: u32,
    pub row_pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub sizes: [u32; 4],
    pub drm_modifier: u64,
    pub cpu_map: Option<NonNull<u8>>,

    pub pixmap: Pixmap,
    /// Long-lived damage region id; reused across presents.
    pub update_region: Region,
    /// Region id of the current damage, or zero for the whole image.
    pub update_area: AtomicU32,
    pub busy: AtomicBool,
    pub present_queued: AtomicBool,
    /// Serial of the last presentation of this slot.
    pub serial: AtomicU32,
    pub shm_fence: Option<ShmFence>,
    pub sync_fence: SyncFence,

    pub shmseg: ShmSeg,
    pub shmid: libc::c_int,
    pub shmaddr: Option<NonNull<u8>>,
}

// Raw mappings aside, every mutable field is an atomic; the mappings are
// only written by their owners (the driver and the kernel).
unsafe impl<I: Send> Send for ImageSlot<I> {}
unsafe impl<I: Send + Sync> Sync for ImageSlot<I> {}

/// Everything slot provisioning needs to know about its swapchain.
pub(crate) struct SlotContext<'a, C, D> {
    pub conn: &'a C,
    pub device: &'a D,
    pub window: Window,
    pub extent: Extent,
    pub depth: u8,
    pub software: bool,
    pub has_mit_shm: bool,
    pub has_dri3_modifiers: bool,
    pub backing: &'a ImageBacking,
}

/// Provision one slot. On failure everything the slot acquired so far is
/// released again before returning.
pub(crate) fn init<C: Connection, D: Device>(
    ctx: &SlotContext<'_, C, D>,
) -> Result<ImageSlot<D::Image>, SwapchainError> {
    let mut sysv: Option<(libc::c_int, NonNull<u8>)> = None;
    let created = if ctx.software && ctx.has_mit_shm {
        let mut alloc = |size: usize| {
            alloc_sysv_shm(size).map(|seg| {
                sysv = Some(seg);
                seg.1
            })
        };
        ctx.device.create_image(ctx.extent, ctx.backing, Some(&mut alloc))
    } else {
        ctx.device.create_image(ctx.extent, ctx.backing, None)
    }
    .map_err(|_| SwapchainError::OutOfHostMemory)?;

    let mut slot = ImageSlot::new(created, sysv);
    match provision(&mut slot, ctx) {
        Ok(()) => Ok(slot),
        Err(err) => {
            finish(&mut slot, ctx.conn, ctx.device);
            Err(err)
        }
    }
}

fn provision<C: Connection, D: Device>(
    slot: &mut ImageSlot<D::Image>,
    ctx: &SlotContext<'_, C, D>,
) -> Result<(), SwapchainError> {
    let conn = ctx.conn;
    let width = ctx.extent.width as u16;
    let height = ctx.extent.height as u16;

    slot.update_region = Region(generate_id(conn)?);
    checked(conn.xfixes_create_region(slot.update_region, &[]))?;

    if ctx.software && !ctx.has_mit_shm {
        // Plain CPU slot; the pixels travel by PutImage.
        return Ok(());
    }

    if ctx.software {
        slot.shmseg = ShmSeg(generate_id(conn)?);
        checked(conn.shm_attach(slot.shmseg, slot.shmid as u32, false))?;

        slot.pixmap = Pixmap(generate_id(conn)?);
        checked(conn.shm_create_pixmap(
            slot.pixmap,
            ctx.window,
            (slot.row_pitches[0] / 4) as u16,
            height,
            ctx.depth,
            slot.shmseg,
            0,
        ))?;
    } else {
        slot.pixmap = Pixmap(generate_id(conn)?);

        if slot.drm_modifier != DRM_FORMAT_MOD_INVALID {
            // An image with a modifier implies the server negotiated it.
            assert!(ctx.has_dri3_modifiers);

            let src = slot
                .dma_buf_fd
                .as_ref()
                .ok_or(SwapchainError::InitializationFailed)?;
            let mut fds = Vec::with_capacity(slot.num_planes as usize);
            for _ in 0..slot.num_planes {
                fds.push(
                    src.try_clone()
                        .map_err(|_| SwapchainError::OutOfHostMemory)?,
                );
            }

            checked(conn.dri3_pixmap_from_buffers(
                slot.pixmap,
                ctx.window,
                width,
                height,
                slot.row_pitches,
                slot.offsets,
                ctx.depth,
                BPP,
                slot.drm_modifier,
                fds,
            ))?;
        } else {
            // Without modifiers there is no way to express extra planes.
            assert_eq!(slot.num_planes, 1);

            let fd = slot
                .dma_buf_fd
                .as_ref()
                .ok_or(SwapchainError::InitializationFailed)?
                .try_clone()
                .map_err(|_| SwapchainError::OutOfHostMemory)?;

            checked(conn.dri3_pixmap_from_buffer(
                slot.pixmap,
                ctx.window,
                slot.sizes[0],
                width,
                height,
                slot.row_pitches[0] as u16,
                ctx.depth,
                BPP,
                fd,
            ))?;
        }
    }

    let (fence, fence_fd) =
        ShmFence::alloc().map_err(|_| SwapchainError::InitializationFailed)?;
    slot.sync_fence = SyncFence(generate_id(conn)?);
    checked(conn.dri3_fence_from_fd(slot.pixmap, slot.sync_fence, false, fence_fd))?;

    // The slot starts out acquirable.
    fence.trigger();
    slot.shm_fence = Some(fence);

    Ok(())
}

/// Release a slot's resources. Safe on partially provisioned slots; each
/// step stands on its own.
pub(crate) fn finish<C: Connection, D: Device>(
    slot: &mut ImageSlot<D::Image>,
    conn: &C,
    device: &D,
) {
    if slot.sync_fence != SyncFence(0) {
        let _ = conn.sync_destroy_fence(slot.sync_fence);
        slot.sync_fence = SyncFence(0);
    }
    slot.shm_fence = None;
    if slot.pixmap != Pixmap(0) {
        let _ = conn.free_pixmap(slot.pixmap);
        slot.pixmap = Pixmap(0);
    }
    if slot.update_region != Region(0) {
        let _ = conn.xfixes_destroy_region(slot.update_region);
        slot.update_region = Region(0);
    }
    if let Some(image) = slot.image.take() {
        device.destroy_image(image);
    }
    if let Some(addr) = slot.shmaddr.take() {
        unsafe {
            libc::shmdt(addr.as_ptr().cast());
        }
    }
}

impl<I> ImageSlot<I> {
    fn new(created: CreatedImage<I>, sysv: Option<(libc::c_int, NonNull<u8>)>) -> Self {
        let (shmid, shmaddr) = match sysv {
            Some((id, addr)) => (id, Some(addr)),
            None => (-1, None),
        };
        Self {
            image: Some(created.image),
            dma_buf_fd: created.dma_buf_fd,
            num_planes: created.num_planes,
            row_pitches: created.row_pitches,
            offsets: created.offsets,
            sizes: created.sizes,
            drm_modifier: created.drm_modifier,
            cpu_map: created.cpu_map,
            pixmap: Pixmap(0),
            update_region: Region(0),
            update_area: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            present_queued: AtomicBool::new(false),
            serial: AtomicU32::new(0),
            shm_fence: None,
            sync_fence: SyncFence(0),
            shmseg: ShmSeg(0),
            shmid,
            shmaddr,
        }
    }
}

#[inline]
fn generate_id<C: Connection>(conn: &C) -> Result<u32, SwapchainError> {
    conn.generate_id()
        .map_err(|_| SwapchainError::InitializationFailed)
}

#[inline]
fn checked(result: Result<(), X11Error>) -> Result<(), SwapchainError> {
    result.map_err(|_| SwapchainError::InitializationFailed)
}

/// Allocate a SysV segment for a software image. The segment is marked
/// for deletion right away so the kernel reaps it once the last
/// attachment (ours or the server's) detaches.
fn alloc_sysv_shm(size: usize) -> Option<(libc::c_int, NonNull<u8>)> {
    let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
    if shmid < 0 {
        return None;
    }

    let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
    unsafe {
        libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut());
    }
    if addr as isize == -1 {
        return None;
    }

    NonNull::new(addr.cast::<u8>()).map(|addr| (shmid, addr))
}
