// MIT/Apache2 License

//! The swapchain: a fixed ring of presentable images, the per-chain
//! Present event loop and the queue-manager thread.
//!
//! Two threads cooperate over each chain. The application acquires and
//! presents; in the queued modes a worker drains the present queue,
//! paces fifo against the server's media stream counter and keeps the
//! acquire queue fed from idle notifications. All shared state is either
//! atomic or funneled through the sticky status latch.

use crate::engine::PresentEngine;
use crate::image::{self, ImageSlot, SlotContext};
use crate::options::Options;
use crate::probe::ConnectionCaps;
use crate::queue::{BoundedQueue, PullError, SENTINEL};
use crate::status::{Status, StatusLatch, SwapchainError};
use crate::surface::{PresentMode, Surface};
use crate::wsi::{Device, Extent, ImageBacking};
use crate::x11::{
    CompleteKind, CompleteMode, Connection, EventId, EventStream, Gcontext, PresentEvent,
    PresentPixmap, Readiness, Rectangle, Region, Window, EVENT_MASK_COMPLETE_NOTIFY,
    EVENT_MASK_CONFIGURE_NOTIFY, EVENT_MASK_IDLE_NOTIFY, EVENT_MASK_NO_EVENT,
    IMAGE_FORMAT_Z_PIXMAP, PRESENT_OPTION_ASYNC, PRESENT_OPTION_SUBOPTIMAL,
    PUT_IMAGE_HEADER_LEN,
};
use std::mem::ManuallyDrop;
use std::os::fd::AsFd;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tinyvec::ArrayVec;

/// Damage lists longer than this are ignored and the whole image is
/// presented instead.
const MAX_DAMAGE_RECTS: usize = 64;

/// Parameters for swapchain creation.
#[derive(Debug, Clone)]
pub struct SwapchainCreateInfo {
    /// The image count the application asked for; the engine may raise it
    /// depending on mode and options.
    pub min_image_count: u32,
    /// The image size, locked for the life of the chain.
    pub extent: Extent,
    pub present_mode: PresentMode,
}

/// A damage rectangle handed to present, in image coordinates.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RectLayer {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Always zero; single-layer images only.
    pub layer: u32,
}

/// A successful acquire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The chain still works but no longer matches the surface.
    pub suboptimal: bool,
}

struct ChainInner<C: Connection, D: Device> {
    engine: Arc<PresentEngine<D>>,
    conn: Arc<C>,
    device: Arc<D>,

    window: Window,
    gc: Gcontext,
    depth: u8,
    extent: Extent,
    present_mode: PresentMode,
    software: bool,
    has_dri3_modifiers: bool,
    has_mit_shm: bool,

    event_id: EventId,
    events: ManuallyDrop<C::Events>,

    images: Box<[ImageSlot<D::Image>]>,

    /// Serial of the most recently issued presentation.
    send_sbc: AtomicU64,
    /// Most recent media-stream counter reported by the server.
    last_present_msc: AtomicU64,
    /// Images currently owned by the server.
    sent_image_count: AtomicU32,
    status: StatusLatch,
    /// Latched once a presentation flips; later copies report suboptimal.
    copy_is_suboptimal: AtomicBool,

    present_queue: Option<BoundedQueue>,
    acquire_queue: Option<BoundedQueue>,
}

/// A swapchain bound to one window.
///
/// Dropping the chain shuts the worker down, releases every per-image
/// server resource and unselects Present events.
pub struct Swapchain<C: Connection, D: Device> {
    inner: Arc<ChainInner<C, D>>,
    worker: Option<JoinHandle<()>>,
}

impl<C: Connection, D: Device> std::fmt::Debug for Swapchain<C, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain").finish_non_exhaustive()
    }
}

/// Whether buffers must be fence-waited before submission to the server.
/// Mailbox needs it so the newest queued image is fully rendered at pick
/// time; immediate under XWayland works like mailbox on the Wayland side.
fn needs_wait_for_fences(
    options: &Options,
    caps: Option<&ConnectionCaps>,
    present_mode: PresentMode,
) -> bool {
    let Some(caps) = caps else { return false };
    if caps.is_xwayland && !options.xwayland_wait_ready {
        return false;
    }
    match present_mode {
        PresentMode::Mailbox => true,
        PresentMode::Immediate => caps.is_xwayland,
        _ => false,
    }
}

fn check_dri3_compatible<C: Connection, D: Device>(conn: &C, device: &D) -> bool {
    let setup = conn.setup();
    let Some(screen) = setup.roots.first() else {
        return true;
    };
    // No device from the server means we assume ours is compatible.
    match conn.dri3_open(screen.root, 0) {
        Ok(fd) => device.matches_drm_fd(fd.as_fd()),
        Err(_) => true,
    }
}

/// The modifier tranches acceptable for new pixmaps on this window:
/// window-specific ones first, then the screen-wide list.
fn dri3_modifier_lists<C: Connection>(
    conn: &C,
    caps: &ConnectionCaps,
    window: Window,
    depth: u8,
    bpp: u8,
) -> Vec<Vec<u64>> {
    if !caps.has_dri3_modifiers {
        return Vec::new();
    }
    match conn.dri3_get_supported_modifiers(window, depth, bpp) {
        Ok(mods) => {
            let mut lists = Vec::new();
            if !mods.window.is_empty() {
                lists.push(mods.window);
            }
            if !mods.screen.is_empty() {
                lists.push(mods.screen);
            }
            lists
        }
        Err(_) => Vec::new(),
    }
}

impl<D: Device> PresentEngine<D> {
    /// Create a swapchain for the surface.
    pub fn create_swapchain<C: Connection>(
        self: &Arc<Self>,
        surface: &Surface<C>,
        info: &SwapchainCreateInfo,
    ) -> Result<Swapchain<C, D>, SwapchainError> {
        Swapchain::new(self.clone(), surface, info)
    }
}

impl<C: Connection, D: Device> Swapchain<C, D> {
    fn new(
        engine: Arc<PresentEngine<D>>,
        surface: &Surface<C>,
        info: &SwapchainCreateInfo,
    ) -> Result<Self, SwapchainError> {
        let conn = surface.connection().clone();
        let device = engine.device().clone();
        let window = surface.window();

        let caps = engine
            .connection_caps(&*conn)
            .ok_or(SwapchainError::OutOfHostMemory)?;
        let options = engine.options();
        let software = device.is_software();

        // The image count depends on the request, the device and the
        // presentation mode.
        let mut image_count = info.min_image_count;
        if options.strict_image_count {
            // Exactly what was asked for.
        } else if needs_wait_for_fences(options, Some(&caps), info.present_mode) {
            // The early fence wait lengthens the pipeline; five images
            // keep it from starving.
            image_count = image_count.max(5);
        } else if options.ensure_min_image_count {
            image_count = image_count.max(engine.min_image_count());
        }
        assert!(image_count > 0);

        let geometry = conn
            .get_geometry(window)
            .map_err(|_| SwapchainError::SurfaceLost)?;
        let depth = geometry.depth;

        let backing = if software {
            ImageBacking::Cpu {
                with_shm: caps.has_mit_shm,
            }
        } else {
            let modifier_lists = if device.supports_modifiers() {
                dri3_modifier_lists(&*conn, &caps, window, depth, 32)
            } else {
                Vec::new()
            };
            ImageBacking::Drm {
                same_gpu: check_dri3_compatible(&*conn, &*device),
                modifier_lists,
            }
        };

        // Register for the three Present events the chain lives on:
        // configure (window resized), complete (image hit the screen) and
        // idle (image reusable).
        let event_id = EventId(
            conn.generate_id()
                .map_err(|_| SwapchainError::InitializationFailed)?,
        );
        conn.present_select_input(
            event_id,
            window,
            EVENT_MASK_CONFIGURE_NOTIFY | EVENT_MASK_COMPLETE_NOTIFY | EVENT_MASK_IDLE_NOTIFY,
        )
        .map_err(|_| SwapchainError::InitializationFailed)?;
        let events = conn
            .register_special_event(event_id)
            .map_err(|_| SwapchainError::InitializationFailed)?;

        let gc = Gcontext(
            conn.generate_id()
                .map_err(|_| SwapchainError::InitializationFailed)?,
        );
        conn.create_gc(gc, window, false)
            .map_err(|_| SwapchainError::InitializationFailed)?;

        let ctx = SlotContext {
            conn: &*conn,
            device: &*device,
            window,
            extent: info.extent,
            depth,
            software,
            has_mit_shm: caps.has_mit_shm,
            has_dri3_modifiers: caps.has_dri3_modifiers,
            backing: &backing,
        };
        let mut images = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            match image::init(&ctx) {
                Ok(slot) => images.push(slot),
                Err(err) => {
                    for slot in &mut images {
                        image::finish(slot, &*conn, &*device);
                    }
                    drop(events);
                    return Err(err);
                }
            }
        }

        // The chain cannot resize; starting off mismatched is reported as
        // suboptimal from the first acquire on.
        let current = Extent::new(geometry.width.into(), geometry.height.into());
        let initial = if info.extent != current {
            Status::Suboptimal
        } else {
            Status::Success
        };

        // Queue layout by mode: fifo gets both queues, mailbox only the
        // present queue, immediate usually neither (except the
        // XWayland fence-wait case). Software chains present inline.
        let fifo = matches!(
            info.present_mode,
            PresentMode::Fifo | PresentMode::FifoRelaxed
        );
        let has_present_queue = (fifo
            || needs_wait_for_fences(options, Some(&caps), info.present_mode))
            && !software;
        let has_acquire_queue = has_present_queue && fifo;
        debug_assert!(has_present_queue || !has_acquire_queue);

        // One extra slot so the shutdown sentinel can always be pushed.
        let present_queue =
            has_present_queue.then(|| BoundedQueue::new(image_count as usize + 1));
        let acquire_queue = has_acquire_queue.then(|| {
            let queue = BoundedQueue::new(image_count as usize + 1);
            for i in 0..image_count {
                queue.push(i);
            }
            queue
        });

        let mut inner = Arc::new(ChainInner {
            engine,
            conn,
            device,
            window,
            gc,
            depth,
            extent: info.extent,
            present_mode: info.present_mode,
            software,
            has_dri3_modifiers: caps.has_dri3_modifiers,
            has_mit_shm: caps.has_mit_shm,
            event_id,
            events: ManuallyDrop::new(events),
            images: images.into_boxed_slice(),
            send_sbc: AtomicU64::new(0),
            last_present_msc: AtomicU64::new(0),
            sent_image_count: AtomicU32::new(0),
            status: StatusLatch::new(initial),
            copy_is_suboptimal: AtomicBool::new(false),
            present_queue,
            acquire_queue,
        });

        let worker = if inner.present_queue.is_some() {
            let worker_inner = inner.clone();
            match thread::Builder::new()
                .name("swapchain queue".into())
                .spawn(move || run_queue_manager(&worker_inner))
            {
                Ok(handle) => Some(handle),
                Err(_) => {
                    let chain = Arc::get_mut(&mut inner).expect("fresh chain is shared");
                    destroy_inner(chain);
                    return Err(SwapchainError::InitializationFailed);
                }
            }
        } else {
            None
        };

        // One swapchain per window, so the window property can be set
        // here without stepping on anyone.
        if let Ok(atom) = inner.conn.intern_atom("_VARIABLE_REFRESH") {
            let _ = if inner.device.enable_adaptive_sync() {
                inner.conn.change_property_card32(window, atom, 1)
            } else {
                inner.conn.delete_property(window, atom)
            };
        }

        Ok(Self { inner, worker })
    }

    /// The locked image extent.
    #[inline]
    pub fn extent(&self) -> Extent {
        self.inner.extent
    }

    /// The number of images in the ring.
    #[inline]
    pub fn image_count(&self) -> u32 {
        self.inner.image_count()
    }

    #[inline]
    pub fn present_mode(&self) -> PresentMode {
        self.inner.present_mode
    }

    /// Acquire the next presentable image, waiting up to `timeout_ns`
    /// nanoseconds (`u64::MAX` waits forever, zero never blocks).
    pub fn acquire_next_image(&self, timeout_ns: u64) -> Result<AcquiredImage, SwapchainError> {
        let inner = &self.inner;

        let status = inner.status.get();
        if status.is_error() {
            return Err(status.into_result().unwrap_err());
        }

        let (status, index) = if inner.software && !inner.has_mit_shm {
            inner.acquire_software()
        } else if inner.acquire_queue.is_some() {
            inner.acquire_from_queue(timeout_ns)
        } else {
            inner.acquire_poll(timeout_ns)
        };

        match (index, status.into_result()) {
            (Some(index), Ok(suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            (_, Err(err)) => Err(err),
            (None, Ok(_)) => Err(SwapchainError::NotReady),
        }
    }

    /// Queue a presentation of a previously acquired image. In immediate
    /// mode (without a worker) the request goes to the server right here.
    ///
    /// Returns whether the chain is suboptimal for the surface.
    pub fn queue_present(&self, index: u32, damage: &[RectLayer]) -> Result<bool, SwapchainError> {
        let inner = &self.inner;

        let status = inner.status.get();
        if status.is_error() {
            return Err(status.into_result().unwrap_err());
        }

        let slot = &inner.images[index as usize];

        let mut update_area = Region(0);
        if !damage.is_empty() && damage.len() <= MAX_DAMAGE_RECTS {
            let mut rects = ArrayVec::<[Rectangle; MAX_DAMAGE_RECTS]>::new();
            for rect in damage {
                debug_assert_eq!(rect.layer, 0);
                rects.push(Rectangle {
                    x: rect.x as i16,
                    y: rect.y as i16,
                    width: rect.width as u16,
                    height: rect.height as u16,
                });
            }
            update_area = slot.update_region;
            let _ = inner.conn.xfixes_set_region(slot.update_region, &rects);
        }
        slot.update_area.store(update_area.0, Ordering::Release);

        slot.busy.store(true, Ordering::Release);

        match &inner.present_queue {
            Some(queue) => {
                queue.push(index);
                inner.status.get().into_result()
            }
            None => inner.present_to_server(index as usize, 0).into_result(),
        }
    }
}

impl<C: Connection, D: Device> ChainInner<C, D> {
    #[inline]
    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    #[inline]
    fn events(&self) -> &C::Events {
        &self.events
    }

    /// Images not owned by the server: held by the application, ready
    /// for acquire, or still in the present queue.
    #[inline]
    fn driver_owned_images(&self) -> u32 {
        self.image_count() - self.sent_image_count.load(Ordering::Acquire)
    }

    /// Fold an operation result into the chain status.
    #[inline]
    fn result(&self, result: Status) -> Status {
        self.status.merge(result)
    }

    /// Handle one Present event. Returns the raw result; the caller
    /// merges it into the chain status.
    fn handle_event(&self, event: &PresentEvent) -> Status {
        match *event {
            PresentEvent::ConfigureNotify { width, height } => {
                if u32::from(width) != self.extent.width
                    || u32::from(height) != self.extent.height
                {
                    Status::Suboptimal
                } else {
                    Status::Success
                }
            }

            PresentEvent::IdleNotify { pixmap } => {
                for (i, slot) in self.images.iter().enumerate() {
                    if slot.pixmap == pixmap {
                        slot.busy.store(false, Ordering::Release);
                        let prev = self.sent_image_count.fetch_sub(1, Ordering::AcqRel);
                        debug_assert!(prev > 0);
                        if let Some(queue) = &self.acquire_queue {
                            queue.push(i as u32);
                        }
                        break;
                    }
                }
                Status::Success
            }

            PresentEvent::CompleteNotify {
                kind,
                mode,
                serial,
                msc,
                ..
            } => {
                if kind != CompleteKind::Pixmap {
                    return Status::Success;
                }

                for slot in self.images.iter() {
                    if slot.present_queued.load(Ordering::Acquire)
                        && slot.serial.load(Ordering::Acquire) == serial
                    {
                        slot.present_queued.store(false, Ordering::Release);
                    }
                }
                self.last_present_msc.store(msc, Ordering::Release);

                match mode {
                    CompleteMode::Copy => {
                        if self.copy_is_suboptimal.load(Ordering::Acquire) {
                            Status::Suboptimal
                        } else {
                            Status::Success
                        }
                    }
                    CompleteMode::Flip => {
                        // Once we have flipped, a copy means the flip path
                        // was lost; reallocating would likely get it back.
                        self.copy_is_suboptimal.store(true, Ordering::Release);
                        Status::Success
                    }
                    CompleteMode::SuboptimalCopy => Status::Suboptimal,
                    CompleteMode::Skip => Status::Success,
                }
            }
        }
    }

    /// Software chains without MIT-SHM: any non-busy slot will do, but a
    /// resized window is reported on the spot.
    fn acquire_software(&self) -> (Status, Option<u32>) {
        for (i, slot) in self.images.iter().enumerate() {
            if !slot.busy.load(Ordering::Acquire) {
                slot.busy.store(true, Ordering::Release);
                return match self.conn.get_geometry(self.window) {
                    Ok(geometry) => {
                        if u32::from(geometry.width) != self.extent.width
                            || u32::from(geometry.height) != self.extent.height
                        {
                            (Status::Suboptimal, Some(i as u32))
                        } else {
                            (Status::Success, Some(i as u32))
                        }
                    }
                    Err(_) => (Status::SurfaceLost, Some(i as u32)),
                };
            }
        }
        (Status::NotReady, None)
    }

    /// Fifo: wait for the queue manager to hand an index over, then wait
    /// for the slot's fence.
    fn acquire_from_queue(&self, timeout_ns: u64) -> (Status, Option<u32>) {
        let queue = self.acquire_queue.as_ref().expect("acquire queue");

        let index = match queue.pull(timeout_ns) {
            Ok(index) => index,
            Err(PullError::NotReady) => return (self.result(Status::NotReady), None),
            Err(PullError::Timeout) => return (self.result(Status::Timeout), None),
        };

        // The worker only pushes the sentinel after poisoning the chain,
        // so a fatal status is what the caller gets to see.
        let status = self.status.get();
        if status.is_error() {
            return (status, None);
        }
        if index == SENTINEL {
            return (Status::OutOfDate, None);
        }

        debug_assert!(index < self.image_count());
        if let Some(fence) = &self.images[index as usize].shm_fence {
            fence.wait();
        }

        (status, Some(index))
    }

    /// No acquire queue (immediate, mailbox, software-SHM): scan for an
    /// idle slot, and otherwise chew on the special event channel until
    /// one shows up or the deadline passes.
    fn acquire_poll(&self, timeout_ns: u64) -> (Status, Option<u32>) {
        // An absolute deadline, so fd wakeups from ordinary events cannot
        // stretch the budget.
        let deadline = (timeout_ns != 0 && timeout_ns != u64::MAX)
            .then(|| Instant::now() + Duration::from_nanos(timeout_ns));

        loop {
            for (i, slot) in self.images.iter().enumerate() {
                if !slot.busy.load(Ordering::Acquire) {
                    if let Some(fence) = &slot.shm_fence {
                        fence.wait();
                    }
                    slot.busy.store(true, Ordering::Release);
                    return (self.result(Status::Success), Some(i as u32));
                }
            }

            self.conn.flush();

            if timeout_ns == u64::MAX {
                match self.events().wait() {
                    Some(event) => {
                        let result = self.result(self.handle_event(&event));
                        if result.is_error() {
                            return (result, None);
                        }
                    }
                    None => return (self.result(Status::SurfaceLost), None),
                }
                continue;
            }

            if let Some(event) = self.events().poll() {
                let result = self.result(self.handle_event(&event));
                if result.is_error() {
                    return (result, None);
                }
                continue;
            }

            if timeout_ns == 0 {
                return (self.result(Status::NotReady), None);
            }

            let deadline = deadline.expect("finite timeout has a deadline");
            let now = Instant::now();
            if now >= deadline {
                return (self.result(Status::Timeout), None);
            }

            match self.events().wait_readable(deadline - now) {
                // Possibly just an ordinary event; re-poll with whatever
                // budget is left.
                Ok(Readiness::Readable) => continue,
                Ok(Readiness::TimedOut) => return (self.result(Status::Timeout), None),
                Err(_) => return (self.result(Status::OutOfDate), None),
            }
        }
    }

    fn present_to_server(&self, index: usize, target_msc: u64) -> Status {
        if self.software && !self.has_mit_shm {
            self.present_software(index)
        } else {
            self.present_dri3(index, target_msc)
        }
    }

    /// Hand a pixmap to the server via PresentPixmap.
    fn present_dri3(&self, index: usize, target_msc: u64) -> Status {
        let caps = match self.engine.connection_caps(&*self.conn) {
            Some(caps) => caps,
            None => return self.result(Status::OutOfHostMemory),
        };

        let mut options = 0;
        if self.present_mode == PresentMode::Immediate
            || self.present_mode == PresentMode::FifoRelaxed
            || (self.present_mode == PresentMode::Mailbox && caps.is_xwayland)
        {
            options |= PRESENT_OPTION_ASYNC;
        }
        if self.has_dri3_modifiers {
            options |= PRESENT_OPTION_SUBOPTIMAL;
        }

        // Drain pending events first so a resize is noticed before the
        // server takes the pixmap.
        while let Some(event) = self.events().poll() {
            let result = self.result(self.handle_event(&event));
            if result.is_error() {
                return result;
            }
        }

        let slot = &self.images[index];
        if let Some(fence) = &slot.shm_fence {
            // The server triggers it again once the pixmap goes idle.
            fence.reset();
        }

        let sent = self.sent_image_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(sent <= self.image_count());

        let sbc = self.send_sbc.fetch_add(1, Ordering::AcqRel) + 1;
        slot.serial.store(sbc as u32, Ordering::Release);
        slot.present_queued.store(true, Ordering::Release);

        let request = PresentPixmap {
            window: self.window,
            pixmap: slot.pixmap,
            serial: sbc as u32,
            update: match slot.update_area.load(Ordering::Acquire) {
                0 => None,
                region => Some(Region(region)),
            },
            x_off: 0,
            y_off: 0,
            idle_fence: slot.sync_fence,
            options,
            target_msc,
            divisor: 0,
            remainder: 0,
        };

        match self.conn.present_pixmap(&request) {
            Ok(()) => self.result(Status::Success),
            Err(_) => self.result(Status::SurfaceLost),
        }
    }

    /// Push CPU pixels with PutImage, slicing into horizontal bands when
    /// the payload exceeds the server's maximum request length.
    fn present_software(&self, index: usize) -> Status {
        let slot = &self.images[index];
        let map = match slot.cpu_map {
            Some(map) => map,
            None => return self.result(Status::SurfaceLost),
        };

        let stride = slot.row_pitches[0] as usize;
        let height = self.extent.height as usize;
        let width_px = (slot.row_pitches[0] / 4) as u16;
        let data = unsafe { slice::from_raw_parts(map.as_ptr() as *const u8, stride * height) };

        // Request length accounting is in 4-byte units.
        let total = (PUT_IMAGE_HEADER_LEN + stride * height) >> 2;
        let max_request = self.conn.maximum_request_length() as usize;

        if total < max_request {
            let _ = self.conn.put_image(
                IMAGE_FORMAT_Z_PIXMAP,
                self.window,
                self.gc,
                width_px,
                height as u16,
                0,
                0,
                0,
                24,
                data,
            );
        } else {
            let lines_per_request = (((max_request << 2) - PUT_IMAGE_HEADER_LEN) / stride).max(1);
            let mut y = 0usize;
            while y < height {
                let lines = lines_per_request.min(height - y);
                let _ = self.conn.put_image(
                    IMAGE_FORMAT_Z_PIXMAP,
                    self.window,
                    self.gc,
                    width_px,
                    lines as u16,
                    0,
                    y as i16,
                    0,
                    24,
                    &data[y * stride..(y + lines) * stride],
                );
                y += lines;
            }
        }

        // No idle notification on this path; the slot is reusable as soon
        // as the requests are on the wire.
        slot.busy.store(false, Ordering::Release);
        self.conn.flush();
        self.result(Status::Success)
    }
}

/// The queue manager: drains the present queue, enforces the early
/// fence-wait policy and, in fifo, paces submissions one frame ahead of
/// the reported media stream counter.
fn run_queue_manager<C: Connection, D: Device>(inner: &ChainInner<C, D>) {
    log::trace!("queue manager up");
    let result = queue_manager_loop(inner);
    inner.result(result);

    // Wake anyone blocked in acquire; the latched status tells them why.
    if let Some(queue) = &inner.acquire_queue {
        queue.push(SENTINEL);
    }
    log::trace!("queue manager exiting: {:?}", inner.status.get());
}

fn queue_manager_loop<C: Connection, D: Device>(inner: &ChainInner<C, D>) -> Status {
    let caps = inner.engine.connection_caps(&*inner.conn);
    let present_queue = inner.present_queue.as_ref().expect("present queue");

    while !inner.status.get().is_error() {
        // Blocking is fine: after every send we make sure at least one
        // image is acquirable again before pulling the next.
        let index = match present_queue.pull(u64::MAX) {
            Ok(index) => index,
            Err(_) => return Status::OutOfDate,
        };
        if inner.status.get().is_error() || index == SENTINEL {
            return Status::Success;
        }

        if needs_wait_for_fences(inner.engine.options(), caps.as_deref(), inner.present_mode)
            && inner.device.wait_for_fence(index, u64::MAX).is_err()
        {
            return Status::OutOfDate;
        }

        // Fifo paces one frame ahead; everything else goes out as soon
        // as possible.
        let target_msc = if inner.acquire_queue.is_some() {
            inner.last_present_msc.load(Ordering::Acquire) + 1
        } else {
            0
        };

        let result = inner.present_to_server(index as usize, target_msc);
        if result.is_error() {
            return result;
        }

        if inner.acquire_queue.is_some() {
            let min_image_count = inner.engine.min_image_count().min(inner.image_count());
            // The acquire contract guarantees the application can hold
            // this many images at once without an infinite timeout.
            let forward_progress_threshold = inner.image_count() - min_image_count + 1;

            let slot = &inner.images[index as usize];
            while slot.present_queued.load(Ordering::Acquire)
                || inner.driver_owned_images() < forward_progress_threshold
            {
                let event = match inner.events().wait() {
                    Some(event) => event,
                    None => return Status::SurfaceLost,
                };
                let result = inner.result(inner.handle_event(&event));
                if result.is_error() {
                    return result;
                }
            }
        }
    }

    Status::Success
}

fn destroy_inner<C: Connection, D: Device>(inner: &mut ChainInner<C, D>) {
    for slot in inner.images.iter_mut() {
        image::finish(slot, &*inner.conn, &*inner.device);
    }

    // Unregister the special event channel, then stop the event flow.
    unsafe {
        ManuallyDrop::drop(&mut inner.events);
    }
    let _ = inner
        .conn
        .present_select_input(inner.event_id, inner.window, EVENT_MASK_NO_EVENT);
}

impl<C: Connection, D: Device> Drop for Swapchain<C, D> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.inner.status.merge(Status::OutOfDate);
            if let Some(queue) = &self.inner.present_queue {
                queue.push(SENTINEL);
            }
            let _ = worker.join();
        }

        match Arc::get_mut(&mut self.inner) {
            Some(inner) => destroy_inner(inner),
            // Should be unreachable once the worker is joined.
            None => log::error!("swapchain still shared at drop; leaking server resources"),
        }
    }
}
