// MIT/Apache2 License

//! Test doubles: a scripted in-process X server connection and a mock
//! driver device. The server side of the protocol is simulated just far
//! enough for the presentation paths: resources are tracked for leak
//! checking, presents are recorded, and tests play the server's role by
//! delivering Present events and triggering idle fences.

use crate::fence::ShmFence;
use crate::wsi::{
    AllocError, CreatedImage, Device, Extent, FenceError, ImageBacking, ShmAllocFn,
    DRM_FORMAT_MOD_INVALID,
};
use crate::x11::{
    Atom, CompleteKind, CompleteMode, Connection, ConnectionId, Depth, ErrorCode, EventId,
    EventStream, Gcontext, Geometry, Output, OutputInfo, Pixmap, PresentEvent, PresentPixmap,
    Readiness, Rectangle, Region, RequestError, Result, Screen, ScreenResources, Setup, ShmSeg,
    ShmVersion, SupportedModifiers, SyncFence, VisualClass, VisualId, Visualtype, Window, X11Error,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const ROOT: Window = Window(0x25);
const VISUAL: VisualId = VisualId(0x21);

fn request_error(code: u8) -> X11Error {
    X11Error::Request(RequestError {
        code: ErrorCode(code),
    })
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PutImageRecord {
    pub width: u16,
    pub height: u16,
    pub dst_y: i16,
    pub data_len: usize,
}

#[derive(Debug, Default)]
struct EventHub {
    queue: Mutex<VecDeque<PresentEvent>>,
    cond: Condvar,
    closed: AtomicBool,
    always_readable: AtomicBool,
    fail_readable: AtomicBool,
}

impl EventHub {
    fn push(&self, event: PresentEvent) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
        self.cond.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

pub(crate) struct MockEvents {
    hub: Arc<EventHub>,
    registrations: Arc<AtomicI32>,
}

impl Drop for MockEvents {
    fn drop(&mut self) {
        self.registrations.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EventStream for MockEvents {
    fn wait(&self) -> Option<PresentEvent> {
        let mut queue = self.hub.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            if self.hub.closed.load(Ordering::Acquire) {
                return None;
            }
            queue = self
                .hub
                .cond
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn poll(&self) -> Option<PresentEvent> {
        self.hub
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        if self.hub.fail_readable.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "poll failed"));
        }
        if self.hub.always_readable.load(Ordering::Acquire) {
            // Simulates ordinary events waking the fd with nothing queued.
            thread::sleep(Duration::from_millis(1));
            return Ok(Readiness::Readable);
        }

        let deadline = Instant::now() + timeout;
        let mut queue = self.hub.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if !queue.is_empty() || self.hub.closed.load(Ordering::Acquire) {
                return Ok(Readiness::Readable);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Readiness::TimedOut);
            }
            let (guard, _) = self
                .hub
                .cond
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            queue = guard;
        }
    }
}

#[derive(Debug)]
struct ServerState {
    extensions: HashSet<String>,
    dri3_version: (u32, u32),
    present_version: (u32, u32),
    xfixes_version: (u32, u32),
    randr_version: (u32, u32),
    shm_shared_pixmaps: bool,
    /// Error code returned by a detach of segment zero; `None` succeeds.
    shm_detach_code: Option<u8>,
    output_names: Vec<String>,
    visual_depth: u8,
    visual_class: VisualClass,
    visual_masks: (u32, u32, u32),
    geometry: (u16, u16, u8),
    fail_geometry: bool,
    modifiers: SupportedModifiers,

    pixmaps: HashSet<Pixmap>,
    regions: HashMap<Region, Vec<Rectangle>>,
    fences: HashMap<SyncFence, ShmFence>,
    pixmap_fences: HashMap<Pixmap, SyncFence>,
    shmsegs: HashSet<ShmSeg>,
    atoms: HashMap<String, Atom>,
    properties: HashMap<Atom, u32>,
    presents: Vec<PresentPixmap>,
    put_images: Vec<PutImageRecord>,
    select_masks: Vec<u32>,
    last_pixmap_planes: Option<u32>,
    msc: u64,
}

pub(crate) struct MockConnection {
    id: ConnectionId,
    state: Mutex<ServerState>,
    next_id: AtomicU32,
    hub: Arc<EventHub>,
    registrations: Arc<AtomicI32>,
    fail_queries: AtomicBool,
    fail_pixmap_import: AtomicBool,
    fail_present: AtomicBool,
    max_request_length: AtomicU32,
    flushes: AtomicU64,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

        let _ = env_logger::builder().is_test(true).try_init();

        let extensions = ["SYNC", "DRI3", "Present", "RANDR", "XFIXES", "MIT-SHM"]
            .into_iter()
            .map(String::from)
            .collect();

        Arc::new(Self {
            id: ConnectionId(NEXT_CONN.fetch_add(1, Ordering::AcqRel)),
            state: Mutex::new(ServerState {
                extensions,
                dri3_version: (1, 2),
                present_version: (1, 2),
                xfixes_version: (6, 0),
                randr_version: (1, 6),
                shm_shared_pixmaps: true,
                shm_detach_code: Some(10),
                output_names: vec!["DP-1".to_owned()],
                visual_depth: 24,
                visual_class: VisualClass::TrueColor,
                visual_masks: (0x00ff_0000, 0x0000_ff00, 0x0000_00ff),
                geometry: (640, 480, 24),
                fail_geometry: false,
                modifiers: SupportedModifiers::default(),
                pixmaps: HashSet::new(),
                regions: HashMap::new(),
                fences: HashMap::new(),
                pixmap_fences: HashMap::new(),
                shmsegs: HashSet::new(),
                atoms: HashMap::new(),
                properties: HashMap::new(),
                presents: Vec::new(),
                put_images: Vec::new(),
                select_masks: Vec::new(),
                last_pixmap_planes: None,
                msc: 1000,
            }),
            next_id: AtomicU32::new(0x0200_0000),
            hub: Arc::new(EventHub::default()),
            registrations: Arc::new(AtomicI32::new(0)),
            fail_queries: AtomicBool::new(false),
            fail_pixmap_import: AtomicBool::new(false),
            fail_present: AtomicBool::new(false),
            max_request_length: AtomicU32::new(4_194_304),
            flushes: AtomicU64::new(0),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Scripting knobs.

    pub fn set_extension(&self, name: &str, present: bool) {
        let mut state = self.state();
        if present {
            state.extensions.insert(name.to_owned());
        } else {
            state.extensions.remove(name);
        }
    }

    pub fn set_dri3_version(&self, major: u32, minor: u32) {
        self.state().dri3_version = (major, minor);
    }

    pub fn set_xfixes_version(&self, major: u32, minor: u32) {
        self.state().xfixes_version = (major, minor);
    }

    pub fn set_randr_version(&self, major: u32, minor: u32) {
        self.state().randr_version = (major, minor);
    }

    pub fn set_shm(&self, shared_pixmaps: bool, detach_code: Option<u8>) {
        let mut state = self.state();
        state.shm_shared_pixmaps = shared_pixmaps;
        state.shm_detach_code = detach_code;
    }

    pub fn set_output_names(&self, names: &[&str]) {
        self.state().output_names = names.iter().map(|s| (*s).to_owned()).collect();
    }

    pub fn set_visual(&self, depth: u8, class: VisualClass, red: u32, green: u32, blue: u32) {
        let mut state = self.state();
        state.visual_depth = depth;
        state.visual_class = class;
        state.visual_masks = (red, green, blue);
    }

    pub fn set_geometry(&self, width: u16, height: u16, depth: u8) {
        self.state().geometry = (width, height, depth);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::Release);
    }

    pub fn fail_pixmap_import(&self, fail: bool) {
        self.fail_pixmap_import.store(fail, Ordering::Release);
    }

    pub fn fail_present(&self, fail: bool) {
        self.fail_present.store(fail, Ordering::Release);
    }

    pub fn set_max_request_length(&self, units: u32) {
        self.max_request_length.store(units, Ordering::Release);
    }

    pub fn set_always_readable(&self, value: bool) {
        self.hub.always_readable.store(value, Ordering::Release);
    }

    pub fn fail_readable(&self, value: bool) {
        self.hub.fail_readable.store(value, Ordering::Release);
    }

    // The server's side of the conversation.

    pub fn deliver(&self, event: PresentEvent) {
        self.hub.push(event);
    }

    /// Complete the present with the given serial; returns the new MSC.
    pub fn complete(&self, serial: u32, mode: CompleteMode) -> u64 {
        let msc = {
            let mut state = self.state();
            state.msc += 1;
            state.msc
        };
        self.deliver(PresentEvent::CompleteNotify {
            kind: CompleteKind::Pixmap,
            mode,
            serial,
            msc,
            ust: msc * 16_000,
        });
        msc
    }

    /// Release a presented pixmap: trigger its idle fence and notify.
    pub fn idle(&self, pixmap: Pixmap) {
        {
            let state = self.state();
            if let Some(fence) = state.pixmap_fences.get(&pixmap) {
                if let Some(shm_fence) = state.fences.get(fence) {
                    shm_fence.trigger();
                }
            }
        }
        self.deliver(PresentEvent::IdleNotify { pixmap });
    }

    pub fn resize(&self, width: u16, height: u16) {
        {
            let mut state = self.state();
            state.geometry.0 = width;
            state.geometry.1 = height;
        }
        self.deliver(PresentEvent::ConfigureNotify { width, height });
    }

    pub fn close(&self) {
        self.hub.close();
    }

    // Inspection.

    pub fn presents(&self) -> Vec<PresentPixmap> {
        self.state().presents.clone()
    }

    pub fn put_images(&self) -> Vec<PutImageRecord> {
        self.state().put_images.clone()
    }

    pub fn live_pixmaps(&self) -> usize {
        self.state().pixmaps.len()
    }

    pub fn live_regions(&self) -> usize {
        self.state().regions.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state().fences.len()
    }

    pub fn live_registrations(&self) -> i32 {
        self.registrations.load(Ordering::Acquire)
    }

    pub fn last_pixmap_plane_count(&self) -> Option<u32> {
        self.state().last_pixmap_planes
    }

    pub fn last_select_mask(&self) -> Option<u32> {
        self.state().select_masks.last().copied()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    pub fn fence_is_triggered(&self, fence: SyncFence) -> bool {
        self.state()
            .fences
            .get(&fence)
            .map(|f| f.is_triggered())
            .unwrap_or(false)
    }

    pub fn property(&self, name: &str) -> Option<u32> {
        let state = self.state();
        let atom = state.atoms.get(name)?;
        state.properties.get(atom).copied()
    }

    pub fn region_rects(&self, region: Region) -> Option<Vec<Rectangle>> {
        self.state().regions.get(&region).cloned()
    }
}

fn memfd(name: &[u8]) -> OwnedFd {
    debug_assert_eq!(name.last(), Some(&0));
    let raw = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
    assert!(raw >= 0, "memfd_create failed");
    unsafe { OwnedFd::from_raw_fd(raw) }
}

impl Connection for MockConnection {
    type Events = MockEvents;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn generate_id(&self) -> Result<u32> {
        Ok(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    fn setup(&self) -> Setup {
        let state = self.state();
        let (red_mask, green_mask, blue_mask) = state.visual_masks;
        Setup {
            roots: vec![Screen {
                root: ROOT,
                allowed_depths: vec![Depth {
                    depth: state.visual_depth,
                    visuals: vec![Visualtype {
                        visual_id: VISUAL,
                        class: state.visual_class,
                        red_mask,
                        green_mask,
                        blue_mask,
                    }],
                }],
            }],
        }
    }

    fn query_extensions(&self, names: &[&str]) -> Result<Vec<bool>> {
        if self.fail_queries.load(Ordering::Acquire) {
            return Err(X11Error::Disconnected);
        }
        let state = self.state();
        Ok(names
            .iter()
            .map(|name| state.extensions.contains(*name))
            .collect())
    }

    fn dri3_query_version(&self, _major: u32, _minor: u32) -> Result<(u32, u32)> {
        Ok(self.state().dri3_version)
    }

    fn present_query_version(&self, _major: u32, _minor: u32) -> Result<(u32, u32)> {
        Ok(self.state().present_version)
    }

    fn xfixes_query_version(&self, _major: u32, _minor: u32) -> Result<(u32, u32)> {
        Ok(self.state().xfixes_version)
    }

    fn randr_query_version(&self, _major: u32, _minor: u32) -> Result<(u32, u32)> {
        Ok(self.state().randr_version)
    }

    fn shm_query_version(&self) -> Result<ShmVersion> {
        let state = self.state();
        Ok(ShmVersion {
            major: 1,
            minor: 2,
            shared_pixmaps: state.shm_shared_pixmaps,
        })
    }

    fn randr_get_screen_resources_current(&self, _root: Window) -> Result<ScreenResources> {
        let state = self.state();
        Ok(ScreenResources {
            outputs: (0..state.output_names.len() as u32)
                .map(|i| Output(0x40 + i))
                .collect(),
            config_timestamp: 0,
        })
    }

    fn randr_get_output_info(&self, output: Output, _config_timestamp: u32) -> Result<OutputInfo> {
        let state = self.state();
        let index = (output.0 - 0x40) as usize;
        match state.output_names.get(index) {
            Some(name) => Ok(OutputInfo { name: name.clone() }),
            None => Err(request_error(3)),
        }
    }

    fn get_geometry(&self, _window: Window) -> Result<Geometry> {
        let state = self.state();
        if state.fail_geometry {
            return Err(X11Error::Disconnected);
        }
        Ok(Geometry {
            root: ROOT,
            depth: state.geometry.2,
            width: state.geometry.0,
            height: state.geometry.1,
        })
    }

    fn query_tree_root(&self, _window: Window) -> Result<Window> {
        Ok(ROOT)
    }

    fn get_window_visual(&self, _window: Window) -> Result<VisualId> {
        Ok(VISUAL)
    }

    fn intern_atom(&self, name: &str) -> Result<Atom> {
        let mut state = self.state();
        let next = Atom(0x100 + state.atoms.len() as u32);
        Ok(*state.atoms.entry(name.to_owned()).or_insert(next))
    }

    fn change_property_card32(&self, _window: Window, property: Atom, value: u32) -> Result<()> {
        self.state().properties.insert(property, value);
        Ok(())
    }

    fn delete_property(&self, _window: Window, property: Atom) -> Result<()> {
        self.state().properties.remove(&property);
        Ok(())
    }

    fn create_gc(&self, _gc: Gcontext, _window: Window, graphics_exposures: bool) -> Result<()> {
        assert!(!graphics_exposures);
        Ok(())
    }

    fn xfixes_create_region(&self, region: Region, rects: &[Rectangle]) -> Result<()> {
        self.state().regions.insert(region, rects.to_vec());
        Ok(())
    }

    fn xfixes_set_region(&self, region: Region, rects: &[Rectangle]) -> Result<()> {
        self.state().regions.insert(region, rects.to_vec());
        Ok(())
    }

    fn xfixes_destroy_region(&self, region: Region) -> Result<()> {
        self.state().regions.remove(&region);
        Ok(())
    }

    fn dri3_open(&self, _root: Window, _provider: u32) -> Result<OwnedFd> {
        Ok(memfd(b"mock-dri3\0"))
    }

    fn dri3_pixmap_from_buffer(
        &self,
        pixmap: Pixmap,
        _window: Window,
        _size: u32,
        _width: u16,
        _height: u16,
        _stride: u16,
        _depth: u8,
        _bpp: u8,
        _fd: OwnedFd,
    ) -> Result<()> {
        if self.fail_pixmap_import.load(Ordering::Acquire) {
            return Err(request_error(11));
        }
        let mut state = self.state();
        state.pixmaps.insert(pixmap);
        state.last_pixmap_planes = Some(1);
        Ok(())
    }

    fn dri3_pixmap_from_buffers(
        &self,
        pixmap: Pixmap,
        _window: Window,
        _width: u16,
        _height: u16,
        _strides: [u32; 4],
        _offsets: [u32; 4],
        _depth: u8,
        _bpp: u8,
        _modifier: u64,
        fds: Vec<OwnedFd>,
    ) -> Result<()> {
        if self.fail_pixmap_import.load(Ordering::Acquire) {
            return Err(request_error(11));
        }
        let mut state = self.state();
        state.pixmaps.insert(pixmap);
        state.last_pixmap_planes = Some(fds.len() as u32);
        Ok(())
    }

    fn dri3_fence_from_fd(
        &self,
        drawable: Pixmap,
        fence: SyncFence,
        initially_triggered: bool,
        fd: OwnedFd,
    ) -> Result<()> {
        let shm_fence = ShmFence::from_fd(fd.as_fd()).map_err(X11Error::Io)?;
        if initially_triggered {
            shm_fence.trigger();
        }
        let mut state = self.state();
        state.fences.insert(fence, shm_fence);
        state.pixmap_fences.insert(drawable, fence);
        Ok(())
    }

    fn dri3_get_supported_modifiers(
        &self,
        _window: Window,
        _depth: u8,
        _bpp: u8,
    ) -> Result<SupportedModifiers> {
        Ok(self.state().modifiers.clone())
    }

    fn sync_destroy_fence(&self, fence: SyncFence) -> Result<()> {
        self.state().fences.remove(&fence);
        Ok(())
    }

    fn free_pixmap(&self, pixmap: Pixmap) -> Result<()> {
        let mut state = self.state();
        state.pixmaps.remove(&pixmap);
        state.pixmap_fences.remove(&pixmap);
        Ok(())
    }

    fn shm_attach(&self, shmseg: ShmSeg, _shmid: u32, _read_only: bool) -> Result<()> {
        self.state().shmsegs.insert(shmseg);
        Ok(())
    }

    fn shm_detach(&self, shmseg: ShmSeg) -> Result<()> {
        let mut state = self.state();
        if shmseg == ShmSeg(0) {
            return match state.shm_detach_code {
                Some(code) => Err(request_error(code)),
                None => Ok(()),
            };
        }
        state.shmsegs.remove(&shmseg);
        Ok(())
    }

    fn shm_create_pixmap(
        &self,
        pixmap: Pixmap,
        _window: Window,
        _width: u16,
        _height: u16,
        _depth: u8,
        shmseg: ShmSeg,
        _offset: u32,
    ) -> Result<()> {
        let mut state = self.state();
        assert!(state.shmsegs.contains(&shmseg));
        state.pixmaps.insert(pixmap);
        Ok(())
    }

    fn put_image(
        &self,
        format: u8,
        _window: Window,
        _gc: Gcontext,
        width: u16,
        height: u16,
        _dst_x: i16,
        dst_y: i16,
        _left_pad: u8,
        depth: u8,
        data: &[u8],
    ) -> Result<()> {
        assert_eq!(format, crate::x11::IMAGE_FORMAT_Z_PIXMAP);
        assert_eq!(depth, 24);
        self.state().put_images.push(PutImageRecord {
            width,
            height,
            dst_y,
            data_len: data.len(),
        });
        Ok(())
    }

    fn maximum_request_length(&self) -> u32 {
        self.max_request_length.load(Ordering::Acquire)
    }

    fn present_select_input(&self, _event_id: EventId, _window: Window, mask: u32) -> Result<()> {
        self.state().select_masks.push(mask);
        Ok(())
    }

    fn present_pixmap(&self, request: &PresentPixmap) -> Result<()> {
        if self.fail_present.load(Ordering::Acquire) {
            return Err(request_error(9));
        }
        let mut state = self.state();
        state.pixmap_fences.insert(request.pixmap, request.idle_fence);
        state.presents.push(*request);
        Ok(())
    }

    fn register_special_event(&self, _event_id: EventId) -> Result<MockEvents> {
        self.registrations.fetch_add(1, Ordering::AcqRel);
        Ok(MockEvents {
            hub: self.hub.clone(),
            registrations: self.registrations.clone(),
        })
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }
}

/// A mock driver device, hardware or software flavored.
pub(crate) struct MockDevice {
    software: bool,
    host_import: bool,
    supports_modifiers: bool,
    adaptive_sync: AtomicBool,
    force_bgra: AtomicBool,
    modifier: Mutex<Option<(u64, u32)>>,
    fail_alloc: AtomicBool,
    fail_fence: AtomicBool,
    waited: Mutex<Vec<u32>>,
    live_images: AtomicI64,
}

pub(crate) struct MockImage {
    _buf: Option<Box<[u8]>>,
}

impl std::fmt::Debug for MockImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockImage").finish()
    }
}

impl MockDevice {
    fn new(software: bool, host_import: bool) -> Self {
        Self {
            software,
            host_import,
            supports_modifiers: !software,
            adaptive_sync: AtomicBool::new(false),
            force_bgra: AtomicBool::new(false),
            modifier: Mutex::new(None),
            fail_alloc: AtomicBool::new(false),
            fail_fence: AtomicBool::new(false),
            waited: Mutex::new(Vec::new()),
            live_images: AtomicI64::new(0),
        }
    }

    pub fn hardware() -> Self {
        Self::new(false, false)
    }

    pub fn software() -> Self {
        Self::new(true, true)
    }

    /// A software rasterizer that cannot import host memory, so the
    /// MIT-SHM path is off the table.
    pub fn software_no_shm() -> Self {
        Self::new(true, false)
    }

    pub fn set_adaptive_sync(&self, value: bool) {
        self.adaptive_sync.store(value, Ordering::Release);
    }

    pub fn set_force_bgra8_unorm_first(&self, value: bool) {
        self.force_bgra.store(value, Ordering::Release);
    }

    pub fn set_modifier(&self, modifier: u64, planes: u32) {
        *self.modifier.lock().unwrap_or_else(|e| e.into_inner()) = Some((modifier, planes));
    }

    pub fn fail_image_allocation(&self, value: bool) {
        self.fail_alloc.store(value, Ordering::Release);
    }

    pub fn fail_fence_wait(&self, value: bool) {
        self.fail_fence.store(value, Ordering::Release);
    }

    pub fn waited(&self) -> Vec<u32> {
        self.waited.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn live_images(&self) -> i64 {
        self.live_images.load(Ordering::Acquire)
    }
}

impl Device for MockDevice {
    type Image = MockImage;

    fn is_software(&self) -> bool {
        self.software
    }

    fn supports_modifiers(&self) -> bool {
        self.supports_modifiers
    }

    fn has_host_memory_import(&self) -> bool {
        self.host_import
    }

    fn enable_adaptive_sync(&self) -> bool {
        self.adaptive_sync.load(Ordering::Acquire)
    }

    fn force_bgra8_unorm_first(&self) -> bool {
        self.force_bgra.load(Ordering::Acquire)
    }

    fn matches_drm_fd(&self, _fd: std::os::fd::BorrowedFd<'_>) -> bool {
        true
    }

    fn create_image(
        &self,
        extent: Extent,
        backing: &ImageBacking,
        shm_alloc: Option<ShmAllocFn<'_>>,
    ) -> std::result::Result<CreatedImage<MockImage>, AllocError> {
        if self.fail_alloc.load(Ordering::Acquire) {
            return Err(AllocError);
        }

        let pitch = extent.width * 4;
        let size = (pitch * extent.height) as usize;

        let created = match backing {
            ImageBacking::Drm { .. } => {
                let (modifier, planes) = self
                    .modifier
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .unwrap_or((DRM_FORMAT_MOD_INVALID, 1));
                CreatedImage {
                    image: MockImage { _buf: None },
                    dma_buf_fd: Some(memfd(b"mock-image\0")),
                    num_planes: planes,
                    row_pitches: [pitch; 4],
                    offsets: [0; 4],
                    sizes: [size as u32; 4],
                    drm_modifier: modifier,
                    cpu_map: None,
                }
            }
            ImageBacking::Cpu { with_shm } => {
                let (buf, map) = if *with_shm {
                    let alloc = shm_alloc.expect("shm-backed image without allocator");
                    (None, alloc(size).ok_or(AllocError)?)
                } else {
                    let mut buf = vec![0u8; size].into_boxed_slice();
                    let map = NonNull::new(buf.as_mut_ptr()).expect("null buffer");
                    (Some(buf), map)
                };
                CreatedImage {
                    image: MockImage { _buf: buf },
                    dma_buf_fd: None,
                    num_planes: 1,
                    row_pitches: [pitch, 0, 0, 0],
                    offsets: [0; 4],
                    sizes: [size as u32, 0, 0, 0],
                    drm_modifier: DRM_FORMAT_MOD_INVALID,
                    cpu_map: Some(map),
                }
            }
        };

        self.live_images.fetch_add(1, Ordering::AcqRel);
        Ok(created)
    }

    fn destroy_image(&self, image: MockImage) {
        self.live_images.fetch_sub(1, Ordering::AcqRel);
        drop(image);
    }

    fn wait_for_fence(&self, image_index: u32, _timeout_ns: u64) -> std::result::Result<(), FenceError> {
        self.waited
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(image_index);
        if self.fail_fence.load(Ordering::Acquire) {
            return Err(FenceError);
        }
        Ok(())
    }
}

/// Spin until `cond` holds or the deadline passes; panics on timeout.
pub(crate) fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(1));
    }
}
