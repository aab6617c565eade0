// MIT/Apache2 License

//! The seam to the X server.
//!
//! The engine never encodes protocol itself; it drives a [`Connection`],
//! a handle over an established X11 connection that exposes the requests
//! the presentation path needs as typed methods, and that delivers Present
//! extension events out-of-band on a "special event" channel
//! ([`EventStream`]) so they never race the application's own event loop.
//!
//! Requests that the engine checks synchronously return a
//! [`RequestError`]; everything else reports failure through [`X11Error`].

use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;
use thiserror::Error;

macro_rules! xid {
    ($(#[$attr:meta] $name:ident),* $(,)?) => {
        $(
            #[$attr]
            #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
            #[repr(transparent)]
            pub struct $name(pub u32);
        )*
    };
}

xid! {
    /// A window resource id.
    Window,
    /// A pixmap resource id.
    Pixmap,
    /// A graphics context id.
    Gcontext,
    /// An XFIXES region id.
    Region,
    /// A SYNC fence id.
    SyncFence,
    /// A MIT-SHM segment id.
    ShmSeg,
    /// The id under which a Present special-event registration lives.
    EventId,
    /// A visual id.
    VisualId,
    /// An interned atom.
    Atom,
    /// A RandR output id.
    Output,
}

/// A protocol rectangle.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Rectangle {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

/// Reply to a `GetGeometry` request.
#[derive(Debug, Copy, Clone)]
pub struct Geometry {
    pub root: Window,
    pub depth: u8,
    pub width: u16,
    pub height: u16,
}

/// The visual class of a visual type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VisualClass {
    StaticGray,
    GrayScale,
    StaticColor,
    PseudoColor,
    TrueColor,
    DirectColor,
}

/// One visual type from the connection setup.
#[derive(Debug, Copy, Clone)]
pub struct Visualtype {
    pub visual_id: VisualId,
    pub class: VisualClass,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
}

/// One depth and its visuals from the connection setup.
#[derive(Debug, Clone)]
pub struct Depth {
    pub depth: u8,
    pub visuals: Vec<Visualtype>,
}

/// One root screen from the connection setup.
#[derive(Debug, Clone)]
pub struct Screen {
    pub root: Window,
    pub allowed_depths: Vec<Depth>,
}

/// The parsed connection setup block.
#[derive(Debug, Clone)]
pub struct Setup {
    pub roots: Vec<Screen>,
}

/// Reply to a `ShmQueryVersion` request.
#[derive(Debug, Copy, Clone)]
pub struct ShmVersion {
    pub major: u32,
    pub minor: u32,
    pub shared_pixmaps: bool,
}

/// Reply to a `Dri3GetSupportedModifiers` request.
#[derive(Debug, Clone, Default)]
pub struct SupportedModifiers {
    pub window: Vec<u64>,
    pub screen: Vec<u64>,
}

/// Reply to a `RandrGetScreenResourcesCurrent` request.
#[derive(Debug, Clone)]
pub struct ScreenResources {
    pub outputs: Vec<Output>,
    pub config_timestamp: u32,
}

/// Reply to a `RandrGetOutputInfo` request.
#[derive(Debug, Clone)]
pub struct OutputInfo {
    pub name: String,
}

/// How a completed presentation made it to the screen.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompleteMode {
    Copy,
    Flip,
    Skip,
    /// A copy that the server would rather have flipped; the client's
    /// buffer configuration is in the way.
    SuboptimalCopy,
}

/// What a `CompleteNotify` event refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompleteKind {
    Pixmap,
    NotifyMsc,
}

/// A Present extension event, delivered on the special-event channel.
#[derive(Debug, Copy, Clone)]
pub enum PresentEvent {
    /// The target window was resized.
    ConfigureNotify { width: u16, height: u16 },
    /// A previously presented pixmap is no longer in use by the server.
    IdleNotify { pixmap: Pixmap },
    /// A presentation actually happened.
    CompleteNotify {
        kind: CompleteKind,
        mode: CompleteMode,
        serial: u32,
        msc: u64,
        ust: u64,
    },
}

/// Present event selection bits.
pub const EVENT_MASK_NO_EVENT: u32 = 0;
pub const EVENT_MASK_CONFIGURE_NOTIFY: u32 = 1 << 0;
pub const EVENT_MASK_COMPLETE_NOTIFY: u32 = 1 << 1;
pub const EVENT_MASK_IDLE_NOTIFY: u32 = 1 << 2;

/// PresentPixmap option bits.
pub const PRESENT_OPTION_ASYNC: u32 = 1 << 0;
pub const PRESENT_OPTION_SUBOPTIMAL: u32 = 1 << 3;

/// `PutImage` pixel formats.
pub const IMAGE_FORMAT_Z_PIXMAP: u8 = 2;

/// Size in bytes of a `PutImage` request header.
pub const PUT_IMAGE_HEADER_LEN: usize = 24;

/// A core protocol error code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    /// `BadRequest`: the server does not implement the opcode at all.
    pub const REQUEST: ErrorCode = ErrorCode(1);
    /// `BadWindow`.
    pub const WINDOW: ErrorCode = ErrorCode(3);
}

/// An error reply from the server for a checked request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("server error (code {})", code.0)]
pub struct RequestError {
    pub code: ErrorCode,
}

/// Any failure of the connection seam.
#[derive(Debug, Error)]
pub enum X11Error {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("the X connection was closed")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = X11Error> = std::result::Result<T, E>;

/// Identity of a connection, used to key the per-connection capability
/// cache. Implementations usually derive it from the address of the
/// underlying connection object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ConnectionId(pub u64);

/// Outcome of waiting for the connection's file descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The fd became readable; there may or may not be a special event.
    Readable,
    /// The timeout elapsed first.
    TimedOut,
}

/// Everything needed to submit a `PresentPixmap` request.
#[derive(Debug, Copy, Clone)]
pub struct PresentPixmap {
    pub window: Window,
    pub pixmap: Pixmap,
    pub serial: u32,
    /// The damaged sub-area, or `None` for the whole pixmap.
    pub update: Option<Region>,
    pub x_off: i16,
    pub y_off: i16,
    /// Fence the server triggers when the pixmap goes idle.
    pub idle_fence: SyncFence,
    pub options: u32,
    pub target_msc: u64,
    pub divisor: u64,
    pub remainder: u64,
}

/// The Present special-event channel for one registration.
///
/// Exactly the three event kinds selected at registration arrive here;
/// `wait` returning `None` signals end-of-stream (the connection died).
/// Dropping the stream unregisters it from the connection.
pub trait EventStream: Send + Sync {
    /// Block until the next special event, or `None` on connection loss.
    fn wait(&self) -> Option<PresentEvent>;

    /// Return a queued special event without blocking.
    fn poll(&self) -> Option<PresentEvent>;

    /// Wait for the connection's fd to become readable. A readable fd does
    /// not guarantee a special event is queued; ordinary events wake it
    /// too, so callers must re-`poll` and keep their own deadline.
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness>;
}

/// A handle over an established X11 connection.
///
/// All methods take `&self`; the handle is shared between the application
/// threads and the swapchain's queue manager, and implementations are
/// expected to serialize request encoding internally the way the usual
/// client libraries do.
pub trait Connection: Send + Sync + 'static {
    type Events: EventStream;

    /// A stable identity for the underlying connection.
    fn id(&self) -> ConnectionId;

    /// Allocate a fresh resource id.
    fn generate_id(&self) -> Result<u32>;

    /// The parsed connection setup block.
    fn setup(&self) -> Setup;

    /// Query presence of several extensions at once. Implementations
    /// should issue all requests eagerly and collect the replies together
    /// so the round-trips pipeline.
    fn query_extensions(&self, names: &[&str]) -> Result<Vec<bool>>;

    fn dri3_query_version(&self, major: u32, minor: u32) -> Result<(u32, u32)>;
    fn present_query_version(&self, major: u32, minor: u32) -> Result<(u32, u32)>;
    fn xfixes_query_version(&self, major: u32, minor: u32) -> Result<(u32, u32)>;
    fn randr_query_version(&self, major: u32, minor: u32) -> Result<(u32, u32)>;
    fn shm_query_version(&self) -> Result<ShmVersion>;

    fn randr_get_screen_resources_current(&self, root: Window) -> Result<ScreenResources>;
    fn randr_get_output_info(&self, output: Output, config_timestamp: u32) -> Result<OutputInfo>;

    fn get_geometry(&self, window: Window) -> Result<Geometry>;
    /// The root window of the tree the window belongs to.
    fn query_tree_root(&self, window: Window) -> Result<Window>;
    /// The visual of the window.
    fn get_window_visual(&self, window: Window) -> Result<VisualId>;

    fn intern_atom(&self, name: &str) -> Result<Atom>;
    /// Replace a 32-bit CARDINAL property with a single value.
    fn change_property_card32(&self, window: Window, property: Atom, value: u32) -> Result<()>;
    fn delete_property(&self, window: Window, property: Atom) -> Result<()>;

    /// Create a graphics context on the window; `graphics_exposures` is
    /// always disabled by this engine.
    fn create_gc(&self, gc: Gcontext, window: Window, graphics_exposures: bool) -> Result<()>;

    fn xfixes_create_region(&self, region: Region, rects: &[Rectangle]) -> Result<()>;
    fn xfixes_set_region(&self, region: Region, rects: &[Rectangle]) -> Result<()>;
    fn xfixes_destroy_region(&self, region: Region) -> Result<()>;

    /// Open the DRI3 device node for a screen; the returned fd belongs to
    /// the caller.
    fn dri3_open(&self, root: Window, provider: u32) -> Result<OwnedFd>;

    /// Create a pixmap from a single-plane buffer. The server takes
    /// ownership of the fd.
    #[allow(clippy::too_many_arguments)]
    fn dri3_pixmap_from_buffer(
        &self,
        pixmap: Pixmap,
        window: Window,
        size: u32,
        width: u16,
        height: u16,
        stride: u16,
        depth: u8,
        bpp: u8,
        fd: OwnedFd,
    ) -> Result<()>;

    /// Create a pixmap from up to four planes with an explicit format
    /// modifier. The server takes ownership of the fds.
    #[allow(clippy::too_many_arguments)]
    fn dri3_pixmap_from_buffers(
        &self,
        pixmap: Pixmap,
        window: Window,
        width: u16,
        height: u16,
        strides: [u32; 4],
        offsets: [u32; 4],
        depth: u8,
        bpp: u8,
        modifier: u64,
        fds: Vec<OwnedFd>,
    ) -> Result<()>;

    /// Import a shared-memory fence under a SYNC fence id. The server
    /// takes ownership of the fd.
    fn dri3_fence_from_fd(
        &self,
        drawable: Pixmap,
        fence: SyncFence,
        initially_triggered: bool,
        fd: OwnedFd,
    ) -> Result<()>;

    fn dri3_get_supported_modifiers(
        &self,
        window: Window,
        depth: u8,
        bpp: u8,
    ) -> Result<SupportedModifiers>;

    fn sync_destroy_fence(&self, fence: SyncFence) -> Result<()>;
    fn free_pixmap(&self, pixmap: Pixmap) -> Result<()>;

    fn shm_attach(&self, shmseg: ShmSeg, shmid: u32, read_only: bool) -> Result<()>;
    /// Checked detach; the capability probe deliberately sends an invalid
    /// segment and inspects the error code.
    fn shm_detach(&self, shmseg: ShmSeg) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    fn shm_create_pixmap(
        &self,
        pixmap: Pixmap,
        window: Window,
        width: u16,
        height: u16,
        depth: u8,
        shmseg: ShmSeg,
        offset: u32,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn put_image(
        &self,
        format: u8,
        window: Window,
        gc: Gcontext,
        width: u16,
        height: u16,
        dst_x: i16,
        dst_y: i16,
        left_pad: u8,
        depth: u8,
        data: &[u8],
    ) -> Result<()>;

    /// The server's maximum request length, in 4-byte units.
    fn maximum_request_length(&self) -> u32;

    /// Select Present events for the window under the given event id.
    fn present_select_input(&self, event_id: EventId, window: Window, mask: u32) -> Result<()>;

    /// Submit a presentation and check it synchronously.
    fn present_pixmap(&self, request: &PresentPixmap) -> Result<()>;

    /// Open the special-event channel for an event id previously passed to
    /// [`present_select_input`](Self::present_select_input).
    fn register_special_event(&self, event_id: EventId) -> Result<Self::Events>;

    /// Flush buffered requests to the server. Failures are not
    /// interesting to the presentation paths and are swallowed.
    fn flush(&self);
}
