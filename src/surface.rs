// MIT/Apache2 License

//! Surfaces and the synchronous queries answered about them.
//!
//! A surface is just a window on a borrowed connection. Everything here
//! is a round-trip or two against the server: whether presentation works
//! at all, the geometry-derived capabilities, the visual-compatible
//! formats and the supported present modes.

use crate::engine::PresentEngine;
use crate::status::SwapchainError;
use crate::wsi::{Device, Extent};
use crate::x11::{Connection, Rectangle, VisualClass, Visualtype, Window};
use std::sync::Arc;
use tinyvec::ArrayVec;

/// How presentations are paced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentMode {
    /// Show the image as soon as possible, tearing allowed.
    Immediate,
    /// Replace the queued image; never tears, never blocks.
    Mailbox,
    /// Strict first-in-first-out against vertical sync.
    Fifo,
    /// Fifo, but a late image may tear instead of waiting a full frame.
    FifoRelaxed,
}

/// Present modes in the priority order they are advertised.
pub const PRESENT_MODES: [PresentMode; 4] = [
    PresentMode::Immediate,
    PresentMode::Mailbox,
    PresentMode::Fifo,
    PresentMode::FifoRelaxed,
];

/// Pixel formats this engine can put on screen.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    #[default]
    Bgra8Srgb,
    Bgra8Unorm,
    Argb2101010,
}

/// Always sRGB nonlinear; X has no other notion.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ColorSpace {
    #[default]
    SrgbNonlinear,
}

/// A format paired with its colorspace, as advertised to applications.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SurfaceFormat {
    pub format: Format,
    pub color_space: ColorSpace,
}

/// How the compositor may treat the alpha channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompositeAlpha {
    Opaque,
    PreMultiplied,
    Inherit,
}

/// The only transform an X window supports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transform {
    Identity,
}

/// Answers to the surface capability query.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    /// The window's current size. X windows cannot be scaled by the
    /// swapchain, so min and max match it.
    pub current_extent: Extent,
    pub min_image_extent: Extent,
    pub max_image_extent: Extent,
    pub min_image_count: u32,
    /// `None`: there is no real maximum.
    pub max_image_count: Option<u32>,
    pub max_image_array_layers: u32,
    pub supported_composite_alpha: &'static [CompositeAlpha],
    pub current_transform: Transform,
    pub supported_transforms: &'static [Transform],
}

/// A presentable window, in either of the two client-library flavors.
/// The connection is borrowed from the application and never owned.
#[derive(Debug)]
pub enum Surface<C> {
    Xcb { connection: Arc<C>, window: Window },
    Xlib { display: Arc<C>, window: Window },
}

impl<C: Connection> Surface<C> {
    #[inline]
    pub fn connection(&self) -> &Arc<C> {
        match self {
            Surface::Xcb { connection, .. } => connection,
            Surface::Xlib { display, .. } => display,
        }
    }

    #[inline]
    pub fn window(&self) -> Window {
        match self {
            Surface::Xcb { window, .. } | Surface::Xlib { window, .. } => *window,
        }
    }
}

struct FormatEntry {
    format: Format,
    bits_per_rgb: u32,
}

const SURFACE_FORMATS: [FormatEntry; 3] = [
    FormatEntry {
        format: Format::Bgra8Srgb,
        bits_per_rgb: 8,
    },
    FormatEntry {
        format: Format::Bgra8Unorm,
        bits_per_rgb: 8,
    },
    FormatEntry {
        format: Format::Argb2101010,
        bits_per_rgb: 10,
    },
];

const ALPHA_OPAQUE: &[CompositeAlpha] = &[CompositeAlpha::Inherit, CompositeAlpha::Opaque];
const ALPHA_BLENDED: &[CompositeAlpha] = &[CompositeAlpha::Inherit, CompositeAlpha::PreMultiplied];

/// Find the window's visual and its depth by walking the setup data.
pub(crate) fn visualtype_for_window<C: Connection>(
    conn: &C,
    window: Window,
) -> Option<(Visualtype, u8)> {
    let root = conn.query_tree_root(window).ok()?;
    let visual_id = conn.get_window_visual(window).ok()?;

    let setup = conn.setup();
    let screen = setup.roots.iter().find(|screen| screen.root == root)?;
    for depth in &screen.allowed_depths {
        for visual in &depth.visuals {
            if visual.visual_id == visual_id {
                return Some((*visual, depth.depth));
            }
        }
    }
    None
}

/// Whether the visual leaves bits over after RGB for an alpha channel.
fn visual_has_alpha(visual: &Visualtype, depth: u8) -> bool {
    let rgb_mask = visual.red_mask | visual.green_mask | visual.blue_mask;
    let all_mask = u32::MAX >> (32 - u32::from(depth));
    (all_mask & !rgb_mask) != 0
}

fn visual_supported(visual: &Visualtype) -> bool {
    matches!(
        visual.class,
        VisualClass::TrueColor | VisualClass::DirectColor
    )
}

impl<D: Device> PresentEngine<D> {
    /// Whether the surface can be presented to at all.
    pub fn surface_supported<C: Connection>(
        &self,
        surface: &Surface<C>,
    ) -> Result<bool, SwapchainError> {
        let conn = surface.connection();
        let caps = self
            .connection_caps(&**conn)
            .ok_or(SwapchainError::OutOfHostMemory)?;

        if !self.device().is_software() && !caps.has_dri3 {
            if !caps.is_proprietary_x11 {
                log::warn!(
                    "no DRI3 support detected - required for presentation; \
                     you can probably enable DRI3 in your Xorg config"
                );
            }
            return Ok(false);
        }

        Ok(visualtype_for_window(&**conn, surface.window())
            .map(|(visual, _)| visual_supported(&visual))
            .unwrap_or(false))
    }

    /// The surface's current capabilities. Extents are pinned to the
    /// window's geometry.
    pub fn surface_capabilities<C: Connection>(
        &self,
        surface: &Surface<C>,
    ) -> Result<SurfaceCapabilities, SwapchainError> {
        let conn = surface.connection();
        let window = surface.window();

        let (visual, depth) =
            visualtype_for_window(&**conn, window).ok_or(SwapchainError::SurfaceLost)?;
        let geometry = conn
            .get_geometry(window)
            .map_err(|_| SwapchainError::SurfaceLost)?;

        let extent = Extent::new(geometry.width.into(), geometry.height.into());
        let alpha = if visual_has_alpha(&visual, depth) {
            ALPHA_BLENDED
        } else {
            ALPHA_OPAQUE
        };

        Ok(SurfaceCapabilities {
            current_extent: extent,
            min_image_extent: extent,
            max_image_extent: extent,
            min_image_count: self.min_image_count(),
            max_image_count: None,
            max_image_array_layers: 1,
            supported_composite_alpha: alpha,
            current_transform: Transform::Identity,
            supported_transforms: &[Transform::Identity],
        })
    }

    /// The formats presentable to the surface's visual, best first.
    pub fn surface_formats<C: Connection>(
        &self,
        surface: &Surface<C>,
    ) -> Result<Vec<SurfaceFormat>, SwapchainError> {
        let conn = surface.connection();
        let (visual, _) = visualtype_for_window(&**conn, surface.window())
            .ok_or(SwapchainError::SurfaceLost)?;

        let mut sorted = ArrayVec::<[Format; 3]>::new();
        for entry in &SURFACE_FORMATS {
            if entry.bits_per_rgb == visual.red_mask.count_ones()
                && entry.bits_per_rgb == visual.green_mask.count_ones()
                && entry.bits_per_rgb == visual.blue_mask.count_ones()
            {
                sorted.push(entry.format);
            }
        }

        if self.device().force_bgra8_unorm_first() {
            if let Some(pos) = sorted.iter().position(|f| *f == Format::Bgra8Unorm) {
                sorted.swap(0, pos);
            }
        }

        Ok(sorted
            .into_iter()
            .map(|format| SurfaceFormat {
                format,
                color_space: ColorSpace::SrgbNonlinear,
            })
            .collect())
    }

    /// The supported present modes, in priority order.
    pub fn surface_present_modes(&self) -> &'static [PresentMode] {
        &PRESENT_MODES
    }

    /// The region of the surface that presentation reaches: the whole
    /// window.
    pub fn surface_present_rectangles<C: Connection>(
        &self,
        surface: &Surface<C>,
    ) -> Result<Vec<Rectangle>, SwapchainError> {
        let geometry = surface
            .connection()
            .get_geometry(surface.window())
            .map_err(|_| SwapchainError::SurfaceLost)?;
        Ok(vec![Rectangle {
            x: 0,
            y: 0,
            width: geometry.width,
            height: geometry.height,
        }])
    }
}
