// MIT/Apache2 License

//! Runtime options, as handed down from the loader's configuration.

use crate::util::env_to_boolean;
use once_cell::sync::Lazy;

/// Tunables recognised by the presentation engine.
///
/// These correspond to the `vk_x11_*` / `vk_xwayland_*` keys of the driver
/// configuration; the loader parses them and hands them over as plain
/// values.
#[derive(Debug, Clone)]
pub struct Options {
    /// Overrides the minimum image count reported for surfaces. Zero means
    /// no override.
    pub override_min_image_count: u32,
    /// Use exactly the image count the application asked for, with no
    /// mode-dependent adjustment.
    pub strict_image_count: bool,
    /// Raise the image count of new swapchains to the surface minimum.
    pub ensure_min_image_count: bool,
    /// Wait for rendering to finish before handing buffers to XWayland.
    pub xwayland_wait_ready: bool,
}

impl Default for Options {
    #[inline]
    fn default() -> Self {
        Self {
            override_min_image_count: 0,
            strict_image_count: false,
            ensure_min_image_count: false,
            xwayland_wait_ready: true,
        }
    }
}

static DEBUG_NOSHM: Lazy<bool> = Lazy::new(|| env_to_boolean("WSI_DEBUG_NOSHM", false));

/// Whether MIT-SHM use for software presentation is disabled for debugging.
#[inline]
pub(crate) fn debug_noshm() -> bool {
    *DEBUG_NOSHM
}
