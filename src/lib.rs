// MIT/Apache2 License

//! An X11 presentation engine: the bridge between a driver's GPU-rendered
//! images and the display server, speaking the server-side Present protocol.
//!
//! The engine allocates a fixed ring of shared images per window, exchanges
//! them with the server as DRI3 pixmaps (or `PutImage` transfers for software
//! rasterizers), and reconciles in-flight images, server events and client
//! acquire/present calls across the immediate, mailbox and fifo presentation
//! modes without stalling or leaking server resources.
//!
//! The server protocol codec and the driver proper are consumed through the
//! seam traits in [`x11`] and [`wsi`]; everything else lives here.

#![cfg(unix)]

pub(crate) mod util;

pub mod engine;
pub mod image;
pub mod options;
pub mod probe;
pub mod status;
pub mod surface;
pub mod swapchain;
pub mod wsi;
pub mod x11;

pub(crate) mod fence;
pub(crate) mod queue;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::PresentEngine;
pub use options::Options;
pub use probe::ConnectionCaps;
pub use status::{Status, SwapchainError};
pub use surface::{
    ColorSpace, CompositeAlpha, Format, PresentMode, Surface, SurfaceCapabilities, SurfaceFormat,
    Transform,
};
pub use swapchain::{AcquiredImage, RectLayer, Swapchain, SwapchainCreateInfo};
pub use wsi::{Device, Extent};
