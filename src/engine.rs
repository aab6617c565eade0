// MIT/Apache2 License

//! The engine instance: per-connection capability cache plus the device
//! and options everything else reads.

use crate::options::{debug_noshm, Options};
use crate::probe::{self, ConnectionCaps};
use crate::wsi::Device;
use crate::x11::{Connection, ConnectionId};
use ahash::AHashMap;
use std::sync::{Arc, Mutex};

/// Fallback minimum image count. Pipelined rendering needs one image
/// being built on the CPU, one on the GPU and one on scanout to run at
/// full speed, so three unless the configuration overrides it.
const MIN_IMAGE_COUNT: u32 = 3;

/// One presentation engine per driver device.
///
/// Holds the process-wide connection capability cache; its lifecycle is
/// bound to the device (created at device init, dropped at device
/// teardown), and swapchains keep it alive through an [`Arc`].
#[derive(Debug)]
pub struct PresentEngine<D> {
    device: Arc<D>,
    options: Options,
    connections: Mutex<AHashMap<ConnectionId, Arc<ConnectionCaps>>>,
}

impl<D: Device> PresentEngine<D> {
    pub fn new(device: Arc<D>, options: Options) -> Arc<Self> {
        Arc::new(Self {
            device,
            options,
            connections: Mutex::new(AHashMap::new()),
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The capabilities of a connection, probing it on first sight.
    ///
    /// `None` means the probe requests failed; callers report that as an
    /// out-of-host-memory condition for lack of a finer signal.
    pub fn connection_caps<C: Connection>(&self, conn: &C) -> Option<Arc<ConnectionCaps>> {
        let key = conn.id();

        {
            let table = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(caps) = table.get(&key) {
                return Some(caps.clone());
            }
        }

        // Probing is a pile of blocking round-trips; keep the table
        // unlocked meanwhile. Racing probes of the same connection are
        // tolerated, the loser's entry is simply dropped.
        let wants_shm =
            self.device.is_software() && !debug_noshm() && self.device.has_host_memory_import();
        let caps = Arc::new(probe::probe_connection(conn, wants_shm)?);

        let mut table = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        Some(table.entry(key).or_insert(caps).clone())
    }

    /// The minimum image count advertised for surfaces.
    #[inline]
    pub(crate) fn min_image_count(&self) -> u32 {
        if self.options.override_min_image_count != 0 {
            self.options.override_min_image_count
        } else {
            MIN_IMAGE_COUNT
        }
    }
}
