// MIT/Apache2 License

//! Capability probing for X connections.
//!
//! One probe per connection, cached by the engine for the life of the
//! process. The probe decides which presentation path is usable at all:
//! DRI3 pixmap sharing, format modifiers, MIT-SHM for software chains,
//! and the XWayland quirks.

use crate::x11::{Connection, ErrorCode, ShmSeg, X11Error};

/// What a particular X server connection is capable of. Immutable once
/// probed.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCaps {
    pub has_dri3: bool,
    pub has_dri3_modifiers: bool,
    pub has_present: bool,
    pub has_xfixes: bool,
    pub has_mit_shm: bool,
    pub is_xwayland: bool,
    /// A proprietary DDX is driving this server. Only used to suppress
    /// the missing-DRI3 warning, which would otherwise confuse users of
    /// hybrid setups.
    pub is_proprietary_x11: bool,
}

/// Probe a connection. Returns `None` when the probe requests themselves
/// fail, which callers surface as an out-of-host-memory condition.
pub(crate) fn probe_connection<C: Connection>(conn: &C, wants_shm: bool) -> Option<ConnectionCaps> {
    // One batch so the round-trips pipeline. SYNC is pulled in for the
    // fence ids; its answer itself is unused.
    let mut names = vec![
        "SYNC",
        "DRI3",
        "Present",
        "RANDR",
        "XFIXES",
        "XWAYLAND",
        "ATIFGLRXDRI",
        "NV-CONTROL",
    ];
    if wants_shm {
        names.push("MIT-SHM");
    }

    let present = conn.query_extensions(&names).ok()?;
    let ext = |i: usize| present.get(i).copied().unwrap_or(false);
    let (dri3, pres, randr, xfixes, xwayland, amd, nv) =
        (ext(1), ext(2), ext(3), ext(4), ext(5), ext(6), ext(7));
    let shm = wants_shm && ext(8);

    let mut caps = ConnectionCaps {
        has_dri3: dri3,
        has_present: pres,
        ..Default::default()
    };

    let mut has_dri3_v1_2 = false;
    if caps.has_dri3 {
        if let Ok((major, minor)) = conn.dri3_query_version(1, 2) {
            has_dri3_v1_2 = major > 1 || minor >= 2;
        }
    }

    let mut has_present_v1_2 = false;
    if caps.has_present {
        if let Ok((major, minor)) = conn.present_query_version(1, 2) {
            has_present_v1_2 = major > 1 || minor >= 2;
        }
    }
    caps.has_dri3_modifiers = has_dri3_v1_2 && has_present_v1_2;

    // Damage regions need XFIXES 2; older servers report the extension
    // but cannot express them.
    caps.has_xfixes = xfixes
        && conn
            .xfixes_query_version(6, 0)
            .map(|(major, _)| major >= 2)
            .unwrap_or(false);

    caps.is_xwayland = detect_xwayland(conn, randr, xwayland);
    caps.is_proprietary_x11 = amd || nv;

    if caps.has_dri3 && caps.has_present && shm {
        let shared_pixmaps = conn
            .shm_query_version()
            .map(|v| v.shared_pixmaps)
            .unwrap_or(false);
        if shared_pixmaps {
            // Poke the opcode with a bogus segment. BadRequest means the
            // server lacks MIT-SHM detach entirely; any other error means
            // the opcode works and merely rejected the segment.
            if let Err(X11Error::Request(err)) = conn.shm_detach(ShmSeg(0)) {
                if err.code != ErrorCode::REQUEST {
                    caps.has_mit_shm = true;
                }
            }
        }
    }

    log::debug!("probed X connection: {caps:?}");
    Some(caps)
}

fn detect_xwayland<C: Connection>(conn: &C, has_randr: bool, has_xwayland_ext: bool) -> bool {
    // Newer XWayland exposes an extension we can check for directly.
    if has_xwayland_ext {
        return true;
    }

    // Older XWayland puts the word "XWAYLAND" in its RandR output names.
    if !has_randr {
        return false;
    }
    let has_randr_v1_3 = match conn.randr_query_version(1, 3) {
        Ok((major, minor)) => major > 1 || minor >= 3,
        Err(_) => false,
    };
    if !has_randr_v1_3 {
        return false;
    }

    let setup = conn.setup();
    let root = match setup.roots.first() {
        Some(screen) => screen.root,
        None => return false,
    };
    let resources = match conn.randr_get_screen_resources_current(root) {
        Ok(r) => r,
        Err(_) => return false,
    };
    let first = match resources.outputs.first() {
        Some(output) => *output,
        None => return false,
    };
    match conn.randr_get_output_info(first, resources.config_timestamp) {
        Ok(info) => info.name.starts_with("XWAYLAND"),
        Err(_) => false,
    }
}
