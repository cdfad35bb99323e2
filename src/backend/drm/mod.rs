//! Plumbing shared by both DRM backends: the device wrapper, connector
//! naming, CRTC selection, DPMS properties and saved CRTC state.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::rc::Rc;

use drm::control::{connector, crtc, framebuffer, Device as ControlDevice, ModeTypeFlags};
use rustix::fs::{self, OFlags};
use tracing::warn;

use crate::mode::{Mode, ModeOps};
use crate::types::{ConnectorId, DpmsState};
use crate::{Error, Result};

pub(crate) mod dumb;
pub(crate) mod gpu;

/// A DRM device node. Cloning shares the fd.
#[derive(Debug, Clone)]
pub(crate) struct Card(Rc<OwnedFd>);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(node: &Path) -> Result<Self> {
        let fd = fs::open(
            node,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NONBLOCK,
            fs::Mode::empty(),
        )
        .map_err(|errno| map_drm_err(io::Error::from(errno)))?;
        Ok(Self(Rc::new(fd)))
    }

    /// A second fd to the same device, for event-loop registration.
    pub fn dup_fd(&self) -> Option<OwnedFd> {
        self.0.try_clone().ok()
    }
}

/// State shared between a DRM video backend and its display payloads.
#[derive(Debug)]
pub(crate) struct DrmShared {
    pub card: Card,
    /// CRTCs currently claimed by an opened display.
    pub taken: RefCell<HashSet<crtc::Handle>>,
}

impl DrmShared {
    pub fn new(card: Card) -> Rc<Self> {
        Rc::new(Self {
            card,
            taken: RefCell::new(HashSet::new()),
        })
    }
}

/// Maps a kernel error from a modesetting ioctl into the crate taxonomy.
/// A vanished device is reported as such so callers can treat the whole
/// video object as gone.
pub(crate) fn map_drm_err(err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(code) if code == rustix::io::Errno::NODEV.raw_os_error() => Error::DeviceGone,
        _ => Error::HardwareRejected(err),
    }
}

/// `HDMI-A-1` style connector names.
pub(crate) fn connector_name(info: &connector::Info) -> String {
    format!("{}-{}", info.interface().as_str(), info.interface_id())
}

/// Picks a CRTC for a connector. The CRTC the connector's encoder is
/// already associated with wins if nothing else claimed it; otherwise
/// the first compatible unclaimed CRTC is used.
pub(crate) fn select_crtc<T>(current: Option<T>, possible: &[T], taken: &HashSet<T>) -> Option<T>
where
    T: Copy + Eq + Hash,
{
    if let Some(cur) = current {
        if possible.contains(&cur) && !taken.contains(&cur) {
            return Some(cur);
        }
    }
    possible.iter().copied().find(|c| !taken.contains(c))
}

/// Walks a connector's encoders and selects an unclaimed CRTC, or fails
/// with `ResourceExhausted` when every compatible CRTC is claimed.
pub(crate) fn find_crtc(
    card: &Card,
    conn: &connector::Info,
    taken: &HashSet<crtc::Handle>,
) -> Result<crtc::Handle> {
    let res = card.resource_handles().map_err(map_drm_err)?;
    let current = conn
        .current_encoder()
        .and_then(|enc| card.get_encoder(enc).ok())
        .and_then(|enc| enc.crtc());

    for &enc in conn.encoders() {
        let Ok(info) = card.get_encoder(enc) else {
            continue;
        };
        let possible = res.filter_crtcs(info.possible_crtcs());
        if let Some(crtc) = select_crtc(current, &possible, taken) {
            return Ok(crtc);
        }
    }
    Err(Error::ResourceExhausted("no unclaimed CRTC for connector"))
}

/// Connected connectors on the device, in kernel enumeration order.
/// Also returns the raw handles so the caller can map ids back.
pub(crate) fn scan_connectors(
    card: &Card,
) -> Result<(Vec<super::ConnectorReport>, HashMap<ConnectorId, connector::Handle>)> {
    let res = card.resource_handles().map_err(map_drm_err)?;
    let mut reports = Vec::new();
    let mut handles = HashMap::new();
    for &conn in res.connectors() {
        let info = match card.get_connector(conn, false) {
            Ok(info) => info,
            Err(err) => {
                warn!("skipping unreadable connector: {err}");
                continue;
            }
        };
        if info.state() != connector::State::Connected {
            continue;
        }
        let id = ConnectorId(u32::from(conn));
        reports.push(super::ConnectorReport {
            id,
            name: connector_name(&info),
        });
        handles.insert(id, conn);
    }
    Ok((reports, handles))
}

/// A kernel mode wrapped for the shared mode handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DrmMode {
    pub info: drm::control::Mode,
}

impl ModeOps for DrmMode {
    fn name(&self) -> std::borrow::Cow<'_, str> {
        self.info.name().to_string_lossy()
    }

    fn width(&self) -> u32 {
        self.info.size().0 as u32
    }

    fn height(&self) -> u32 {
        self.info.size().1 as u32
    }

    fn refresh_mhz(&self) -> Option<u32> {
        Some(self.info.vrefresh() * 1000)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Builds the mode list for a connector and picks the preferred entry.
pub(crate) fn mode_list(conn: &connector::Info) -> Result<(Vec<Mode>, usize)> {
    let modes: Vec<Mode> = conn
        .modes()
        .iter()
        .map(|&info| Mode::new(Rc::new(DrmMode { info })))
        .collect();
    if modes.is_empty() {
        return Err(Error::ResourceExhausted("connector reports no modes"));
    }
    let preferred = conn
        .modes()
        .iter()
        .position(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
        .unwrap_or(0);
    Ok((modes, preferred))
}

/// Scanout state captured before activation, restored on deactivation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SavedCrtc {
    crtc: crtc::Handle,
    fb: Option<framebuffer::Handle>,
    pos: (u32, u32),
    mode: Option<drm::control::Mode>,
}

impl SavedCrtc {
    pub fn capture(card: &Card, crtc: crtc::Handle) -> Result<Self> {
        let info = card.get_crtc(crtc).map_err(map_drm_err)?;
        Ok(Self {
            crtc,
            fb: info.framebuffer(),
            pos: info.position(),
            mode: info.mode(),
        })
    }

    /// Puts the saved scanout back. Errors are the caller's to log.
    pub fn restore(&self, card: &Card, conn: connector::Handle) -> Result<()> {
        card.set_crtc(self.crtc, self.fb, self.pos, &[conn], self.mode)
            .map_err(map_drm_err)
    }
}

/// Looks up a named property on a connector.
pub(crate) fn connector_property(
    card: &Card,
    conn: connector::Handle,
    name: &str,
) -> Result<drm::control::property::Handle> {
    let props = card.get_properties(conn).map_err(map_drm_err)?;
    let (ids, _values) = props.as_props_and_values();
    for &id in ids {
        let info = card.get_property(id).map_err(map_drm_err)?;
        if info.name().to_str() == Ok(name) {
            return Ok(id);
        }
    }
    Err(Error::NotSupported("connector property"))
}

fn dpms_value(state: DpmsState) -> u64 {
    match state {
        DpmsState::On => 0,
        DpmsState::Standby => 1,
        DpmsState::Suspend => 2,
        DpmsState::Off => 3,
    }
}

/// Writes the DPMS property of a connector.
pub(crate) fn set_dpms(card: &Card, conn: connector::Handle, state: DpmsState) -> Result<()> {
    let prop = connector_property(card, conn, "DPMS")?;
    card.set_property(conn, prop, dpms_value(state))
        .map_err(map_drm_err)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn select_prefers_the_current_crtc() {
        let taken = HashSet::new();
        assert_eq!(select_crtc(Some(2u32), &[1, 2], &taken), Some(2));
    }

    #[test]
    fn select_skips_claimed_crtcs() {
        let mut taken = HashSet::new();
        taken.insert(2u32);
        assert_eq!(select_crtc(Some(2u32), &[1, 2], &taken), Some(1));
        taken.insert(1);
        assert_eq!(select_crtc(Some(2u32), &[1, 2], &taken), None);
    }

    #[test]
    fn assignment_order_cannot_starve_the_narrow_connector() {
        // first connector's encoder sits on CRTC b but could also use a;
        // second connector can only ever use a
        let (a, b) = (1u32, 2u32);
        let mut taken = HashSet::new();

        let first = select_crtc(Some(b), &[a, b], &taken).unwrap();
        assert_eq!(first, b);
        taken.insert(first);

        let second = select_crtc(None, &[a], &taken).unwrap();
        assert_eq!(second, a);
        taken.insert(second);

        // and a third claimant is correctly refused
        assert_eq!(select_crtc(None, &[a, b], &taken), None);
    }

    #[test]
    fn dpms_values_match_the_kernel_encoding() {
        assert_eq!(dpms_value(DpmsState::On), 0);
        assert_eq!(dpms_value(DpmsState::Standby), 1);
        assert_eq!(dpms_value(DpmsState::Suspend), 2);
        assert_eq!(dpms_value(DpmsState::Off), 3);
    }
}
