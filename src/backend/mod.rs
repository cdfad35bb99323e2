//! Backend dispatch.
//!
//! A backend is picked once, when a video object is constructed, and
//! everything after that goes through two trait objects: [`VideoBackend`]
//! for the device as a whole and [`DisplayBackend`] for one output.
//! Optional rendering ops default to [`Error::NotSupported`].

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::Path;

use tracing::{info, warn};

use crate::mode::Mode;
use crate::types::{BackendKind, BlendRequest, Color, ConnectorId, DpmsState, Rect, VideoBuffer};
use crate::video::BackendPreference;
use crate::{Error, Result};

pub(crate) mod drm;
pub mod dummy;

/// A connected output reported by a connector scan.
#[derive(Debug, Clone)]
pub(crate) struct ConnectorReport {
    pub id: ConnectorId,
    pub name: String,
}

/// Everything a backend hands over when a display is opened.
#[derive(Debug)]
pub(crate) struct DisplayParts {
    pub backend: Box<dyn DisplayBackend>,
    pub modes: Vec<Mode>,
    /// Index into `modes` of the preferred mode.
    pub default_mode: usize,
    pub double_buffered: bool,
    pub dithering: bool,
    /// Whether the device signals vsync itself (page-flip events). If
    /// false, frames are paced with the vblank timer.
    pub hardware_vsync: bool,
}

/// Events drained from the device fd.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BackendEvent {
    /// A pending swap on this connector's display completed.
    Frame(ConnectorId),
}

/// Per-display ops table.
pub(crate) trait DisplayBackend: fmt::Debug {
    /// Puts the output on screen with the given mode. Called again while
    /// active to switch modes; the previous frame state is torn down
    /// first.
    fn activate(&mut self, mode: &Mode) -> Result<()>;

    /// Takes the output off screen and restores whatever was scanned out
    /// before activation.
    fn deactivate(&mut self) -> Result<()>;

    /// Writes the power state through to the hardware.
    fn set_dpms(&mut self, state: DpmsState) -> Result<()>;

    /// Makes this display the current rendering target.
    fn make_current(&mut self) -> Result<()> {
        Ok(())
    }

    /// Publishes the pending frame.
    fn swap(&mut self) -> Result<()> {
        Err(Error::NotSupported("swap"))
    }

    fn blit(&mut self, _buf: &VideoBuffer<'_>, _x: u32, _y: u32) -> Result<()> {
        Err(Error::NotSupported("blit"))
    }

    fn fill(&mut self, _color: Color, _rect: Rect) -> Result<()> {
        Err(Error::NotSupported("fill"))
    }

    fn blend(&mut self, _reqs: &[BlendRequest<'_>]) -> Result<()> {
        Err(Error::NotSupported("blend"))
    }

    /// Frees device bookkeeping held for this display, such as its
    /// claimed CRTC. Called when the display is detached; the handle
    /// itself may live on arbitrarily long afterwards. Idempotent, and
    /// invoked again on drop.
    fn release(&mut self) {}

    /// Best-effort, non-allocating hardware restore for fatal-signal
    /// paths. Must not touch the event loop.
    fn emergency_restore(&mut self) {}
}

/// Per-device ops table.
pub(crate) trait VideoBackend: fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// A dup of the device fd to register with the event loop, if the
    /// backend has one.
    fn poll_fd(&self) -> Option<OwnedFd> {
        None
    }

    /// Enumerates currently connected outputs.
    fn scan(&mut self) -> Result<Vec<ConnectorReport>>;

    /// Opens one connected output.
    fn open_display(&mut self, id: ConnectorId) -> Result<DisplayParts>;

    /// Drains device events after the fd turned readable.
    fn dispatch(&mut self) -> Result<Vec<BackendEvent>> {
        Ok(Vec::new())
    }

    /// Releases the device around system suspend.
    fn sleep(&mut self) {}

    /// Reacquires the device after suspend.
    fn wake_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Device-level counterpart of [`DisplayBackend::emergency_restore`].
    fn emergency_restore(&mut self) {}
}

/// Probes the device node and picks a backend: the GPU path when the
/// node supports it, the dumb-buffer path otherwise.
pub(crate) fn probe(
    preference: BackendPreference,
    node: &Path,
) -> Result<Box<dyn VideoBackend>> {
    match preference {
        BackendPreference::Gpu => {
            let video = drm::gpu::GpuVideo::open(node)?;
            Ok(Box::new(video))
        }
        BackendPreference::Dumb => {
            let video = drm::dumb::DumbVideo::open(node)?;
            Ok(Box::new(video))
        }
        BackendPreference::Auto => match drm::gpu::GpuVideo::open(node) {
            Ok(video) => {
                info!("using the GPU backend for {}", node.display());
                Ok(Box::new(video))
            }
            Err(err) => {
                warn!(
                    "GPU backend unavailable for {} ({}), falling back to dumb buffers",
                    node.display(),
                    err
                );
                let video = drm::dumb::DumbVideo::open(node)?;
                Ok(Box::new(video))
            }
        },
    }
}
