//! The minimal framebuffer path: kernel dumb buffers, double buffered
//! by mode-setting the back buffer on swap, vsync paced by the vblank
//! timer.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::rc::Rc;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{connector, crtc, framebuffer, Device as ControlDevice};
use drm::Device as BasicDevice;
use tracing::{debug, warn};

use super::{
    connector_name, find_crtc, map_drm_err, mode_list, scan_connectors, Card, DrmMode, DrmShared,
    SavedCrtc,
};
use crate::backend::{ConnectorReport, DisplayBackend, DisplayParts, VideoBackend};
use crate::mode::Mode;
use crate::render::Framebuffer;
use crate::types::{BackendKind, BlendRequest, Color, ConnectorId, DpmsState, Rect, VideoBuffer};
use crate::{Error, Result};

/// Video backend over any modesetting node that can allocate dumb
/// buffers.
#[derive(Debug)]
pub(crate) struct DumbVideo {
    shared: Rc<DrmShared>,
    connectors: HashMap<ConnectorId, connector::Handle>,
}

impl DumbVideo {
    pub fn open(node: &Path) -> Result<Self> {
        let card = Card::open(node)?;
        let cap = card
            .get_driver_capability(drm::DriverCapability::DumbBuffer)
            .map_err(map_drm_err)?;
        if cap == 0 {
            return Err(Error::NotSupported("dumb buffers"));
        }
        Ok(Self {
            shared: DrmShared::new(card),
            connectors: HashMap::new(),
        })
    }
}

impl VideoBackend for DumbVideo {
    fn kind(&self) -> BackendKind {
        BackendKind::Dumb
    }

    fn poll_fd(&self) -> Option<OwnedFd> {
        self.shared.card.dup_fd()
    }

    fn scan(&mut self) -> Result<Vec<ConnectorReport>> {
        let (reports, handles) = scan_connectors(&self.shared.card)?;
        self.connectors = handles;
        Ok(reports)
    }

    fn open_display(&mut self, id: ConnectorId) -> Result<DisplayParts> {
        let &conn = self
            .connectors
            .get(&id)
            .ok_or(Error::InvalidState("unknown connector"))?;
        let info = self.shared.card.get_connector(conn, false).map_err(map_drm_err)?;
        if info.state() != connector::State::Connected {
            return Err(Error::InvalidState("connector is not connected"));
        }
        let crtc = find_crtc(&self.shared.card, &info, &self.shared.taken.borrow())?;
        self.shared.taken.borrow_mut().insert(crtc);
        let (modes, default_mode) = mode_list(&info)?;
        debug!("opened {} on crtc {:?}", connector_name(&info), crtc);

        Ok(DisplayParts {
            backend: Box::new(DumbDisplay {
                shared: Rc::clone(&self.shared),
                conn,
                crtc,
                saved: None,
                frame: None,
            }),
            modes,
            default_mode,
            double_buffered: true,
            dithering: false,
            hardware_vsync: false,
        })
    }

    fn sleep(&mut self) {
        if let Err(err) = self.shared.card.release_master_lock() {
            warn!("failed to drop DRM master: {err}");
        }
    }

    fn wake_up(&mut self) -> Result<()> {
        self.shared.card.acquire_master_lock().map_err(map_drm_err)
    }
}

struct DumbFrame {
    staging: Framebuffer,
    mode: drm::control::Mode,
    buffers: [DumbBuffer; 2],
    fbs: [framebuffer::Handle; 2],
    front: usize,
}

impl std::fmt::Debug for DumbFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumbFrame")
            .field("width", &self.staging.width())
            .field("height", &self.staging.height())
            .field("front", &self.front)
            .finish()
    }
}

#[derive(Debug)]
struct DumbDisplay {
    shared: Rc<DrmShared>,
    conn: connector::Handle,
    crtc: crtc::Handle,
    saved: Option<SavedCrtc>,
    frame: Option<DumbFrame>,
}

impl DumbDisplay {
    fn frame_mut(&mut self) -> Result<&mut DumbFrame> {
        self.frame
            .as_mut()
            .ok_or(Error::InvalidState("display is not active"))
    }

    fn destroy_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            for fb in frame.fbs {
                if let Err(err) = self.shared.card.destroy_framebuffer(fb) {
                    warn!("failed to destroy framebuffer: {err}");
                }
            }
            for buffer in frame.buffers {
                if let Err(err) = self.shared.card.destroy_dumb_buffer(buffer) {
                    warn!("failed to destroy dumb buffer: {err}");
                }
            }
        }
    }

    /// Copies the staging buffer into one of the dumb buffers through a
    /// fresh mapping.
    fn upload(&mut self, index: usize) -> Result<()> {
        let card = self.shared.card.clone();
        let frame = self.frame_mut()?;
        let pitch = frame.buffers[index].pitch() as usize;
        let mut mapping = card
            .map_dumb_buffer(&mut frame.buffers[index])
            .map_err(map_drm_err)?;
        frame.staging.copy_rows(mapping.as_mut(), pitch);
        Ok(())
    }
}

impl DisplayBackend for DumbDisplay {
    fn activate(&mut self, mode: &Mode) -> Result<()> {
        let drm_mode = mode
            .downcast::<DrmMode>()
            .ok_or(Error::InvalidState("mode belongs to another backend"))?
            .info;
        self.destroy_frame();

        let (w, h) = (mode.width(), mode.height());
        let card = &self.shared.card;
        let buf_a = card
            .create_dumb_buffer((w, h), DrmFourcc::Xrgb8888, 32)
            .map_err(map_drm_err)?;
        let buf_b = card
            .create_dumb_buffer((w, h), DrmFourcc::Xrgb8888, 32)
            .map_err(map_drm_err)?;
        let fb_a = card.add_framebuffer(&buf_a, 24, 32).map_err(map_drm_err)?;
        let fb_b = match card.add_framebuffer(&buf_b, 24, 32) {
            Ok(fb) => fb,
            Err(err) => {
                if let Err(err) = card.destroy_framebuffer(fb_a) {
                    warn!("failed to destroy framebuffer: {err}");
                }
                return Err(map_drm_err(err));
            }
        };

        if self.saved.is_none() {
            match SavedCrtc::capture(card, self.crtc) {
                Ok(saved) => self.saved = Some(saved),
                Err(err) => warn!("could not capture prior CRTC state: {err}"),
            }
        }

        self.frame = Some(DumbFrame {
            staging: Framebuffer::new(w, h),
            mode: drm_mode,
            buffers: [buf_a, buf_b],
            fbs: [fb_a, fb_b],
            front: 0,
        });
        self.upload(0)?;
        self.shared
            .card
            .set_crtc(self.crtc, Some(fb_a), (0, 0), &[self.conn], Some(drm_mode))
            .map_err(map_drm_err)
    }

    fn deactivate(&mut self) -> Result<()> {
        if let Some(saved) = self.saved.take() {
            if let Err(err) = saved.restore(&self.shared.card, self.conn) {
                warn!("failed to restore prior scanout: {err}");
            }
        }
        self.destroy_frame();
        Ok(())
    }

    fn set_dpms(&mut self, state: DpmsState) -> Result<()> {
        super::set_dpms(&self.shared.card, self.conn, state)
    }

    fn swap(&mut self) -> Result<()> {
        let back = 1 - self.frame_mut()?.front;
        self.upload(back)?;
        let frame = self.frame_mut()?;
        let (fb, mode) = (frame.fbs[back], frame.mode);
        self.shared
            .card
            .set_crtc(self.crtc, Some(fb), (0, 0), &[self.conn], Some(mode))
            .map_err(map_drm_err)?;
        self.frame_mut()?.front = back;
        Ok(())
    }

    fn blit(&mut self, buf: &VideoBuffer<'_>, x: u32, y: u32) -> Result<()> {
        self.frame_mut()?.staging.blit(buf, x, y)
    }

    fn fill(&mut self, color: Color, rect: Rect) -> Result<()> {
        self.frame_mut()?.staging.fill(color, rect);
        Ok(())
    }

    fn blend(&mut self, reqs: &[BlendRequest<'_>]) -> Result<()> {
        let frame = self.frame_mut()?;
        for req in reqs {
            frame.staging.blend(req)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.shared.taken.borrow_mut().remove(&self.crtc);
    }

    fn emergency_restore(&mut self) {
        if let Some(saved) = self.saved {
            let _ = saved.restore(&self.shared.card, self.conn);
        }
    }
}

impl Drop for DumbDisplay {
    fn drop(&mut self) {
        self.destroy_frame();
        self.shared.taken.borrow_mut().remove(&self.crtc);
    }
}
