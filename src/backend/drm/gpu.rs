//! The GPU-accelerated path: GBM scanout buffer objects, double
//! buffered, vsync paced by kernel page-flip events.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::rc::Rc;

use custom_debug_derive::Debug;
use drm::control::{connector, crtc, framebuffer, Device as ControlDevice, PageFlipFlags};
use drm::Device as BasicDevice;
use gbm::{BufferObject, BufferObjectFlags, Device as GbmDevice};
use tracing::{debug, warn};

use super::{
    connector_name, find_crtc, map_drm_err, mode_list, scan_connectors, Card, DrmMode, DrmShared,
    SavedCrtc,
};
use crate::backend::{
    BackendEvent, ConnectorReport, DisplayBackend, DisplayParts, VideoBackend,
};
use crate::mode::Mode;
use crate::render::Framebuffer;
use crate::types::{BackendKind, BlendRequest, Color, ConnectorId, DpmsState, Rect, VideoBuffer};
use crate::{Error, Result};

/// Video backend over a render-capable DRM node.
#[derive(Debug)]
pub(crate) struct GpuVideo {
    shared: Rc<DrmShared>,
    #[debug(skip)]
    gbm: Rc<GbmDevice<Card>>,
    connectors: HashMap<ConnectorId, connector::Handle>,
    /// Maps page-flip events back to the display that queued them.
    flips: Rc<std::cell::RefCell<HashMap<crtc::Handle, ConnectorId>>>,
}

impl GpuVideo {
    pub fn open(node: &Path) -> Result<Self> {
        let card = Card::open(node)?;
        let gbm = GbmDevice::new(card.clone()).map_err(map_drm_err)?;
        Ok(Self {
            shared: DrmShared::new(card),
            gbm: Rc::new(gbm),
            connectors: HashMap::new(),
            flips: Rc::new(std::cell::RefCell::new(HashMap::new())),
        })
    }
}

impl VideoBackend for GpuVideo {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
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
        self.flips.borrow_mut().insert(crtc, id);
        let (modes, default_mode) = mode_list(&info)?;
        debug!("opened {} on crtc {:?}", connector_name(&info), crtc);

        Ok(DisplayParts {
            backend: Box::new(GpuDisplay {
                shared: Rc::clone(&self.shared),
                gbm: Rc::clone(&self.gbm),
                flips: Rc::clone(&self.flips),
                conn,
                crtc,
                saved: None,
                frame: None,
            }),
            modes,
            default_mode,
            double_buffered: true,
            dithering: false,
            hardware_vsync: true,
        })
    }

    fn dispatch(&mut self) -> Result<Vec<BackendEvent>> {
        let events = match self.shared.card.receive_events() {
            Ok(events) => events,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(err) => return Err(map_drm_err(err)),
        };
        let flips = self.flips.borrow();
        let mut out = Vec::new();
        for event in events {
            if let drm::control::Event::PageFlip(flip) = event {
                if let Some(&id) = flips.get(&flip.crtc) {
                    out.push(BackendEvent::Frame(id));
                }
            }
        }
        Ok(out)
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

/// Two scanout buffer objects plus the staging buffer between them.
struct GpuFrame {
    staging: Framebuffer,
    bos: [BufferObject<()>; 2],
    fbs: [framebuffer::Handle; 2],
    front: usize,
}

impl std::fmt::Debug for GpuFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuFrame")
            .field("width", &self.staging.width())
            .field("height", &self.staging.height())
            .field("front", &self.front)
            .finish()
    }
}

#[derive(Debug)]
struct GpuDisplay {
    shared: Rc<DrmShared>,
    #[debug(skip)]
    gbm: Rc<GbmDevice<Card>>,
    flips: Rc<std::cell::RefCell<HashMap<crtc::Handle, ConnectorId>>>,
    conn: connector::Handle,
    crtc: crtc::Handle,
    saved: Option<SavedCrtc>,
    frame: Option<GpuFrame>,
}

impl GpuDisplay {
    fn frame_mut(&mut self) -> Result<&mut GpuFrame> {
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
        }
    }

    fn upload(&mut self, index: usize) -> Result<()> {
        let frame = self.frame_mut()?;
        let pitch = frame.bos[index].stride() as usize;
        let bytes = frame.staging.to_bytes(pitch);
        frame.bos[index].write(&bytes).map_err(map_drm_err)?;
        Ok(())
    }

    fn release_claims(&mut self) {
        self.shared.taken.borrow_mut().remove(&self.crtc);
        self.flips.borrow_mut().remove(&self.crtc);
    }
}

impl DisplayBackend for GpuDisplay {
    fn activate(&mut self, mode: &Mode) -> Result<()> {
        let drm_mode = mode
            .downcast::<DrmMode>()
            .ok_or(Error::InvalidState("mode belongs to another backend"))?
            .info;
        self.destroy_frame();

        let (w, h) = (mode.width(), mode.height());
        let flags = BufferObjectFlags::SCANOUT | BufferObjectFlags::WRITE;
        let bo_a = self
            .gbm
            .create_buffer_object::<()>(w, h, gbm::Format::Xrgb8888, flags)
            .map_err(map_drm_err)?;
        let bo_b = self
            .gbm
            .create_buffer_object::<()>(w, h, gbm::Format::Xrgb8888, flags)
            .map_err(map_drm_err)?;
        let fb_a = self.shared.card.add_framebuffer(&bo_a, 24, 32).map_err(map_drm_err)?;
        let fb_b = match self.shared.card.add_framebuffer(&bo_b, 24, 32) {
            Ok(fb) => fb,
            Err(err) => {
                if let Err(err) = self.shared.card.destroy_framebuffer(fb_a) {
                    warn!("failed to destroy framebuffer: {err}");
                }
                return Err(map_drm_err(err));
            }
        };

        if self.saved.is_none() {
            match SavedCrtc::capture(&self.shared.card, self.crtc) {
                Ok(saved) => self.saved = Some(saved),
                Err(err) => warn!("could not capture prior CRTC state: {err}"),
            }
        }

        self.frame = Some(GpuFrame {
            staging: Framebuffer::new(w, h),
            bos: [bo_a, bo_b],
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
        let fb = self.frame_mut()?.fbs[back];
        self.shared
            .card
            .page_flip(self.crtc, fb, PageFlipFlags::EVENT, None)
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
        self.release_claims();
    }

    fn emergency_restore(&mut self) {
        if let Some(saved) = self.saved {
            let _ = saved.restore(&self.shared.card, self.conn);
        }
    }
}

impl Drop for GpuDisplay {
    fn drop(&mut self) {
        self.destroy_frame();
        self.release_claims();
    }
}
