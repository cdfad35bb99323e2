//! An in-memory backend with scriptable connectors.
//!
//! Useful for headless operation and for driving the crate without
//! hardware: [`DummyControl`] plugs and unplugs connectors, inspects
//! what the last swap put on screen, and observes mode teardown.

use std::any::Any;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use super::{ConnectorReport, DisplayBackend, DisplayParts, VideoBackend};
use crate::mode::{Mode, ModeOps};
use crate::render::Framebuffer;
use crate::types::{BackendKind, BlendRequest, Color, ConnectorId, DpmsState, Rect, VideoBuffer};
use crate::{Error, Result};

/// A mode advertised by a dummy connector.
#[derive(Debug, Clone, Copy)]
pub struct ModeSpec {
    /// Horizontal resolution in pixels.
    pub width: u32,
    /// Vertical resolution in pixels.
    pub height: u32,
    /// Refresh rate in millihertz, if the connector should report one.
    pub refresh_mhz: Option<u32>,
}

#[derive(Debug)]
struct DummyConnector {
    name: String,
    modes: Vec<ModeSpec>,
    preferred: usize,
    blend_supported: bool,
    front: Option<Framebuffer>,
    hardware_dpms: Option<DpmsState>,
}

#[derive(Debug, Default)]
struct DummyState {
    next_id: u32,
    connectors: IndexMap<ConnectorId, DummyConnector>,
    /// Displays that have handed their device claims back.
    releases: u32,
    fail_next_scan: bool,
}

/// Control surface for the dummy backend.
///
/// Cloning shares the scripted device.
#[derive(Debug, Clone, Default)]
pub struct DummyControl {
    state: Rc<RefCell<DummyState>>,
    mode_drops: Rc<Cell<u32>>,
}

impl DummyControl {
    /// Creates a device with no connectors plugged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugs a connector. It is picked up by the next `poll`.
    pub fn plug(&self, name: &str, modes: Vec<ModeSpec>, preferred: usize) -> ConnectorId {
        assert!(!modes.is_empty(), "a connector needs at least one mode");
        assert!(preferred < modes.len());
        let mut st = self.state.borrow_mut();
        st.next_id += 1;
        let id = ConnectorId(st.next_id);
        st.connectors.insert(
            id,
            DummyConnector {
                name: name.to_owned(),
                modes,
                preferred,
                blend_supported: true,
                front: None,
                hardware_dpms: None,
            },
        );
        id
    }

    /// Unplugs a connector. Returns false if it was never plugged.
    pub fn unplug(&self, id: ConnectorId) -> bool {
        self.state.borrow_mut().connectors.shift_remove(&id).is_some()
    }

    /// Configures whether displays on this connector accept blend
    /// requests.
    pub fn set_blend_supported(&self, id: ConnectorId, supported: bool) {
        if let Some(conn) = self.state.borrow_mut().connectors.get_mut(&id) {
            conn.blend_supported = supported;
        }
    }

    /// The pixels the last swap put on screen, if any.
    pub fn front_pixels(&self, id: ConnectorId) -> Option<Vec<u32>> {
        self.state
            .borrow()
            .connectors
            .get(&id)
            .and_then(|conn| conn.front.as_ref())
            .map(|fb| fb.pixels().to_vec())
    }

    /// The last power state written through to this connector.
    pub fn hardware_dpms(&self, id: ConnectorId) -> Option<DpmsState> {
        self.state
            .borrow()
            .connectors
            .get(&id)
            .and_then(|conn| conn.hardware_dpms)
    }

    /// How many mode descriptors created by this device have been torn
    /// down so far.
    pub fn mode_drops(&self) -> u32 {
        self.mode_drops.get()
    }

    /// How many displays have handed their device claims back, through
    /// detachment or teardown.
    pub fn release_count(&self) -> u32 {
        self.state.borrow().releases
    }

    /// Makes the next connector scan fail as if the device vanished.
    pub fn fail_next_scan(&self) {
        self.state.borrow_mut().fail_next_scan = true;
    }

    pub(crate) fn backend(&self) -> Box<dyn VideoBackend> {
        Box::new(DummyVideo {
            state: Rc::clone(&self.state),
            mode_drops: Rc::clone(&self.mode_drops),
        })
    }
}

#[derive(Debug)]
struct DummyMode {
    name: String,
    spec: ModeSpec,
    drops: Rc<Cell<u32>>,
}

impl ModeOps for DummyMode {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
    }

    fn width(&self) -> u32 {
        self.spec.width
    }

    fn height(&self) -> u32 {
        self.spec.height
    }

    fn refresh_mhz(&self) -> Option<u32> {
        self.spec.refresh_mhz
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DummyMode {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[derive(Debug)]
struct DummyVideo {
    state: Rc<RefCell<DummyState>>,
    mode_drops: Rc<Cell<u32>>,
}

impl VideoBackend for DummyVideo {
    fn kind(&self) -> BackendKind {
        BackendKind::Dummy
    }

    fn scan(&mut self) -> Result<Vec<ConnectorReport>> {
        if std::mem::take(&mut self.state.borrow_mut().fail_next_scan) {
            return Err(Error::DeviceGone);
        }
        Ok(self
            .state
            .borrow()
            .connectors
            .iter()
            .map(|(&id, conn)| ConnectorReport {
                id,
                name: conn.name.clone(),
            })
            .collect())
    }

    fn open_display(&mut self, id: ConnectorId) -> Result<DisplayParts> {
        let st = self.state.borrow();
        let conn = st
            .connectors
            .get(&id)
            .ok_or(Error::InvalidState("unknown connector"))?;
        let modes: Vec<Mode> = conn
            .modes
            .iter()
            .map(|&spec| {
                Mode::new(Rc::new(DummyMode {
                    name: format!("{}x{}", spec.width, spec.height),
                    spec,
                    drops: Rc::clone(&self.mode_drops),
                }))
            })
            .collect();
        Ok(DisplayParts {
            backend: Box::new(DummyDisplay {
                state: Rc::clone(&self.state),
                id,
                staging: None,
                released: false,
            }),
            modes,
            default_mode: conn.preferred,
            double_buffered: true,
            dithering: false,
            hardware_vsync: false,
        })
    }
}

#[derive(Debug)]
struct DummyDisplay {
    state: Rc<RefCell<DummyState>>,
    id: ConnectorId,
    staging: Option<Framebuffer>,
    released: bool,
}

impl DummyDisplay {
    fn staging_mut(&mut self) -> Result<&mut Framebuffer> {
        self.staging
            .as_mut()
            .ok_or(Error::InvalidState("display is not active"))
    }

    fn release_claims(&mut self) {
        if !self.released {
            self.released = true;
            self.state.borrow_mut().releases += 1;
        }
    }
}

impl DisplayBackend for DummyDisplay {
    fn activate(&mut self, mode: &Mode) -> Result<()> {
        if !self.state.borrow().connectors.contains_key(&self.id) {
            return Err(Error::DeviceGone);
        }
        self.staging = Some(Framebuffer::new(mode.width(), mode.height()));
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        self.staging = None;
        if let Some(conn) = self.state.borrow_mut().connectors.get_mut(&self.id) {
            conn.front = None;
        }
        Ok(())
    }

    fn set_dpms(&mut self, state: DpmsState) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let conn = st
            .connectors
            .get_mut(&self.id)
            .ok_or(Error::DeviceGone)?;
        conn.hardware_dpms = Some(state);
        Ok(())
    }

    fn swap(&mut self) -> Result<()> {
        let staging = self
            .staging
            .as_ref()
            .ok_or(Error::InvalidState("display is not active"))?
            .clone();
        let mut st = self.state.borrow_mut();
        let conn = st
            .connectors
            .get_mut(&self.id)
            .ok_or(Error::DeviceGone)?;
        conn.front = Some(staging);
        Ok(())
    }

    fn blit(&mut self, buf: &VideoBuffer<'_>, x: u32, y: u32) -> Result<()> {
        self.staging_mut()?.blit(buf, x, y)
    }

    fn fill(&mut self, color: Color, rect: Rect) -> Result<()> {
        self.staging_mut()?.fill(color, rect);
        Ok(())
    }

    fn blend(&mut self, reqs: &[BlendRequest<'_>]) -> Result<()> {
        let supported = self
            .state
            .borrow()
            .connectors
            .get(&self.id)
            .map(|conn| conn.blend_supported)
            .unwrap_or(false);
        if !supported {
            return Err(Error::NotSupported("blend"));
        }
        let staging = self.staging_mut()?;
        for req in reqs {
            staging.blend(req)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.release_claims();
    }
}

impl Drop for DummyDisplay {
    fn drop(&mut self) {
        self.release_claims();
    }
}
