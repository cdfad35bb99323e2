//! Display objects.
//!
//! A [`Display`] is a cheap-clone handle over one output. Its lifecycle
//! runs detached → bound-offline → bound-online and back; every
//! observable transition is published to the display's observers. The
//! owning video object binds and detaches displays as connectors come
//! and go; a handle that outlives its connector stays valid and fails
//! rendering ops with [`Error::DeviceGone`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{DisplayBackend, DisplayParts};
use crate::eventloop::EventLoop;
use crate::hook::{Hooks, Subscription};
use crate::mode::Mode;
use crate::types::{BlendRequest, Color, ConnectorId, DpmsState, Rect, VideoBuffer};
use crate::vblank::{VblankState, DEFAULT_VBLANK_INTERVAL};
use crate::video::{VideoFlags, VideoInner};
use crate::{Error, Result};

bitflags! {
    /// Display state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DisplayFlags: u32 {
        /// The display is actively scanning out.
        const ONLINE = 1 << 0;
        /// A swap is in flight; the next vblank has not been seen yet.
        const VSYNC = 1 << 1;
        /// The display is bound to a live video object.
        const AVAILABLE = 1 << 2;
        /// The display has been made the current rendering target.
        const OPEN = 1 << 3;
        /// The backend double-buffers this display.
        const DBUF = 1 << 4;
        /// The backend dithers output on this display.
        const DITHERING = 1 << 5;
    }
}

/// State changes published to display observers.
#[derive(Debug, Clone, Copy)]
pub enum DisplayEvent {
    /// The active mode changed while online.
    ModeSet,
    /// The display went online.
    Activate,
    /// The display went offline.
    Deactivate,
    /// The power state changed.
    Dpms(DpmsState),
    /// A pending swap completed.
    VBlank,
}

/// Observer callback for display events.
pub type DisplayCallback = dyn Fn(&Display, &DisplayEvent);

/// A handle to one display output.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Debug, Clone)]
pub struct Display {
    inner: Rc<RefCell<DisplayInner>>,
}

#[derive(Debug)]
struct DisplayInner {
    name: String,
    id: ConnectorId,
    flags: DisplayFlags,
    hw_vsync: bool,
    video: Weak<RefCell<VideoInner>>,
    eloop: Option<Rc<dyn EventLoop>>,
    modes: Vec<Mode>,
    default_mode: usize,
    current: Option<Mode>,
    dpms: DpmsState,
    vblank: VblankState,
    hooks: Hooks<DisplayCallback>,
    backend: Box<dyn DisplayBackend>,
}

fn ensure_awake(video: &Weak<RefCell<VideoInner>>) -> Result<()> {
    let video = video.upgrade().ok_or(Error::DeviceGone)?;
    if !video.borrow().flags().contains(VideoFlags::AWAKE) {
        return Err(Error::InvalidState("video object is asleep"));
    }
    Ok(())
}

fn render_guard(inner: &DisplayInner) -> Result<()> {
    ensure_awake(&inner.video)?;
    if !inner.flags.contains(DisplayFlags::ONLINE) {
        return Err(Error::InvalidState("display is not online"));
    }
    Ok(())
}

impl Display {
    pub(crate) fn new(
        name: String,
        id: ConnectorId,
        parts: DisplayParts,
        vblank_interval: Duration,
    ) -> Self {
        let mut flags = DisplayFlags::empty();
        if parts.double_buffered {
            flags.insert(DisplayFlags::DBUF);
        }
        if parts.dithering {
            flags.insert(DisplayFlags::DITHERING);
        }
        Self {
            inner: Rc::new(RefCell::new(DisplayInner {
                name,
                id,
                flags,
                hw_vsync: parts.hardware_vsync,
                video: Weak::new(),
                eloop: None,
                modes: parts.modes,
                default_mode: parts.default_mode,
                current: None,
                dpms: DpmsState::On,
                vblank: VblankState::new(vblank_interval),
                hooks: Hooks::new(),
                backend: parts.backend,
            })),
        }
    }

    pub(crate) fn bind(&self, video: Weak<RefCell<VideoInner>>, eloop: Rc<dyn EventLoop>) {
        let mut inner = self.inner.borrow_mut();
        inner.video = video;
        inner.eloop = Some(eloop);
        inner.flags.insert(DisplayFlags::AVAILABLE);
    }

    /// The connector name, e.g. `HDMI-A-1`.
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// The connector this display sits on.
    pub fn connector_id(&self) -> ConnectorId {
        self.inner.borrow().id
    }

    /// The current state flags.
    pub fn flags(&self) -> DisplayFlags {
        self.inner.borrow().flags
    }

    /// Whether the display is actively scanning out.
    pub fn is_online(&self) -> bool {
        self.flags().contains(DisplayFlags::ONLINE)
    }

    /// Whether the display is bound to a live video object.
    pub fn is_available(&self) -> bool {
        self.flags().contains(DisplayFlags::AVAILABLE)
    }

    /// The modes this display supports.
    pub fn modes(&self) -> Vec<Mode> {
        self.inner.borrow().modes.clone()
    }

    /// The mode used when `activate` is not given one.
    pub fn default_mode(&self) -> Option<Mode> {
        let inner = self.inner.borrow();
        inner.modes.get(inner.default_mode).cloned()
    }

    /// The active mode. `Some` exactly while online.
    pub fn current_mode(&self) -> Option<Mode> {
        self.inner.borrow().current.clone()
    }

    /// The last requested power state.
    pub fn dpms(&self) -> DpmsState {
        self.inner.borrow().dpms
    }

    /// Registers an observer for this display's events.
    pub fn subscribe(&self, cb: impl Fn(&Display, &DisplayEvent) + 'static) -> Subscription {
        self.inner.borrow_mut().hooks.add(Rc::new(cb))
    }

    /// Removes an observer. Takes effect from the next event onwards.
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        self.inner.borrow_mut().hooks.remove(sub)
    }

    /// Puts the display on screen with `mode`, or its default mode.
    ///
    /// Requires a bound, offline, awake display.
    pub fn activate(&self, mode: Option<&Mode>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.flags.contains(DisplayFlags::AVAILABLE) {
                return Err(Error::InvalidState("display is not attached"));
            }
            if inner.flags.contains(DisplayFlags::ONLINE) {
                return Err(Error::InvalidState("display is already online"));
            }
            ensure_awake(&inner.video)?;
            let mode = match mode {
                Some(mode) => mode.clone(),
                None => inner
                    .modes
                    .get(inner.default_mode)
                    .cloned()
                    .ok_or(Error::InvalidState("display has no modes"))?,
            };
            inner.backend.activate(&mode)?;
            let interval = mode.vblank_interval(DEFAULT_VBLANK_INTERVAL);
            inner.vblank.set_interval(interval);
            inner.flags.insert(DisplayFlags::ONLINE);
            inner.current = Some(mode);
            debug!("display {} is online", inner.name);
        }
        self.publish(DisplayEvent::Activate);
        Ok(())
    }

    /// Switches the active mode without going offline.
    pub fn switch_mode(&self, mode: &Mode) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            render_guard(&inner)?;
            if inner.current.as_ref() == Some(mode) {
                return Ok(());
            }
            inner.backend.activate(mode)?;
            let interval = mode.vblank_interval(DEFAULT_VBLANK_INTERVAL);
            inner.vblank.set_interval(interval);
            inner.current = Some(mode.clone());
        }
        self.publish(DisplayEvent::ModeSet);
        Ok(())
    }

    /// Takes the display off screen, restoring whatever was scanned out
    /// before activation. Backend teardown failures are logged, the
    /// display still goes offline.
    pub fn deactivate(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.flags.contains(DisplayFlags::ONLINE) {
                return Err(Error::InvalidState("display is not online"));
            }
            if let Err(err) = inner.backend.deactivate() {
                warn!("backend deactivate failed for {}: {err}", inner.name);
            }
            inner.vblank.disarm();
            inner
                .flags
                .remove(DisplayFlags::ONLINE | DisplayFlags::VSYNC | DisplayFlags::OPEN);
            inner.current = None;
            debug!("display {} is offline", inner.name);
        }
        self.publish(DisplayEvent::Deactivate);
        Ok(())
    }

    /// Requests a power state. The state is recorded on the handle and,
    /// when the display is bound, written through to the hardware.
    pub fn set_dpms(&self, state: DpmsState) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.flags.contains(DisplayFlags::AVAILABLE) {
                ensure_awake(&inner.video)?;
                inner.backend.set_dpms(state)?;
            }
            inner.dpms = state;
        }
        self.publish(DisplayEvent::Dpms(state));
        Ok(())
    }

    /// Makes this display the current rendering target.
    pub fn make_current(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        render_guard(&inner)?;
        inner.backend.make_current()?;
        inner.flags.insert(DisplayFlags::OPEN);
        Ok(())
    }

    /// Publishes the pending frame. The display's `VBlank` event fires
    /// once the frame is on screen.
    pub fn swap(&self) -> Result<()> {
        let arm_timer = {
            let mut inner = self.inner.borrow_mut();
            render_guard(&inner)?;
            inner.backend.swap()?;
            inner.flags.insert(DisplayFlags::VSYNC);
            !inner.hw_vsync && inner.flags.contains(DisplayFlags::DBUF)
        };
        if arm_timer {
            self.arm_vblank()?;
        }
        Ok(())
    }

    /// Copies pixel data into the pending frame.
    pub fn blit(&self, buf: &VideoBuffer<'_>, x: u32, y: u32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        render_guard(&inner)?;
        inner.backend.blit(buf, x, y)
    }

    /// Fills a rectangle of the pending frame with a solid color.
    pub fn fill(&self, color: Color, rect: Rect) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        render_guard(&inner)?;
        inner.backend.fill(color, rect)
    }

    /// Composites coverage-blended glyphs into the pending frame.
    pub fn blend(&self, reqs: &[BlendRequest<'_>]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        render_guard(&inner)?;
        inner.backend.blend(reqs)
    }

    fn arm_vblank(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let Some(eloop) = inner.eloop.clone() else {
            return Ok(());
        };
        let weak = Rc::downgrade(&self.inner);
        inner.vblank.arm(
            &eloop,
            Box::new(move |_| {
                if let Some(rc) = weak.upgrade() {
                    Display { inner: rc }.complete_vsync();
                }
                None
            }),
        )
    }

    /// Completes a pending swap, either from the vblank timer or from a
    /// kernel page-flip event.
    pub(crate) fn complete_vsync(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.flags.remove(DisplayFlags::VSYNC);
            inner.vblank.clear_fired();
        }
        self.publish(DisplayEvent::VBlank);
    }

    /// Severs the display from its video object after hot-unplug or
    /// video teardown. Deactivates best-effort first; the handle stays
    /// valid but every rendering op fails `DeviceGone` from here on.
    pub(crate) fn force_detach(&self) {
        let was_online = {
            let mut inner = self.inner.borrow_mut();
            let was_online = inner.flags.contains(DisplayFlags::ONLINE);
            if was_online {
                if let Err(err) = inner.backend.deactivate() {
                    warn!("backend deactivate failed for {}: {err}", inner.name);
                }
            }
            inner.vblank.disarm();
            inner.flags.remove(
                DisplayFlags::ONLINE
                    | DisplayFlags::VSYNC
                    | DisplayFlags::OPEN
                    | DisplayFlags::AVAILABLE,
            );
            inner.current = None;
            inner.video = Weak::new();
            inner.eloop = None;
            // the handle may outlive the connector arbitrarily long;
            // device bookkeeping goes back now, not at drop
            inner.backend.release();
            was_online
        };
        if was_online {
            self.publish(DisplayEvent::Deactivate);
        }
    }

    /// Best-effort hardware restore for fatal-signal paths. Skips the
    /// display entirely if its state is mid-mutation.
    pub(crate) fn emergency_restore(&self) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.backend.emergency_restore();
        }
    }

    fn publish(&self, event: DisplayEvent) {
        let callbacks = self.inner.borrow().hooks.snapshot();
        for cb in callbacks {
            cb(self, &event);
        }
    }
}

impl PartialEq for Display {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::dummy::{DummyControl, ModeSpec};
    use crate::backend::VideoBackend;

    fn detached_display() -> (DummyControl, ConnectorId, Display) {
        let control = DummyControl::new();
        let id = control.plug(
            "VIRT-1",
            vec![ModeSpec {
                width: 640,
                height: 480,
                refresh_mhz: Some(60_000),
            }],
            0,
        );
        let mut backend = control.backend();
        let parts = backend.open_display(id).unwrap();
        let display = Display::new("VIRT-1".into(), id, parts, DEFAULT_VBLANK_INTERVAL);
        (control, id, display)
    }

    #[test]
    fn dpms_is_recorded_without_a_binding() {
        let (control, id, display) = detached_display();
        assert_eq!(display.dpms(), DpmsState::On);
        display.set_dpms(DpmsState::Off).unwrap();
        assert_eq!(display.dpms(), DpmsState::Off);
        // nothing was written through to the hardware
        assert_eq!(control.hardware_dpms(id), None);
    }

    #[test]
    fn activate_requires_a_binding() {
        let (_control, _id, display) = detached_display();
        assert!(matches!(
            display.activate(None),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn rendering_on_a_detached_display_reports_device_gone() {
        let (_control, _id, display) = detached_display();
        assert!(matches!(display.swap(), Err(Error::DeviceGone)));
        assert!(matches!(display.make_current(), Err(Error::DeviceGone)));
        assert!(matches!(
            display.fill(Color::BLACK, Rect::new(0, 0, 1, 1)),
            Err(Error::DeviceGone)
        ));
    }

    #[test]
    fn dpms_event_reaches_observers() {
        let (_control, _id, display) = detached_display();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        display.subscribe(move |_, ev| {
            if let DisplayEvent::Dpms(state) = ev {
                sink.borrow_mut().push(*state);
            }
        });
        display.set_dpms(DpmsState::Standby).unwrap();
        assert_eq!(*seen.borrow(), vec![DpmsState::Standby]);
    }

    #[test]
    fn observers_can_unsubscribe_during_dispatch() {
        let (_control, _id, display) = detached_display();
        let count = Rc::new(std::cell::Cell::new(0u32));
        let token: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

        let inner_count = Rc::clone(&count);
        let inner_token = Rc::clone(&token);
        let sub = display.subscribe(move |display, _| {
            inner_count.set(inner_count.get() + 1);
            if let Some(token) = inner_token.borrow_mut().take() {
                display.unsubscribe(token);
            }
        });
        *token.borrow_mut() = Some(sub);

        display.set_dpms(DpmsState::Off).unwrap();
        display.set_dpms(DpmsState::On).unwrap();
        assert_eq!(count.get(), 1);
    }
}
