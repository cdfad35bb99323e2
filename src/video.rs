//! Video objects.
//!
//! A [`Video`] owns one device node: it picks a backend at construction,
//! keeps the map of connected displays up to date, drains device events
//! off the fd, and publishes hotplug and power transitions to its
//! observers.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::backend::dummy::DummyControl;
use crate::backend::{self, BackendEvent, VideoBackend};
use crate::display::Display;
use crate::eventloop::{EventLoop, SourceHandle};
use crate::hook::{Hooks, Subscription};
use crate::types::{BackendKind, ConnectorId};
use crate::Result;

bitflags! {
    /// Video state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VideoFlags: u32 {
        /// The device is awake and may be rendered to.
        const AWAKE = 1 << 0;
        /// Connectors may have changed; a `poll` is due.
        const HOTPLUG = 1 << 1;
    }
}

/// Which backend `Video::open` should pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Probe the GPU path, fall back to dumb buffers.
    #[default]
    Auto,
    /// Require the GPU path.
    Gpu,
    /// Require the dumb-buffer path.
    Dumb,
}

/// Construction-time options for a video object.
#[derive(Debug, Clone, Copy)]
pub struct VideoConfig {
    /// Backend selection policy.
    pub backend: BackendPreference,
    /// Frame interval used when a mode does not report its refresh rate.
    pub vblank_interval: Duration,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            vblank_interval: crate::vblank::DEFAULT_VBLANK_INTERVAL,
        }
    }
}

/// State changes published to video observers.
#[derive(Debug, Clone)]
pub enum VideoEvent {
    /// A connector appeared; its display is bound and offline.
    DisplayAdded(Display),
    /// A connector vanished; its display has been detached.
    DisplayRemoved(Display),
    /// The device was put to sleep.
    Sleep,
    /// The device woke up.
    WakeUp,
}

/// Observer callback for video events.
pub type VideoCallback = dyn Fn(&Video, &VideoEvent);

/// A handle to one video device.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Debug, Clone)]
pub struct Video {
    inner: Rc<RefCell<VideoInner>>,
}

#[derive(Debug)]
pub(crate) struct VideoInner {
    flags: VideoFlags,
    config: VideoConfig,
    eloop: Rc<dyn EventLoop>,
    displays: IndexMap<ConnectorId, Display>,
    hooks: Hooks<VideoCallback>,
    backend: Box<dyn VideoBackend>,
    fd_source: Option<Box<dyn SourceHandle>>,
}

impl VideoInner {
    pub(crate) fn flags(&self) -> VideoFlags {
        self.flags
    }
}

impl Drop for VideoInner {
    fn drop(&mut self) {
        if let Some(mut source) = self.fd_source.take() {
            source.cancel();
        }
        for (_, display) in std::mem::take(&mut self.displays) {
            display.force_detach();
        }
    }
}

impl Video {
    /// Opens a device node and picks a backend per the config. The
    /// device fd is registered with the event loop; connected outputs
    /// are not enumerated until the first [`Video::poll`].
    pub fn open(
        config: VideoConfig,
        node: impl AsRef<Path>,
        eloop: Rc<dyn EventLoop>,
    ) -> Result<Video> {
        let backend = backend::probe(config.backend, node.as_ref())?;
        Self::with_backend(config, backend, eloop)
    }

    /// Opens a video object over a scripted in-memory device.
    pub fn open_dummy(
        config: VideoConfig,
        control: &DummyControl,
        eloop: Rc<dyn EventLoop>,
    ) -> Result<Video> {
        Self::with_backend(config, control.backend(), eloop)
    }

    fn with_backend(
        config: VideoConfig,
        backend: Box<dyn VideoBackend>,
        eloop: Rc<dyn EventLoop>,
    ) -> Result<Video> {
        let kind = backend.kind();
        let inner = Rc::new(RefCell::new(VideoInner {
            flags: VideoFlags::AWAKE | VideoFlags::HOTPLUG,
            config,
            eloop: Rc::clone(&eloop),
            displays: IndexMap::new(),
            hooks: Hooks::new(),
            backend,
            fd_source: None,
        }));
        let video = Video { inner };

        let fd = video.inner.borrow().backend.poll_fd();
        if let Some(fd) = fd {
            let weak = Rc::downgrade(&video.inner);
            let source = eloop.register_fd(
                fd,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        Video { inner }.dispatch_device();
                    }
                }),
            )?;
            video.inner.borrow_mut().fd_source = Some(source);
        }

        info!("opened {kind} video backend");
        Ok(video)
    }

    /// Which backend is driving this device.
    pub fn kind(&self) -> BackendKind {
        self.inner.borrow().backend.kind()
    }

    /// The current state flags.
    pub fn flags(&self) -> VideoFlags {
        self.inner.borrow().flags
    }

    /// Whether the device is awake.
    pub fn is_awake(&self) -> bool {
        self.flags().contains(VideoFlags::AWAKE)
    }

    /// Whether connectors may have changed since the last `poll`.
    pub fn hotplug_pending(&self) -> bool {
        self.flags().contains(VideoFlags::HOTPLUG)
    }

    /// The currently bound displays, in stable enumeration order.
    pub fn displays(&self) -> Vec<Display> {
        self.inner.borrow().displays.values().cloned().collect()
    }

    /// Looks up the display bound to a connector.
    pub fn find_display(&self, id: ConnectorId) -> Option<Display> {
        self.inner.borrow().displays.get(&id).cloned()
    }

    /// Registers an observer for this device's events.
    pub fn subscribe(&self, cb: impl Fn(&Video, &VideoEvent) + 'static) -> Subscription {
        self.inner.borrow_mut().hooks.add(Rc::new(cb))
    }

    /// Removes an observer. Takes effect from the next event onwards.
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        self.inner.borrow_mut().hooks.remove(sub)
    }

    /// Re-enumerates connectors and reconciles the display map.
    ///
    /// Vanished connectors force-detach their display and publish
    /// `DisplayRemoved` exactly once; new connectors bind a fresh
    /// display and publish `DisplayAdded`. Clears the hotplug flag.
    pub fn poll(&self) -> Result<()> {
        let reports = {
            let mut inner = self.inner.borrow_mut();
            // a failed scan keeps the hotplug flag; the connector set is
            // still unknown and a retry is due
            let reports = inner.backend.scan()?;
            inner.flags.remove(VideoFlags::HOTPLUG);
            reports
        };

        let mut added = Vec::new();
        let mut removed = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let present: HashSet<ConnectorId> = reports.iter().map(|r| r.id).collect();

            let gone: Vec<ConnectorId> = inner
                .displays
                .keys()
                .filter(|id| !present.contains(id))
                .copied()
                .collect();
            for id in gone {
                if let Some(display) = inner.displays.shift_remove(&id) {
                    removed.push(display);
                }
            }

            for report in reports {
                if inner.displays.contains_key(&report.id) {
                    continue;
                }
                match inner.backend.open_display(report.id) {
                    Ok(parts) => {
                        let display = Display::new(
                            report.name,
                            report.id,
                            parts,
                            inner.config.vblank_interval,
                        );
                        display.bind(Rc::downgrade(&self.inner), Rc::clone(&inner.eloop));
                        inner.displays.insert(report.id, display.clone());
                        added.push(display);
                    }
                    Err(err) => {
                        warn!("cannot open display on connector {}: {err}", report.id);
                    }
                }
            }
        }

        for display in removed {
            let name = display.name();
            debug!("display {name} vanished");
            display.force_detach();
            self.publish(&VideoEvent::DisplayRemoved(display));
        }
        for display in added {
            let name = display.name();
            debug!("display {name} appeared");
            self.publish(&VideoEvent::DisplayAdded(display));
        }
        Ok(())
    }

    /// Releases the device around system suspend. Rendering and
    /// activation fail `InvalidState` until [`Video::wake_up`].
    pub fn sleep(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.flags.contains(VideoFlags::AWAKE) {
                return;
            }
            inner.backend.sleep();
            inner.flags.remove(VideoFlags::AWAKE);
        }
        self.publish(&VideoEvent::Sleep);
    }

    /// Reacquires the device after suspend and marks a hotplug scan as
    /// due, since connectors may have changed while asleep.
    pub fn wake_up(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.flags.contains(VideoFlags::AWAKE) {
                return Ok(());
            }
            inner.backend.wake_up()?;
            inner.flags.insert(VideoFlags::AWAKE | VideoFlags::HOTPLUG);
        }
        self.publish(&VideoEvent::WakeUp);
        Ok(())
    }

    /// Best-effort hardware restore for fatal-signal paths. Does not
    /// allocate and never panics; displays whose state is mid-mutation
    /// are skipped.
    pub fn segfault(&self) {
        let Ok(inner) = self.inner.try_borrow() else {
            return;
        };
        for display in inner.displays.values() {
            display.emergency_restore();
        }
        drop(inner);
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.backend.emergency_restore();
        }
    }

    fn dispatch_device(&self) {
        let events = self.inner.borrow_mut().backend.dispatch();
        match events {
            Ok(events) => {
                for event in events {
                    match event {
                        BackendEvent::Frame(id) => {
                            let display = self.inner.borrow().displays.get(&id).cloned();
                            if let Some(display) = display {
                                display.complete_vsync();
                            }
                        }
                    }
                }
            }
            Err(crate::Error::DeviceGone) => {
                warn!("device vanished while draining events");
                self.inner.borrow_mut().flags.insert(VideoFlags::HOTPLUG);
            }
            Err(err) => warn!("failed to drain device events: {err}"),
        }
    }

    fn publish(&self, event: &VideoEvent) {
        let callbacks = self.inner.borrow().hooks.snapshot();
        for cb in callbacks {
            cb(self, event);
        }
    }
}

impl PartialEq for Video {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::dummy::ModeSpec;
    use crate::display::{DisplayEvent, DisplayFlags};
    use crate::eventloop::ManualLoop;
    use crate::types::{Color, DpmsState, Rect};
    use crate::Error;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn mode(width: u32, height: u32) -> ModeSpec {
        ModeSpec {
            width,
            height,
            refresh_mhz: Some(60_000),
        }
    }

    fn fixture() -> (DummyControl, ManualLoop, Video) {
        let control = DummyControl::new();
        let eloop = ManualLoop::new();
        let video = Video::open_dummy(
            VideoConfig::default(),
            &control,
            Rc::new(eloop.clone()),
        )
        .unwrap();
        (control, eloop, video)
    }

    #[test]
    fn poll_binds_connected_outputs() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(800, 600), mode(640, 480)], 0);

        let added = Rc::new(Cell::new(0u32));
        let sink = Rc::clone(&added);
        video.subscribe(move |_, ev| {
            if matches!(ev, VideoEvent::DisplayAdded(_)) {
                sink.set(sink.get() + 1);
            }
        });

        assert!(video.hotplug_pending());
        video.poll().unwrap();
        assert!(!video.hotplug_pending());
        assert_eq!(added.get(), 1);

        let display = video.find_display(id).unwrap();
        assert!(display.is_available());
        assert!(!display.is_online());
        assert_eq!(display.modes().len(), 2);
        assert_eq!(display.default_mode().unwrap().width(), 800);

        // a second poll with nothing changed is quiet
        video.poll().unwrap();
        assert_eq!(added.get(), 1);
        assert_eq!(video.displays().len(), 1);
    }

    #[test]
    fn activate_deactivate_round_trip() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        display.subscribe(move |_, ev| sink.borrow_mut().push(format!("{ev:?}")));

        display.activate(None).unwrap();
        assert!(display.is_online());
        assert_eq!(display.current_mode().unwrap().width(), 640);
        assert!(matches!(
            display.activate(None),
            Err(Error::InvalidState(_))
        ));

        display.deactivate().unwrap();
        assert!(!display.is_online());
        assert!(display.current_mode().is_none());
        assert!(display.is_available());
        assert!(matches!(display.deactivate(), Err(Error::InvalidState(_))));

        assert_eq!(*events.borrow(), vec!["Activate", "Deactivate"]);
    }

    #[test]
    fn rendering_lands_on_the_front_buffer_after_swap() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(2, 1)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();

        display.activate(None).unwrap();
        display.make_current().unwrap();
        assert!(display.flags().contains(DisplayFlags::OPEN));

        display
            .fill(Color::new(255, 0, 0), Rect::new(0, 0, 1, 1))
            .unwrap();
        assert_eq!(control.front_pixels(id), None);
        display.swap().unwrap();
        let front = control.front_pixels(id).unwrap();
        assert_eq!(front[0], 0xffff_0000);
        assert_eq!(front[1], 0xff00_0000);
    }

    #[test]
    fn vblank_fires_once_per_swap_and_never_after_deactivate() {
        let (control, eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(4, 4)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();
        display.activate(None).unwrap();

        let vblanks = Rc::new(Cell::new(0u32));
        let sink = Rc::clone(&vblanks);
        display.subscribe(move |_, ev| {
            if matches!(ev, DisplayEvent::VBlank) {
                sink.set(sink.get() + 1);
            }
        });

        display.swap().unwrap();
        assert!(display.flags().contains(DisplayFlags::VSYNC));
        eloop.advance(Duration::from_millis(17));
        assert_eq!(vblanks.get(), 1);
        assert!(!display.flags().contains(DisplayFlags::VSYNC));

        // single shot: more time passes, nothing else fires
        eloop.advance(Duration::from_secs(1));
        assert_eq!(vblanks.get(), 1);

        display.swap().unwrap();
        eloop.advance(Duration::from_millis(17));
        assert_eq!(vblanks.get(), 2);

        // a pending shot dies with deactivation
        display.swap().unwrap();
        display.deactivate().unwrap();
        eloop.advance(Duration::from_secs(1));
        assert_eq!(vblanks.get(), 2);
        assert_eq!(eloop.pending_timers(), 0);
    }

    #[test]
    fn switch_mode_updates_the_current_mode_and_fires_mode_set() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(800, 600), mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();
        let smaller = display.modes().remove(1);

        // switching is a rendering-path op; offline it is refused
        assert!(matches!(
            display.switch_mode(&smaller),
            Err(Error::InvalidState(_))
        ));

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        display.subscribe(move |_, ev| sink.borrow_mut().push(format!("{ev:?}")));

        display.activate(None).unwrap();
        assert_eq!(display.current_mode().unwrap().width(), 800);

        display.switch_mode(&smaller).unwrap();
        assert_eq!(display.current_mode().unwrap().width(), 640);
        assert!(display.is_online());

        // switching to the mode already in use is a quiet no-op
        display.switch_mode(&smaller).unwrap();
        assert_eq!(*events.borrow(), vec!["Activate", "ModeSet"]);
    }

    #[test]
    fn a_failed_scan_keeps_the_hotplug_flag() {
        let (control, _eloop, video) = fixture();
        control.plug("VIRT-1", vec![mode(640, 480)], 0);

        assert!(video.hotplug_pending());
        control.fail_next_scan();
        assert!(matches!(video.poll(), Err(Error::DeviceGone)));
        // the connector set is still unknown; a retry is due
        assert!(video.hotplug_pending());
        assert!(video.displays().is_empty());

        video.poll().unwrap();
        assert!(!video.hotplug_pending());
        assert_eq!(video.displays().len(), 1);
    }

    #[test]
    fn detachment_returns_device_claims_while_the_handle_lives() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();
        display.activate(None).unwrap();
        assert_eq!(control.release_count(), 0);

        control.unplug(id);
        video.poll().unwrap();

        // the stale handle is still alive, the device claims are not
        assert!(!display.is_available());
        assert_eq!(control.release_count(), 1);

        // dropping the handle later does not release twice
        drop(display);
        assert_eq!(control.release_count(), 1);
    }

    #[test]
    fn hot_unplug_detaches_and_reports_exactly_once() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();
        display.activate(None).unwrap();

        let removed = Rc::new(Cell::new(0u32));
        let sink = Rc::clone(&removed);
        video.subscribe(move |_, ev| {
            if matches!(ev, VideoEvent::DisplayRemoved(_)) {
                sink.set(sink.get() + 1);
            }
        });
        let deactivated = Rc::new(Cell::new(0u32));
        let sink = Rc::clone(&deactivated);
        display.subscribe(move |_, ev| {
            if matches!(ev, DisplayEvent::Deactivate) {
                sink.set(sink.get() + 1);
            }
        });

        control.unplug(id);
        video.poll().unwrap();
        video.poll().unwrap();

        assert_eq!(removed.get(), 1);
        assert_eq!(deactivated.get(), 1);
        assert!(video.displays().is_empty());

        // the stale handle stays safe to use
        assert!(!display.is_available());
        assert!(!display.is_online());
        assert!(matches!(display.swap(), Err(Error::DeviceGone)));
        assert!(matches!(display.make_current(), Err(Error::DeviceGone)));
    }

    #[test]
    fn sleep_blocks_rendering_until_wake() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();
        display.activate(None).unwrap();

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        video.subscribe(move |_, ev| {
            if matches!(ev, VideoEvent::Sleep | VideoEvent::WakeUp) {
                sink.borrow_mut().push(format!("{ev:?}"));
            }
        });

        video.sleep();
        video.sleep();
        assert!(!video.is_awake());
        assert!(matches!(display.swap(), Err(Error::InvalidState(_))));

        video.wake_up().unwrap();
        assert!(video.is_awake());
        assert!(video.hotplug_pending());
        display.make_current().unwrap();
        display.swap().unwrap();

        assert_eq!(*events.borrow(), vec!["Sleep", "WakeUp"]);
    }

    #[test]
    fn dpms_is_written_through_on_bound_displays() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();

        display.set_dpms(DpmsState::Off).unwrap();
        assert_eq!(display.dpms(), DpmsState::Off);
        assert_eq!(control.hardware_dpms(id), Some(DpmsState::Off));

        // the recorded state survives detachment
        control.unplug(id);
        video.poll().unwrap();
        assert_eq!(display.dpms(), DpmsState::Off);
    }

    #[test]
    fn blend_support_is_per_backend_policy() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(8, 8)], 0);
        control.set_blend_supported(id, false);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();
        display.activate(None).unwrap();
        assert!(matches!(
            display.blend(&[]),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn modes_are_torn_down_exactly_once() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(800, 600), mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();

        let kept = display.modes().remove(0);
        let kept_again = kept.clone();
        assert_eq!(control.mode_drops(), 0);

        control.unplug(id);
        video.poll().unwrap();
        drop(video);
        drop(display);

        // every descriptor except the one we still hold is gone
        assert_eq!(control.mode_drops(), 1);
        drop(kept);
        assert_eq!(control.mode_drops(), 1);
        drop(kept_again);
        assert_eq!(control.mode_drops(), 2);
    }

    #[test]
    fn callbacks_may_drop_their_own_handles() {
        let (control, _eloop, video) = fixture();
        let id = control.plug("VIRT-1", vec![mode(640, 480)], 0);
        video.poll().unwrap();
        let display = video.find_display(id).unwrap();

        // the observer owns a clone of the emitting display; dropping it
        // inside the callback must not tear the emitter down mid-dispatch
        let stash: Rc<RefCell<Option<Display>>> = Rc::new(RefCell::new(Some(display.clone())));
        let sink = Rc::clone(&stash);
        display.subscribe(move |_, _| {
            sink.borrow_mut().take();
        });

        display.activate(None).unwrap();
        assert!(display.is_online());
        assert!(stash.borrow().is_none());
    }

    proptest! {
        // online implies a live binding and a current mode, offline
        // implies none, under any interleaving of lifecycle calls
        #[test]
        fn lifecycle_invariants_hold_under_random_transitions(
            ops in proptest::collection::vec(0u8..5, 1..60)
        ) {
            let (control, eloop, video) = fixture();
            let id = control.plug("VIRT-1", vec![mode(64, 64)], 0);
            video.poll().unwrap();
            let display = video.find_display(id).unwrap();

            for op in ops {
                match op {
                    0 => { let _ = display.activate(None); }
                    1 => { let _ = display.deactivate(); }
                    2 => { let _ = display.swap(); }
                    3 => { let _ = display.set_dpms(DpmsState::Standby); }
                    _ => eloop.advance(Duration::from_millis(20)),
                }

                let flags = display.flags();
                if flags.contains(DisplayFlags::ONLINE) {
                    prop_assert!(flags.contains(DisplayFlags::AVAILABLE));
                    prop_assert!(display.current_mode().is_some());
                } else {
                    prop_assert!(display.current_mode().is_none());
                    prop_assert!(!flags.contains(DisplayFlags::VSYNC));
                }
            }
        }
    }
}
