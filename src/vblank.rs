//! Per-display vblank scheduling state.
//!
//! Backends without a hardware vsync signal pace frames with a
//! single-shot timer. Arming replaces any pending deadline; the timer is
//! disarmed on deactivate and on teardown.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::eventloop::{EventLoop, SourceHandle, TimerCallback};
use crate::Result;

/// Frame interval used when a mode does not report its refresh rate.
pub(crate) const DEFAULT_VBLANK_INTERVAL: Duration = Duration::from_millis(16);

pub(crate) struct VblankState {
    interval: Duration,
    handle: Option<Box<dyn SourceHandle>>,
}

impl VblankState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: None,
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Arms a single shot one interval from now, replacing any pending
    /// deadline.
    pub fn arm(&mut self, eloop: &Rc<dyn EventLoop>, cb: Box<TimerCallback>) -> Result<()> {
        self.disarm();
        let deadline = eloop.now() + self.interval;
        self.handle = Some(eloop.register_timer(deadline, cb)?);
        Ok(())
    }

    pub fn disarm(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.cancel();
        }
    }

    /// Forget the source handle without cancelling, for timers that have
    /// already fired and dropped themselves.
    pub fn clear_fired(&mut self) {
        self.handle = None;
    }
}

impl fmt::Debug for VblankState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VblankState")
            .field("interval", &self.interval)
            .field("armed", &self.is_armed())
            .finish()
    }
}
