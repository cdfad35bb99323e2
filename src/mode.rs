//! Display mode handles.
//!
//! A [`Mode`] is a cheap-clone handle over an immutable backend descriptor.
//! Backends materialize their mode lists during connector enumeration and
//! never mutate a descriptor afterwards; the descriptor is freed exactly
//! once, when the last handle drops.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// The per-backend descriptor a [`Mode`] dispatches into.
pub(crate) trait ModeOps: fmt::Debug {
    /// Human-readable mode name, e.g. `1920x1080`.
    fn name(&self) -> Cow<'_, str>;
    /// Horizontal resolution in pixels.
    fn width(&self) -> u32;
    /// Vertical resolution in pixels.
    fn height(&self) -> u32;
    /// Vertical refresh rate in millihertz, if the backend knows it.
    fn refresh_mhz(&self) -> Option<u32>;
    /// Downcast seam for the owning backend.
    fn as_any(&self) -> &dyn Any;
}

/// A single display mode (resolution plus timing) supported by an output.
///
/// Cloning is cheap and shares the underlying descriptor.
#[derive(Debug, Clone)]
pub struct Mode {
    ops: Rc<dyn ModeOps>,
}

impl Mode {
    pub(crate) fn new(ops: Rc<dyn ModeOps>) -> Self {
        Self { ops }
    }

    /// Returns the human-readable name of this mode.
    pub fn name(&self) -> String {
        self.ops.name().into_owned()
    }

    /// Returns the horizontal resolution in pixels.
    pub fn width(&self) -> u32 {
        self.ops.width()
    }

    /// Returns the vertical resolution in pixels.
    pub fn height(&self) -> u32 {
        self.ops.height()
    }

    /// Returns the vertical refresh rate in millihertz, if known.
    pub fn refresh_mhz(&self) -> Option<u32> {
        self.ops.refresh_mhz()
    }

    /// Returns the frame interval implied by the refresh rate, or
    /// `fallback` when the rate is unknown or nonsensical.
    pub fn vblank_interval(&self, fallback: Duration) -> Duration {
        match self.ops.refresh_mhz() {
            Some(mhz) if mhz > 0 => Duration::from_secs_f64(1000.0 / mhz as f64),
            _ => fallback,
        }
    }

    /// Whether two handles refer to the same underlying mode.
    pub fn same_as(&self, other: &Mode) -> bool {
        Rc::ptr_eq(&self.ops, &other.ops)
    }

    /// Access to the backend descriptor, for the backend that created it.
    pub(crate) fn downcast<T: 'static>(&self) -> Option<&T> {
        self.ops.as_any().downcast_ref::<T>()
    }
}

impl PartialEq for Mode {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ops.name())
    }
}
