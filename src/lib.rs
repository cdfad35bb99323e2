//! # scanout
//!
//! `scanout` is the display layer of a user-space terminal: it manages
//! display outputs (connectors and CRTCs), their mode lists, and the
//! buffer path that puts pixels on screen, behind one polymorphic
//! interface.
//!
//! One [`Video`] is opened per DRM device node. It probes a backend
//! once, at construction: the GPU path (GBM scanout buffers, kernel
//! page-flip vsync) when the node supports it, the dumb-buffer path
//! otherwise. An in-memory dummy backend drives the same interface
//! without hardware. [`Video::poll`] reconciles the connector set,
//! binding a [`Display`] per connected output; displays are activated
//! with a [`Mode`], rendered to, and paced by per-frame vblank events.
//!
//! Everything is single-threaded and cooperative. The crate never owns
//! an event loop; it registers its fd and timer sources with the host
//! loop through the [`eventloop::EventLoop`] seam, which is implemented
//! for `calloop::LoopHandle` out of the box.
//!
//! ```no_run
//! use std::rc::Rc;
//! use scanout::{Video, VideoConfig, VideoEvent};
//!
//! # fn main() -> scanout::Result<()> {
//! let mut event_loop: calloop::EventLoop<()> = calloop::EventLoop::try_new().unwrap();
//! let handle: Rc<dyn scanout::EventLoop> = Rc::new(event_loop.handle());
//!
//! let video = Video::open(VideoConfig::default(), "/dev/dri/card0", handle)?;
//! video.subscribe(|_, event| {
//!     if let VideoEvent::DisplayAdded(display) = event {
//!         if let Err(err) = display.activate(None) {
//!             eprintln!("cannot light up {}: {err}", display.name());
//!         }
//!     }
//! });
//! video.poll()?;
//! # Ok(())
//! # }
//! ```
//!
//! Handles ([`Video`], [`Display`], [`Mode`]) are cheap to clone and
//! reference-counted; a display handle that outlives its connector
//! stays valid and fails rendering calls with [`Error::DeviceGone`].

#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    missing_docs
)]

#[macro_use]
extern crate bitflags;

use std::io;

use thiserror::Error;

pub mod backend;
pub mod display;
pub mod eventloop;
pub mod mode;
pub mod types;
pub mod video;

mod hook;
mod render;
mod vblank;

pub use display::{Display, DisplayCallback, DisplayEvent, DisplayFlags};
pub use eventloop::{EventLoop, ManualLoop, SourceHandle};
pub use hook::Subscription;
pub use mode::Mode;
pub use types::{
    BackendKind, BlendRequest, BufferFormat, Color, ConnectorId, DpmsState, Rect, VideoBuffer,
};
pub use video::{
    BackendPreference, Video, VideoCallback, VideoConfig, VideoEvent, VideoFlags,
};

/// Errors reported by this crate.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// The backend does not implement the requested operation.
    #[error("{0} is not supported by this backend")]
    NotSupported(&'static str),

    /// The operation is not valid in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A finite hardware resource ran out.
    #[error("out of hardware resources: {0}")]
    ResourceExhausted(&'static str),

    /// The kernel or device rejected a request.
    #[error("hardware rejected the request")]
    HardwareRejected(#[source] io::Error),

    /// The backing device is gone; the handle is permanently detached.
    #[error("the backing device is gone")]
    DeviceGone,

    /// A source could not be registered with the host event loop.
    #[error("event loop error: {0}")]
    EventLoop(&'static str),
}

/// Result type used across this crate.
pub type Result<T> = ::core::result::Result<T, Error>;
