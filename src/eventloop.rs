//! The event-loop seam.
//!
//! The crate never owns an event loop. Everything time- or fd-driven goes
//! through [`EventLoop`], a narrow registration trait. A blanket
//! implementation covers [`calloop::LoopHandle`] for any app data type;
//! [`ManualLoop`] is a deterministic in-memory implementation used by the
//! test suite and by headless embedders.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::os::fd::OwnedFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode as TriggerMode, PostAction, RegistrationToken};

use crate::{Error, Result};

/// Cancelable handle to a registered event source.
///
/// Dropping the handle does not cancel the source; call
/// [`SourceHandle::cancel`].
pub trait SourceHandle {
    /// Deregisters the source. Idempotent.
    fn cancel(&mut self);
}

impl fmt::Debug for dyn SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SourceHandle")
    }
}

/// Timer callbacks may return the next deadline to re-arm themselves, or
/// `None` to stay single-shot.
pub type TimerCallback = dyn FnMut(Instant) -> Option<Instant>;

/// The contract this crate needs from its host event loop.
pub trait EventLoop {
    /// Invokes `cb` whenever `fd` becomes readable, until cancelled.
    fn register_fd(&self, fd: OwnedFd, cb: Box<dyn FnMut()>) -> Result<Box<dyn SourceHandle>>;

    /// Invokes `cb` once `deadline` passes. The callback decides whether
    /// to re-arm by returning the next deadline.
    fn register_timer(
        &self,
        deadline: Instant,
        cb: Box<TimerCallback>,
    ) -> Result<Box<dyn SourceHandle>>;

    /// The loop's notion of the current time.
    fn now(&self) -> Instant;
}

impl fmt::Debug for dyn EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventLoop")
    }
}

struct CalloopSource<D: 'static> {
    handle: LoopHandle<'static, D>,
    token: Option<RegistrationToken>,
}

impl<D> SourceHandle for CalloopSource<D> {
    fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            self.handle.remove(token);
        }
    }
}

impl<D: 'static> EventLoop for LoopHandle<'static, D> {
    fn register_fd(&self, fd: OwnedFd, mut cb: Box<dyn FnMut()>) -> Result<Box<dyn SourceHandle>> {
        let source = Generic::new(fd, Interest::READ, TriggerMode::Level);
        let token = self
            .insert_source(source, move |_, _, _| {
                cb();
                Ok(PostAction::Continue)
            })
            .map_err(|_| Error::EventLoop("failed to register fd source"))?;
        Ok(Box::new(CalloopSource {
            handle: self.clone(),
            token: Some(token),
        }))
    }

    fn register_timer(
        &self,
        deadline: Instant,
        mut cb: Box<TimerCallback>,
    ) -> Result<Box<dyn SourceHandle>> {
        let timer = Timer::from_deadline(deadline);
        let token = self
            .insert_source(timer, move |fired_at, _, _| match cb(fired_at) {
                Some(next) => TimeoutAction::ToInstant(next),
                None => TimeoutAction::Drop,
            })
            .map_err(|_| Error::EventLoop("failed to register timer source"))?;
        Ok(Box::new(CalloopSource {
            handle: self.clone(),
            token: Some(token),
        }))
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A deterministic, manually-advanced event loop.
///
/// Time only moves when [`ManualLoop::advance`] is called; fd callbacks
/// only run when [`ManualLoop::dispatch_fds`] is called. Registered fds
/// are held but never polled.
#[derive(Debug, Clone)]
pub struct ManualLoop {
    state: Rc<RefCell<ManualState>>,
}

struct ManualState {
    now: Instant,
    next_id: u64,
    timers: Vec<ManualTimer>,
    fds: Vec<ManualFd>,
    // ids cancelled while their entry was temporarily out of the lists
    cancelled: HashSet<u64>,
}

struct ManualTimer {
    id: u64,
    deadline: Instant,
    cb: Box<TimerCallback>,
}

struct ManualFd {
    id: u64,
    _fd: OwnedFd,
    cb: Box<dyn FnMut()>,
}

impl fmt::Debug for ManualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualState")
            .field("now", &self.now)
            .field("timers", &self.timers.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}

impl ManualLoop {
    /// Creates a loop whose clock starts at the real current time.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ManualState {
                now: Instant::now(),
                next_id: 0,
                timers: Vec::new(),
                fds: Vec::new(),
                cancelled: HashSet::new(),
            })),
        }
    }

    /// Moves the clock forward by `step`, firing due timers in deadline
    /// order. Re-armed timers fire again within the same call if their
    /// next deadline is still inside the window.
    pub fn advance(&self, step: Duration) {
        let target = self.state.borrow().now + step;
        loop {
            let due = {
                let mut st = self.state.borrow_mut();
                let idx = st
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| t.deadline)
                    .map(|(i, _)| i);
                match idx {
                    Some(i) => {
                        let timer = st.timers.remove(i);
                        if st.now < timer.deadline {
                            st.now = timer.deadline;
                        }
                        Some(timer)
                    }
                    None => None,
                }
            };
            let Some(mut timer) = due else { break };
            let next = (timer.cb)(timer.deadline);
            let mut st = self.state.borrow_mut();
            if st.cancelled.remove(&timer.id) {
                continue;
            }
            if let Some(deadline) = next {
                timer.deadline = deadline;
                st.timers.push(timer);
            }
        }
        let mut st = self.state.borrow_mut();
        if st.now < target {
            st.now = target;
        }
    }

    /// Runs every registered fd callback once, as if all fds turned
    /// readable.
    pub fn dispatch_fds(&self) {
        let mut taken = mem::take(&mut self.state.borrow_mut().fds);
        for fd in &mut taken {
            (fd.cb)();
        }
        let mut st = self.state.borrow_mut();
        taken.retain(|fd| !st.cancelled.remove(&fd.id));
        let added = mem::take(&mut st.fds);
        taken.extend(added);
        st.fds = taken;
    }

    /// Number of armed timers.
    pub fn pending_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    fn register(&self, entry: ManualEntry) -> Box<dyn SourceHandle> {
        let mut st = self.state.borrow_mut();
        let id = st.next_id;
        st.next_id += 1;
        match entry {
            ManualEntry::Timer(deadline, cb) => st.timers.push(ManualTimer { id, deadline, cb }),
            ManualEntry::Fd(fd, cb) => st.fds.push(ManualFd { id, _fd: fd, cb }),
        }
        Box::new(ManualSource {
            state: Rc::downgrade(&self.state),
            id,
        })
    }
}

impl Default for ManualLoop {
    fn default() -> Self {
        Self::new()
    }
}

enum ManualEntry {
    Timer(Instant, Box<TimerCallback>),
    Fd(OwnedFd, Box<dyn FnMut()>),
}

struct ManualSource {
    state: Weak<RefCell<ManualState>>,
    id: u64,
}

impl SourceHandle for ManualSource {
    fn cancel(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut st = state.borrow_mut();
        let before = st.timers.len() + st.fds.len();
        let id = self.id;
        st.timers.retain(|t| t.id != id);
        st.fds.retain(|f| f.id != id);
        if st.timers.len() + st.fds.len() == before {
            // entry is mid-dispatch; flag it so it is not reinstated
            st.cancelled.insert(id);
        }
    }
}

impl EventLoop for ManualLoop {
    fn register_fd(&self, fd: OwnedFd, cb: Box<dyn FnMut()>) -> Result<Box<dyn SourceHandle>> {
        Ok(self.register(ManualEntry::Fd(fd, cb)))
    }

    fn register_timer(
        &self,
        deadline: Instant,
        cb: Box<TimerCallback>,
    ) -> Result<Box<dyn SourceHandle>> {
        Ok(self.register(ManualEntry::Timer(deadline, cb)))
    }

    fn now(&self) -> Instant {
        self.state.borrow().now
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn manual_timer_fires_once_at_deadline() {
        let eloop = ManualLoop::new();
        let fired = Rc::new(Cell::new(0u32));
        let inner = Rc::clone(&fired);
        eloop
            .register_timer(
                eloop.now() + Duration::from_millis(10),
                Box::new(move |_| {
                    inner.set(inner.get() + 1);
                    None
                }),
            )
            .unwrap();

        eloop.advance(Duration::from_millis(9));
        assert_eq!(fired.get(), 0);
        eloop.advance(Duration::from_millis(1));
        assert_eq!(fired.get(), 1);
        eloop.advance(Duration::from_secs(1));
        assert_eq!(fired.get(), 1);
        assert_eq!(eloop.pending_timers(), 0);
    }

    #[test]
    fn manual_timer_rearms_within_window() {
        let eloop = ManualLoop::new();
        let fired = Rc::new(Cell::new(0u32));
        let inner = Rc::clone(&fired);
        eloop
            .register_timer(
                eloop.now() + Duration::from_millis(10),
                Box::new(move |fired_at| {
                    inner.set(inner.get() + 1);
                    Some(fired_at + Duration::from_millis(10))
                }),
            )
            .unwrap();

        eloop.advance(Duration::from_millis(35));
        assert_eq!(fired.get(), 3);
        assert_eq!(eloop.pending_timers(), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let eloop = ManualLoop::new();
        let fired = Rc::new(Cell::new(0u32));
        let inner = Rc::clone(&fired);
        let mut handle = eloop
            .register_timer(
                eloop.now() + Duration::from_millis(5),
                Box::new(move |_| {
                    inner.set(inner.get() + 1);
                    None
                }),
            )
            .unwrap();

        handle.cancel();
        eloop.advance(Duration::from_secs(1));
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn calloop_handle_drives_timer_and_cancel() {
        let mut event_loop: calloop::EventLoop<'static, ()> =
            calloop::EventLoop::try_new().unwrap();
        let handle: Rc<dyn EventLoop> = Rc::new(event_loop.handle());

        let fired = Rc::new(Cell::new(0u32));
        let inner = Rc::clone(&fired);
        let _keep = handle
            .register_timer(
                Instant::now(),
                Box::new(move |_| {
                    inner.set(inner.get() + 1);
                    None
                }),
            )
            .unwrap();

        let inner = Rc::clone(&fired);
        let mut cancelled = handle
            .register_timer(
                Instant::now(),
                Box::new(move |_| {
                    inner.set(inner.get() + 100);
                    None
                }),
            )
            .unwrap();
        cancelled.cancel();

        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut ())
            .unwrap();
        assert_eq!(fired.get(), 1);
    }
}
