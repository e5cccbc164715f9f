use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;

use nix::sys::signal::Signal;
use nix::sys::signalfd::SignalFd;
use nix::sys::time::TimeSpec;

use crate::EventLoop;

/// Readiness mask reported to fd-source callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness(u32);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(1);
    pub const WRITABLE: Readiness = Readiness(1 << 1);
    pub const HANGUP: Readiness = Readiness(1 << 2);
    pub const ERROR: Readiness = Readiness(1 << 3);

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;
    fn bitor(self, rhs: Readiness) -> Readiness {
        self.union(rhs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    Fd,
    Timer,
    Idle,
    Signal,
}

impl Kind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Kind::Fd => "fd",
            Kind::Timer => "timer",
            Kind::Idle => "idle",
            Kind::Signal => "signal",
        }
    }
}

/// The descriptor a source registered with epoll, if any.
pub(crate) enum Registered {
    None,
    Plain(OwnedFd),
    Signal(RefCell<SignalFd>),
}

impl Registered {
    pub(crate) fn raw(&self) -> Option<RawFd> {
        match self {
            Registered::None => None,
            Registered::Plain(fd) => Some(fd.as_raw_fd()),
            Registered::Signal(sfd) => Some(sfd.borrow().as_raw_fd()),
        }
    }

    /// Borrow the registered descriptor for an epoll ctl call.
    ///
    /// # Safety
    /// The caller must not hold the returned borrow past the lifetime of
    /// this `Registered` (the enum owns the descriptor).
    pub(crate) unsafe fn borrow_fd(&self) -> Option<BorrowedFd<'_>> {
        self.raw().map(|raw| BorrowedFd::borrow_raw(raw))
    }
}

pub(crate) enum CallbackKind {
    Fd(Box<dyn FnMut(&EventLoop, RawFd, Readiness) -> i32>),
    Timer(Box<dyn FnMut(&EventLoop) -> i32>),
    Idle(Option<Box<dyn FnOnce(&EventLoop)>>),
    Signal(Signal, Box<dyn FnMut(&EventLoop, Signal) -> i32>),
}

/// Heap bookkeeping for timer sources: the armed deadline and this source's
/// index in the clock heap (`-1` while disarmed).
pub(crate) struct TimerSlot {
    pub(crate) deadline: Cell<TimeSpec>,
    pub(crate) heap_index: Cell<i32>,
}

impl TimerSlot {
    pub(crate) fn new() -> Self {
        Self {
            deadline: Cell::new(TimeSpec::new(0, 0)),
            heap_index: Cell::new(-1),
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.heap_index.get() >= 0
    }
}

pub(crate) struct SourceState {
    pub(crate) token: u64,
    pub(crate) kind: Kind,
    pub(crate) removed: Cell<bool>,
    /// For fd sources: the caller's descriptor, passed back to the callback.
    pub(crate) raw: RawFd,
    pub(crate) registered: Registered,
    /// Borrowed only for the duration of one callback invocation, so a
    /// callback may freely remove its own source.
    pub(crate) callback: RefCell<CallbackKind>,
    pub(crate) timer: TimerSlot,
}

/// Handle to a registered event source. Pass it back to the
/// [`EventLoop`](crate::EventLoop) to update or remove the source.
#[derive(Clone)]
pub struct Source {
    pub(crate) state: Rc<SourceState>,
}

impl Source {
    pub(crate) fn new(state: Rc<SourceState>) -> Self {
        Self { state }
    }

    /// Whether the source has been removed from its loop.
    pub fn is_removed(&self) -> bool {
        self.state.removed.get()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("kind", &self.state.kind.name())
            .field("token", &self.state.token)
            .field("removed", &self.state.removed.get())
            .finish()
    }
}
