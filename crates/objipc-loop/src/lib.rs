//! A single-threaded readiness event loop.
//!
//! One thread owns an [`EventLoop`] and cycles on
//! [`dispatch`](EventLoop::dispatch); callbacks must not block. Four source
//! kinds are supported: file descriptors (epoll readiness), timers (a
//! min-heap of absolute deadlines behind one timerfd), idle sources (run
//! once before the loop blocks), and signals (signalfd).
//!
//! Removal is deferred: a removed source is unhooked from epoll immediately
//! (no further events arrive) but its storage lives until the current
//! dispatch pass completes, so a callback may remove its own source or a
//! sibling without use-after-free.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{
    ClockId as TimerClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags,
};
use nix::time::{clock_gettime, ClockId};
use tracing::warn;

mod error;
mod heap;
mod source;

pub use error::{LoopError, Result};
pub use source::{Readiness, Source};

use heap::ClockHeap;
use source::{CallbackKind, Kind, Registered, SourceState, TimerSlot};

/// epoll token reserved for the loop's timerfd.
const TIMER_TOKEN: u64 = 0;

const MAX_EPOLL_EVENTS: usize = 32;

/// A readiness-multiplexing event loop over fd, timer, idle, and signal
/// sources.
pub struct EventLoop {
    epoll: Epoll,
    timer_fd: TimerFd,
    sources: RefCell<HashMap<u64, Rc<SourceState>>>,
    idle: RefCell<VecDeque<Rc<SourceState>>>,
    check: RefCell<Vec<Rc<SourceState>>>,
    destroy: RefCell<Vec<Rc<SourceState>>>,
    timers: RefCell<ClockHeap>,
    next_token: Cell<u64>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let timer_fd = TimerFd::new(
            TimerClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )?;
        epoll.add(
            timer_fd.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, TIMER_TOKEN),
        )?;
        Ok(Self {
            epoll,
            timer_fd,
            sources: RefCell::new(HashMap::new()),
            idle: RefCell::new(VecDeque::new()),
            check: RefCell::new(Vec::new()),
            destroy: RefCell::new(Vec::new()),
            timers: RefCell::new(ClockHeap::new()),
            next_token: Cell::new(TIMER_TOKEN + 1),
        })
    }

    fn take_token(&self) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        token
    }

    /// Register a file descriptor source. The descriptor is duplicated
    /// internally; the callback receives the caller's original descriptor
    /// and the readiness that fired. A non-zero return value re-triggers the
    /// post-dispatch check for sources flagged with
    /// [`source_check`](Self::source_check).
    pub fn add_fd(
        &self,
        fd: BorrowedFd<'_>,
        mask: Readiness,
        callback: impl FnMut(&EventLoop, RawFd, Readiness) -> i32 + 'static,
    ) -> Result<Source> {
        let raw = fd.as_raw_fd();
        let duped = nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(0))?;
        // SAFETY: F_DUPFD_CLOEXEC just created this descriptor for us.
        let duped = unsafe { OwnedFd::from_raw_fd(duped) };

        let token = self.take_token();
        self.epoll
            .add(duped.as_fd(), EpollEvent::new(epoll_flags(mask), token))?;

        let state = Rc::new(SourceState {
            token,
            kind: Kind::Fd,
            removed: Cell::new(false),
            raw,
            registered: Registered::Plain(duped),
            callback: RefCell::new(CallbackKind::Fd(Box::new(callback))),
            timer: TimerSlot::new(),
        });
        self.sources.borrow_mut().insert(token, state.clone());
        Ok(Source::new(state))
    }

    /// Change the readiness mask of an fd source.
    pub fn update_fd_mask(&self, source: &Source, mask: Readiness) -> Result<()> {
        let state = &source.state;
        if state.kind != Kind::Fd {
            return Err(LoopError::WrongKind { expected: "fd" });
        }
        // SAFETY: the registered fd outlives this call; see Registered.
        if let Some(fd) = unsafe { state.registered.borrow_fd() } {
            let mut event = EpollEvent::new(epoll_flags(mask), state.token);
            self.epoll.modify(fd, &mut event)?;
        }
        Ok(())
    }

    /// Register a timer source. It starts disarmed; schedule it with
    /// [`update_timer`](Self::update_timer). Timers are one-shot: the
    /// callback re-arms explicitly if it wants to repeat.
    pub fn add_timer(
        &self,
        callback: impl FnMut(&EventLoop) -> i32 + 'static,
    ) -> Result<Source> {
        let state = Rc::new(SourceState {
            token: self.take_token(),
            kind: Kind::Timer,
            removed: Cell::new(false),
            raw: -1,
            registered: Registered::None,
            callback: RefCell::new(CallbackKind::Timer(Box::new(callback))),
            timer: TimerSlot::new(),
        });
        self.timers.borrow_mut().reserve();
        self.sources
            .borrow_mut()
            .insert(state.token, state.clone());
        Ok(Source::new(state))
    }

    /// Arm (or re-arm) a timer source `delay_ms` from now; `0` disarms it.
    pub fn update_timer(&self, source: &Source, delay_ms: u64) -> Result<()> {
        let state = &source.state;
        if state.kind != Kind::Timer {
            return Err(LoopError::WrongKind { expected: "timer" });
        }

        let mut timers = self.timers.borrow_mut();
        if delay_ms > 0 {
            let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
            let deadline = now + TimeSpec::from_duration(Duration::from_millis(delay_ms));

            if state.timer.is_armed() {
                timers.reschedule(state, deadline);
            } else {
                timers.arm(state, deadline);
            }
            // Only a new heap minimum moves the OS timer.
            if state.timer.heap_index.get() == 0 {
                self.timer_fd
                    .set(Expiration::OneShot(deadline), TimerSetTimeFlags::TFD_TIMER_ABSTIME)?;
            }
        } else {
            if !state.timer.is_armed() {
                return Ok(());
            }
            timers.disarm(state);
            if timers.is_empty() {
                self.timer_fd.unset()?;
            }
        }
        Ok(())
    }

    /// Register an idle source: its callback runs once, before the loop next
    /// blocks, then the source is removed.
    pub fn add_idle(&self, callback: impl FnOnce(&EventLoop) + 'static) -> Source {
        let state = Rc::new(SourceState {
            token: self.take_token(),
            kind: Kind::Idle,
            removed: Cell::new(false),
            raw: -1,
            registered: Registered::None,
            callback: RefCell::new(CallbackKind::Idle(Some(Box::new(callback)))),
            timer: TimerSlot::new(),
        });
        self.idle.borrow_mut().push_back(state.clone());
        Source::new(state)
    }

    /// Register a signal source backed by a signalfd; the signal is blocked
    /// for normal delivery and reported through the loop instead.
    pub fn add_signal(
        &self,
        signal: Signal,
        callback: impl FnMut(&EventLoop, Signal) -> i32 + 'static,
    ) -> Result<Source> {
        let mut mask = SigSet::empty();
        mask.add(signal);
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;
        nix::sys::signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;

        let token = self.take_token();
        let state = Rc::new(SourceState {
            token,
            kind: Kind::Signal,
            removed: Cell::new(false),
            raw: -1,
            registered: Registered::Signal(RefCell::new(sfd)),
            callback: RefCell::new(CallbackKind::Signal(signal, Box::new(callback))),
            timer: TimerSlot::new(),
        });
        // SAFETY: the signalfd lives in `state.registered` past this call.
        if let Some(fd) = unsafe { state.registered.borrow_fd() } {
            self.epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))?;
        }
        self.sources.borrow_mut().insert(token, state.clone());
        Ok(Source::new(state))
    }

    /// Unhook a source. No further events are delivered; the storage is
    /// released after the current dispatch pass, so calling this from inside
    /// the source's own callback is fine.
    pub fn remove(&self, source: &Source) -> Result<()> {
        let state = &source.state;
        if state.removed.replace(true) {
            return Ok(());
        }

        // SAFETY: the registered fd is owned by the state being removed.
        if let Some(fd) = unsafe { state.registered.borrow_fd() } {
            self.epoll.delete(fd)?;
        }
        if state.kind == Kind::Timer {
            let mut timers = self.timers.borrow_mut();
            if state.timer.is_armed() {
                timers.disarm(state);
                if timers.is_empty() {
                    self.timer_fd.unset()?;
                }
            }
            timers.unreserve();
        }

        self.sources.borrow_mut().remove(&state.token);
        self.destroy.borrow_mut().push(state.clone());
        Ok(())
    }

    /// Flag an fd source for the post-dispatch check pass: its callback is
    /// re-invoked with an empty readiness mask after each dispatch until it
    /// returns zero.
    pub fn source_check(&self, source: &Source) -> Result<()> {
        if source.state.kind != Kind::Fd {
            return Err(LoopError::WrongKind { expected: "fd" });
        }
        self.check.borrow_mut().push(source.state.clone());
        Ok(())
    }

    /// Run all pending idle callbacks.
    pub fn dispatch_idle(&self) {
        loop {
            // Scope the list borrow so a callback may add new idle sources.
            let state = {
                let mut idle = self.idle.borrow_mut();
                idle.pop_front()
            };
            let Some(state) = state else { break };
            if state.removed.get() {
                continue;
            }
            let callback = match &mut *state.callback.borrow_mut() {
                CallbackKind::Idle(cb) => cb.take(),
                _ => None,
            };
            state.removed.set(true);
            self.destroy.borrow_mut().push(state.clone());
            if let Some(cb) = callback {
                cb(self);
            }
        }
    }

    /// One pass of the loop: drain idles, block up to `timeout_ms`
    /// (`-1` = indefinitely, `0` = poll) for readiness, run expired timer
    /// callbacks in deadline order before any fd callback, then fd/signal
    /// callbacks, deferred removals, idles again, and finally re-check
    /// flagged sources until quiescent.
    pub fn dispatch(&self, timeout_ms: i32) -> Result<()> {
        self.dispatch_idle();

        let timeout = if timeout_ms < 0 {
            EpollTimeout::NONE
        } else {
            EpollTimeout::try_from(timeout_ms as u32)
                .map_err(|_| LoopError::InvalidTimeout(timeout_ms))?
        };

        let mut events = vec![EpollEvent::empty(); MAX_EPOLL_EVENTS];
        let count = loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(n) => break n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let ready: Vec<(u64, EpollFlags)> = events[..count]
            .iter()
            .map(|e| (e.data(), e.events()))
            .collect();

        // Timer callbacks run first so their side effects (say, cancelling
        // another ready source) land before that source's callback.
        if ready.iter().any(|(token, _)| *token == TIMER_TOKEN) {
            self.dispatch_timers()?;
        }

        for (token, flags) in ready {
            if token == TIMER_TOKEN {
                continue;
            }
            let state = self.sources.borrow().get(&token).cloned();
            let Some(state) = state else { continue };
            if state.removed.get() {
                continue;
            }
            self.invoke(&state, readiness(flags));
        }

        self.process_destroy_list();
        self.dispatch_idle();
        while self.post_dispatch_check() {}
        self.process_destroy_list();

        Ok(())
    }

    /// Pop every expired timer, re-arm the OS timer to the next deadline (or
    /// disarm it), and invoke the expired callbacks in deadline order.
    fn dispatch_timers(&self) -> Result<()> {
        let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;

        let expired = {
            let mut timers = self.timers.borrow_mut();
            let expired = timers.pop_expired(now);
            // Setting or clearing the timerfd also clears its readiness.
            match timers.peek() {
                Some(next) => self.timer_fd.set(
                    Expiration::OneShot(next.timer.deadline.get()),
                    TimerSetTimeFlags::TFD_TIMER_ABSTIME,
                )?,
                None => self.timer_fd.unset()?,
            }
            expired
        };

        for state in expired {
            if state.removed.get() {
                continue;
            }
            let mut callback = state.callback.borrow_mut();
            if let CallbackKind::Timer(cb) = &mut *callback {
                cb(self);
            }
        }
        Ok(())
    }

    fn invoke(&self, state: &Rc<SourceState>, mask: Readiness) -> i32 {
        match state.kind {
            Kind::Signal => {
                // Drain the pending siginfo so the signalfd stops polling
                // readable before the callback runs.
                if let Registered::Signal(sfd) = &state.registered {
                    if let Err(e) = sfd.borrow_mut().read_signal() {
                        warn!("signalfd read error: {e}");
                    }
                }
                let mut callback = state.callback.borrow_mut();
                match &mut *callback {
                    CallbackKind::Signal(signal, cb) => cb(self, *signal),
                    _ => 0,
                }
            }
            _ => {
                let mut callback = state.callback.borrow_mut();
                match &mut *callback {
                    CallbackKind::Fd(cb) => cb(self, state.raw, mask),
                    _ => 0,
                }
            }
        }
    }

    /// Re-invoke flagged sources with an empty readiness mask; returns true
    /// if any of them reported more work.
    fn post_dispatch_check(&self) -> bool {
        let snapshot: Vec<Rc<SourceState>> = self.check.borrow().clone();
        let mut needs_recheck = false;
        for state in snapshot {
            if state.removed.get() {
                continue;
            }
            needs_recheck |= self.invoke(&state, Readiness::EMPTY) != 0;
        }
        needs_recheck
    }

    fn process_destroy_list(&self) {
        self.destroy.borrow_mut().clear();
        self.check.borrow_mut().retain(|s| !s.removed.get());
        self.idle.borrow_mut().retain(|s| !s.removed.get());
    }
}

impl AsRawFd for EventLoop {
    /// The loop itself is pollable: readiness on this descriptor means a
    /// `dispatch(0)` would make progress.
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}

fn epoll_flags(mask: Readiness) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if mask.contains(Readiness::READABLE) {
        flags |= EpollFlags::EPOLLIN;
    }
    if mask.contains(Readiness::WRITABLE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

fn readiness(flags: EpollFlags) -> Readiness {
    let mut mask = Readiness::EMPTY;
    if flags.contains(EpollFlags::EPOLLIN) {
        mask = mask | Readiness::READABLE;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        mask = mask | Readiness::WRITABLE;
    }
    if flags.contains(EpollFlags::EPOLLHUP) {
        mask = mask | Readiness::HANGUP;
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        mask = mask | Readiness::ERROR;
    }
    mask
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;
    use std::rc::Rc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn idle_sources_run_once_before_blocking() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        event_loop.add_idle(move |_| h.set(h.get() + 1));

        event_loop.dispatch(0).unwrap();
        assert_eq!(hits.get(), 1);

        event_loop.dispatch(0).unwrap();
        assert_eq!(hits.get(), 1, "idle sources fire exactly once");
    }

    #[test]
    fn fd_source_fires_on_readable() {
        let event_loop = EventLoop::new().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        event_loop
            .add_fd(read_end.as_fd(), Readiness::READABLE, move |_, _, mask| {
                assert!(mask.contains(Readiness::READABLE));
                f.set(true);
                0
            })
            .unwrap();

        nix::unistd::write(&write_end, b"x").unwrap();
        event_loop.dispatch(100).unwrap();
        assert!(fired.get());
    }

    #[test]
    fn timer_fires_after_deadline() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let timer = event_loop.add_timer(move |_| {
            f.set(true);
            0
        })
        .unwrap();
        event_loop.update_timer(&timer, 10).unwrap();

        let start = Instant::now();
        while !fired.get() {
            event_loop.dispatch(1000).unwrap();
            assert!(start.elapsed().as_secs() < 5, "timer never fired");
        }
        assert!(start.elapsed().as_millis() >= 10);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let event_loop = EventLoop::new().unwrap();
        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        let mut sources = Vec::new();
        for (label, delay) in [(3u32, 30u64), (1, 5), (2, 15)] {
            let o = order.clone();
            let timer = event_loop
                .add_timer(move |_| {
                    o.borrow_mut().push(label);
                    0
                })
                .unwrap();
            event_loop.update_timer(&timer, delay).unwrap();
            sources.push(timer);
        }

        let start = Instant::now();
        while order.borrow().len() < 3 {
            event_loop.dispatch(1000).unwrap();
            assert!(start.elapsed().as_secs() < 5, "timers never all fired");
        }
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn timer_callback_cancels_ready_fd_source() {
        let event_loop = EventLoop::new().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        let fd_fired = Rc::new(Cell::new(false));
        let f = fd_fired.clone();
        let fd_source = event_loop
            .add_fd(read_end.as_fd(), Readiness::READABLE, move |_, _, _| {
                f.set(true);
                0
            })
            .unwrap();

        let victim = fd_source.clone();
        let timer = event_loop
            .add_timer(move |event_loop| {
                event_loop.remove(&victim).unwrap();
                0
            })
            .unwrap();
        event_loop.update_timer(&timer, 1).unwrap();

        // Make both the timer and the fd ready in the same wait.
        nix::unistd::write(&write_end, b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        event_loop.dispatch(100).unwrap();
        assert!(
            !fd_fired.get(),
            "timer dispatch precedes fd dispatch, so the removal wins"
        );
    }

    #[test]
    fn source_removes_itself_from_callback() {
        let event_loop = EventLoop::new().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let holder: Rc<RefCell<Option<Source>>> = Rc::new(RefCell::new(None));
        let held = holder.clone();
        let source = event_loop
            .add_fd(read_end.as_fd(), Readiness::READABLE, move |event_loop, _, _| {
                h.set(h.get() + 1);
                if let Some(me) = held.borrow().as_ref() {
                    event_loop.remove(me).unwrap();
                }
                0
            })
            .unwrap();
        *holder.borrow_mut() = Some(source);

        nix::unistd::write(&write_end, b"xx").unwrap();
        event_loop.dispatch(100).unwrap();
        event_loop.dispatch(0).unwrap();
        assert_eq!(hits.get(), 1, "no events after self-removal");
    }

    #[test]
    fn rearming_timer_from_callback_repeats() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0u32));

        let holder: Rc<RefCell<Option<Source>>> = Rc::new(RefCell::new(None));
        let h = hits.clone();
        let held = holder.clone();
        let timer = event_loop
            .add_timer(move |event_loop| {
                h.set(h.get() + 1);
                if h.get() < 3 {
                    if let Some(me) = held.borrow().as_ref() {
                        event_loop.update_timer(me, 1).unwrap();
                    }
                }
                0
            })
            .unwrap();
        *holder.borrow_mut() = Some(timer.clone());
        event_loop.update_timer(&timer, 1).unwrap();

        let start = Instant::now();
        while hits.get() < 3 {
            event_loop.dispatch(1000).unwrap();
            assert!(start.elapsed().as_secs() < 5, "timer did not repeat");
        }
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn check_source_reinvoked_until_quiescent() {
        let event_loop = EventLoop::new().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        let budget = Rc::new(Cell::new(3i32));
        let calls = Rc::new(Cell::new(0));
        let b = budget.clone();
        let c = calls.clone();
        let source = event_loop
            .add_fd(read_end.as_fd(), Readiness::READABLE, move |_, _, _| {
                c.set(c.get() + 1);
                b.set(b.get() - 1);
                b.get().max(0)
            })
            .unwrap();
        event_loop.source_check(&source).unwrap();

        nix::unistd::write(&write_end, b"x").unwrap();
        event_loop.dispatch(100).unwrap();

        // One readiness invocation plus check passes until the budget hit 0.
        assert!(calls.get() >= 3, "check passes should re-invoke the source");
    }

    #[test]
    fn signal_source_delivers_signal() {
        let event_loop = EventLoop::new().unwrap();
        let got: Rc<Cell<Option<Signal>>> = Rc::new(Cell::new(None));

        let g = got.clone();
        let _source = event_loop
            .add_signal(Signal::SIGUSR2, move |_, sig| {
                g.set(Some(sig));
                0
            })
            .unwrap();

        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
        let start = Instant::now();
        while got.get().is_none() {
            event_loop.dispatch(1000).unwrap();
            assert!(start.elapsed().as_secs() < 5, "signal never delivered");
        }
        assert_eq!(got.get(), Some(Signal::SIGUSR2));
    }

    #[test]
    fn update_timer_rejects_fd_source() {
        let event_loop = EventLoop::new().unwrap();
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let source = event_loop
            .add_fd(read_end.as_fd(), Readiness::READABLE, |_, _, _| 0)
            .unwrap();
        assert!(matches!(
            event_loop.update_timer(&source, 5),
            Err(LoopError::WrongKind { expected: "timer" })
        ));
    }

    #[test]
    fn dispatch_zero_timeout_polls() {
        let event_loop = EventLoop::new().unwrap();
        let start = Instant::now();
        event_loop.dispatch(0).unwrap();
        assert!(start.elapsed().as_millis() < 100);
    }
}
