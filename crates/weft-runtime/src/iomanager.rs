//! Epoll-backed IO reactor
//!
//! An [`IoManager`] is a scheduler whose idle step blocks in `epoll_wait`
//! instead of on a semaphore, bounded by the earliest timer deadline. Each
//! fd has one context holding its armed statuses plus one waiter slot per
//! direction; firing a status hands the waiter back to its scheduler.
//!
//! Registration is edge-triggered. The epoll user data carries the fd
//! itself, which indexes the context table, so no pointers cross the epoll
//! boundary.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use weft_core::{kdebug, kerror, kwarn};

use crate::config;
use crate::scheduler::{
    join_reactor, start_reactor, stop_reactor, Reactor, SchedCore, Schedule, Task, TaskUnit,
};
use crate::timer::{Timer, TimerCb, TimerQueue};
use crate::tls;

const MAX_EVENTS: usize = 256;
const MAX_EPOLL_TIMEOUT: Duration = Duration::from_millis(5000);

/// One direction of IO readiness on an fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
}

impl EventKind {
    #[inline]
    fn set(self) -> EventSet {
        match self {
            EventKind::Read => EventSet::READ,
            EventKind::Write => EventSet::WRITE,
        }
    }
}

/// A set of armed directions. Bit values match EPOLLIN/EPOLLOUT so the set
/// maps straight onto an epoll mask.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventSet(u32);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(libc::EPOLLIN as u32);
    pub const WRITE: EventSet = EventSet(libc::EPOLLOUT as u32);

    #[inline]
    fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.set().0 != 0
    }

    #[inline]
    fn insert(&mut self, kind: EventKind) {
        self.0 |= kind.set().0;
    }

    #[inline]
    fn remove(&mut self, kind: EventKind) {
        self.0 &= !kind.set().0;
    }

    #[inline]
    fn with(self, kind: EventKind) -> EventSet {
        EventSet(self.0 | kind.set().0)
    }

    #[inline]
    fn without(self, kind: EventKind) -> EventSet {
        EventSet(self.0 & !kind.set().0)
    }

    #[inline]
    fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    fn bits(self) -> u32 {
        self.0
    }
}

/// Who gets woken when a status fires.
///
/// The scheduler is held weakly: the waiter usually points at the manager
/// that owns this very slot, and a strong reference would pin it forever.
struct Waiter {
    sched: Option<Weak<dyn Schedule>>,
    tid: libc::pid_t,
    unit: Option<TaskUnit>,
}

impl Waiter {
    const fn empty() -> Self {
        Self {
            sched: None,
            tid: 0,
            unit: None,
        }
    }

    fn clear(&mut self) {
        self.sched = None;
        self.tid = 0;
        self.unit = None;
    }
}

struct FdInner {
    statuses: EventSet,
    read: Waiter,
    write: Waiter,
}

impl FdInner {
    fn waiter_mut(&mut self, kind: EventKind) -> &mut Waiter {
        match kind {
            EventKind::Read => &mut self.read,
            EventKind::Write => &mut self.write,
        }
    }
}

/// Per-fd registration state, shared between arming paths and the idle
/// sweep under one mutex.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdInner {
                statuses: EventSet::NONE,
                read: Waiter::empty(),
                write: Waiter::empty(),
            }),
        }
    }
}

/// The epoll scheduler.
pub struct IoManager {
    core: SchedCore,
    epoll: OwnedFd,
    tickle_rd: OwnedFd,
    tickle_wr: OwnedFd,
    pending: AtomicUsize,
    timers: TimerQueue,
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl IoManager {
    /// Build an IO manager; epoll or pipe setup failure is fatal.
    pub fn new(name: &str, use_caller: bool, threads: usize) -> Arc<Self> {
        assert!(threads >= 1, "io manager needs at least one thread");
        let workers = if use_caller { threads - 1 } else { threads };

        let rc = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(rc >= 0, "epoll_create1 failed: {}", Errno::last());
        let epoll = unsafe { OwnedFd::from_raw_fd(rc) };

        let (tickle_rd, tickle_wr) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .expect("tickle pipe creation failed");

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_rd.as_raw_fd() as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                tickle_rd.as_raw_fd(),
                &mut ev,
            )
        };
        assert!(rc == 0, "registering tickle pipe failed: {}", Errno::last());

        let slots = config::global().fd_slots;
        let contexts = (0..slots)
            .map(|i| Arc::new(FdContext::new(i as RawFd)))
            .collect();

        Arc::new(Self {
            core: SchedCore::new(name, use_caller, workers),
            epoll,
            tickle_rd,
            tickle_wr,
            pending: AtomicUsize::new(0),
            timers: TimerQueue::new(),
            contexts: RwLock::new(contexts),
        })
    }

    /// The IO manager driving the current worker thread.
    pub fn current() -> Option<Arc<IoManager>> {
        tls::current_io_manager()
    }

    pub fn start(self: &Arc<Self>) {
        start_reactor(self);
    }

    pub fn stop(self: &Arc<Self>) {
        stop_reactor(self);
    }

    /// Wait for background workers to exit; call after `stop`.
    pub fn join(self: &Arc<Self>) {
        join_reactor(self);
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn is_stopping(&self) -> bool {
        self.core.is_stopping()
    }

    /// Armed statuses that have not fired yet.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    // A byte written while no worker is parked sits in the pipe and makes
    // the next epoll_wait return immediately, so this never loses a wakeup.
    fn wake(&self) {
        let buf = [b'T'];
        let rc = unsafe {
            libc::write(
                self.tickle_wr.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                1,
            )
        };
        // A full pipe already has wakeups pending.
        if rc < 0 && Errno::last() != Errno::EAGAIN {
            kwarn!("{} tickle write failed: {}", self.name(), Errno::last());
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(
                    self.tickle_rd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }

    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let v = self.contexts.read().unwrap();
            if idx < v.len() {
                return v[idx].clone();
            }
        }
        let mut v = self.contexts.write().unwrap();
        if idx >= v.len() {
            let target = (idx + 1).max(v.len() + v.len() / 2);
            let mut next = v.len() as RawFd;
            v.resize_with(target, || {
                let ctx = Arc::new(FdContext::new(next));
                next += 1;
                ctx
            });
        }
        v[idx].clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let v = self.contexts.read().unwrap();
        v.get(fd as usize).cloned()
    }

    /// Arm `kind` on `fd` with the running coroutine as the waiter.
    ///
    /// Must be called from inside a coroutine; the coroutine is scheduled
    /// back (pinned to this thread) when the status fires.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, kind: EventKind) -> bool {
        let Some(co) = tls::running() else {
            kerror!("{} add_event on fd {} outside a coroutine", self.name(), fd);
            return false;
        };
        self.add_event_inner(fd, kind, TaskUnit::Co(co), tls::current_tid())
    }

    /// Arm `kind` on `fd` with a callback waiter, runnable on any worker.
    pub fn add_event_with(
        self: &Arc<Self>,
        fd: RawFd,
        kind: EventKind,
        f: impl FnOnce() + Send + 'static,
    ) -> bool {
        self.add_event_inner(fd, kind, TaskUnit::Call(Box::new(f)), 0)
    }

    fn add_event_inner(
        self: &Arc<Self>,
        fd: RawFd,
        kind: EventKind,
        unit: TaskUnit,
        tid: libc::pid_t,
    ) -> bool {
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().unwrap();
        if inner.statuses.contains(kind) {
            kerror!("{} fd {} {:?} already armed", self.name(), fd, kind);
            return false;
        }
        let op = if inner.statuses.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.statuses.with(kind).bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if rc != 0 {
            kerror!(
                "{} epoll_ctl add fd {} {:?} failed: {}",
                self.name(),
                fd,
                kind,
                Errno::last()
            );
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.statuses.insert(kind);
        let sched: Arc<dyn Schedule> =
            tls::current_schedule().unwrap_or_else(|| self.clone() as Arc<dyn Schedule>);
        *inner.waiter_mut(kind) = Waiter {
            sched: Some(Arc::downgrade(&sched)),
            tid,
            unit: Some(unit),
        };
        true
    }

    /// Disarm `kind` on `fd` without waking its waiter.
    pub fn del_event(&self, fd: RawFd, kind: EventKind) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.statuses.contains(kind) {
            return false;
        }
        let left = inner.statuses.without(kind);
        if !self.rearm(fd, left) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.statuses = left;
        inner.waiter_mut(kind).clear();
        true
    }

    /// Disarm `kind` on `fd` and wake its waiter as if the status fired.
    pub fn cancel_event(&self, fd: RawFd, kind: EventKind) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.statuses.contains(kind) {
            return false;
        }
        let left = inner.statuses.without(kind);
        if !self.rearm(fd, left) {
            return false;
        }
        Self::fire(&mut inner, kind);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm everything on `fd`, waking every armed waiter.
    pub fn cancel_all_event(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.statuses.is_empty() {
            return false;
        }
        if !self.rearm(fd, EventSet::NONE) {
            return false;
        }
        if Self::fire(&mut inner, EventKind::Read) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if Self::fire(&mut inner, EventKind::Write) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(inner.statuses.is_empty());
        true
    }

    fn rearm(&self, fd: RawFd, left: EventSet) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if rc != 0 {
            kerror!(
                "{} epoll_ctl rearm fd {} failed: {}",
                self.name(),
                fd,
                Errno::last()
            );
            return false;
        }
        true
    }

    /// Move the waiter for `kind` out of its slot and back to its
    /// scheduler. Clears the status bit.
    fn fire(inner: &mut FdInner, kind: EventKind) -> bool {
        if !inner.statuses.contains(kind) {
            return false;
        }
        inner.statuses.remove(kind);
        let w = inner.waiter_mut(kind);
        let tid = w.tid;
        let sched = w.sched.take().and_then(|s| s.upgrade());
        let unit = w.unit.take();
        w.clear();
        let (Some(sched), Some(unit)) = (sched, unit) else {
            return false;
        };
        sched.submit(Task { unit, tid });
        true
    }

    // Timers. Mutations that move the earliest deadline forward wake a
    // parked worker so its epoll timeout is recomputed.

    pub fn add_timer(
        &self,
        interval: Duration,
        f: impl Fn() + Send + Sync + 'static,
        repeat: bool,
    ) -> Arc<Timer> {
        let (timer, front) = self.timers.add(interval, Arc::new(f), repeat);
        if front {
            self.wake();
        }
        timer
    }

    /// A timer whose callback runs only while `cond` still has strong
    /// references.
    pub fn add_cond_timer<T: Send + Sync + 'static>(
        &self,
        interval: Duration,
        f: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        repeat: bool,
    ) -> Arc<Timer> {
        let (timer, front) = self
            .timers
            .add_conditional(interval, Arc::new(f), cond, repeat);
        if front {
            self.wake();
        }
        timer
    }

    pub fn cancel_timer(&self, timer: &Arc<Timer>) -> bool {
        let (found, front) = self.timers.cancel(timer);
        if front {
            self.wake();
        }
        found
    }

    pub fn cancel_all_timer(&self) {
        self.timers.cancel_all();
        self.wake();
    }

    pub fn reset_timer(&self, timer: &Arc<Timer>, interval: Duration) -> bool {
        let (found, front) = self.timers.reset(timer, interval);
        if front {
            self.wake();
        }
        found
    }

    pub fn is_valid_timer(&self, timer: &Arc<Timer>) -> bool {
        self.timers.is_valid(timer)
    }

    fn epoll_pass(&self, events: &mut [libc::epoll_event]) -> usize {
        self.core.idle_enter();
        let n = loop {
            let timeout = match self.timers.next_left_time() {
                Some(d) => d.min(MAX_EPOLL_TIMEOUT),
                None => MAX_EPOLL_TIMEOUT,
            };
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout.as_millis() as i32,
                )
            };
            if rc < 0 {
                if Errno::last() == Errno::EINTR {
                    continue;
                }
                kerror!("{} epoll_wait failed: {}", self.name(), Errno::last());
                break 0;
            }
            let timer_due = self.timers.next_left_time() == Some(Duration::ZERO);
            if rc > 0 || timer_due || self.core.is_stopping() {
                break rc as usize;
            }
        };
        self.core.idle_exit();
        n
    }

    fn dispatch(&self, ev: &libc::epoll_event) {
        let fd = ev.u64 as RawFd;
        let Some(ctx) = self.lookup(fd) else { return };
        let mut inner = ctx.inner.lock().unwrap();

        let mut bits = ev.events;
        if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            // Let both directions observe the error through their IO call.
            bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
        }
        let real = EventSet(bits & inner.statuses.bits());
        if real.is_empty() {
            // Raced with a cancel; nothing left to deliver.
            kdebug!("{} stale wakeup on fd {}", self.name(), ctx.fd);
            return;
        }
        let left = EventSet(inner.statuses.bits() & !real.0);
        if !self.rearm(fd, left) {
            return;
        }
        if real.contains(EventKind::Read) && Self::fire(&mut inner, EventKind::Read) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if real.contains(EventKind::Write) && Self::fire(&mut inner, EventKind::Write) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn submit_batch(&self, tasks: Vec<Task>) {
        match self.core.push_batch(tasks) {
            None => {}
            Some(need_tickle) => {
                if need_tickle {
                    self.wake();
                }
            }
        }
    }
}

impl Drop for IoManager {
    // Clear every armed callback; the epoll and pipe fds close with their
    // OwnedFds.
    fn drop(&mut self) {
        self.timers.cancel_all();
    }
}

impl Schedule for IoManager {
    fn submit(&self, task: Task) -> bool {
        match self.core.push(task) {
            None => false,
            Some(need_tickle) => {
                if need_tickle {
                    self.wake();
                }
                true
            }
        }
    }
}

impl Reactor for IoManager {
    fn core(&self) -> &SchedCore {
        &self.core
    }

    fn tickle(&self) {
        self.wake();
    }

    fn idle_cycle(&self) -> bool {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = self.epoll_pass(&mut events);

        let cbs: Vec<TimerCb> = self.timers.take_expired();
        if !cbs.is_empty() {
            let tasks = cbs
                .into_iter()
                .map(|cb| Task::call(move || cb(), 0))
                .collect();
            self.submit_batch(tasks);
        }

        for ev in &events[..n] {
            if ev.u64 == self.tickle_rd.as_raw_fd() as u64 {
                self.drain_tickle();
                continue;
            }
            self.dispatch(ev);
        }

        if self.core.is_stopping() && self.core.pending() == 0 {
            if self.core.is_caller_thread() {
                if self.core.alive_workers() == 0 {
                    return false;
                }
            } else {
                return false;
            }
        }
        true
    }

    fn use_hook(&self) -> bool {
        true
    }

    fn as_io_manager(self: &Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self.clone())
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn nonblock_pipe() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap()
    }

    fn wait_for(cond: impl Fn() -> bool, max: Duration) -> bool {
        let deadline = Instant::now() + max;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_read_event_fires_once_per_arm() {
        let iom = IoManager::new("io-once", false, 1);
        iom.start();
        let (rd, wr) = nonblock_pipe();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        assert!(iom.add_event_with(rd.as_raw_fd(), EventKind::Read, move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        // Same direction cannot be armed twice.
        let f = fired.clone();
        assert!(!iom.add_event_with(rd.as_raw_fd(), EventKind::Read, move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(iom.pending_events(), 1);

        nix::unistd::write(&wr, b"x").unwrap();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        assert_eq!(iom.pending_events(), 0);

        // One-shot: more data does not fire again until rearmed.
        nix::unistd::write(&wr, b"y").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        iom.stop();
        iom.join();
    }

    #[test]
    fn test_del_event_is_silent() {
        let iom = IoManager::new("io-del", false, 1);
        iom.start();
        let (rd, wr) = nonblock_pipe();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        assert!(iom.add_event_with(rd.as_raw_fd(), EventKind::Read, move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(iom.del_event(rd.as_raw_fd(), EventKind::Read));
        assert_eq!(iom.pending_events(), 0);

        nix::unistd::write(&wr, b"x").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Nothing armed, nothing to delete.
        assert!(!iom.del_event(rd.as_raw_fd(), EventKind::Read));

        iom.stop();
        iom.join();
    }

    #[test]
    fn test_cancel_event_fires_waiter() {
        let iom = IoManager::new("io-cancel", false, 1);
        iom.start();
        let (rd, _wr) = nonblock_pipe();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        assert!(iom.add_event_with(rd.as_raw_fd(), EventKind::Read, move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(iom.cancel_event(rd.as_raw_fd(), EventKind::Read));
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        iom.join();
    }

    #[test]
    fn test_timer_fires_through_idle() {
        let iom = IoManager::new("io-timer", false, 1);
        iom.start();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let start = Instant::now();
        iom.add_timer(
            Duration::from_millis(30),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_millis(25));
        iom.stop();
        iom.join();
    }

    #[test]
    fn test_repeating_timer_until_cancel() {
        let iom = IoManager::new("io-loop", false, 1);
        iom.start();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = iom.add_timer(
            Duration::from_millis(10),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        assert!(wait_for(|| fired.load(Ordering::SeqCst) >= 3, Duration::from_secs(2)));
        assert!(iom.is_valid_timer(&timer));
        assert!(iom.cancel_timer(&timer));
        assert!(!iom.is_valid_timer(&timer));
        let seen = fired.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), seen);
        iom.stop();
        iom.join();
    }

    #[test]
    fn test_stop_unblocks_epoll() {
        let iom = IoManager::new("io-stop", false, 2);
        iom.start();
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        iom.stop();
        iom.join();
        // Workers parked in epoll_wait were woken by the pipe.
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
