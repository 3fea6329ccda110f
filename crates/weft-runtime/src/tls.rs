//! Thread-local runtime state
//!
//! Every OS thread owns a main context (the saved registers of the thread
//! itself while a coroutine runs on it) plus slots for the currently running
//! coroutine and the scheduler driving this thread.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::Arc;

use crate::arch::RegSet;
use crate::coroutine::Coroutine;
use crate::iomanager::IoManager;
use crate::scheduler::Schedule;

thread_local! {
    static MAIN_REGS: UnsafeCell<RegSet> = UnsafeCell::new(RegSet::default());
    static RUNNING: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    static SCHEDULER: RefCell<Option<Arc<dyn Schedule>>> = const { RefCell::new(None) };
    static IO_MANAGER: RefCell<Option<Arc<IoManager>>> = const { RefCell::new(None) };
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Saved registers of this thread's main context.
///
/// The pointer is stable for the lifetime of the thread; it is only written
/// through during a context switch on this same thread.
#[inline]
pub(crate) fn main_regs() -> *mut RegSet {
    MAIN_REGS.with(|r| r.get())
}

/// The coroutine currently running on this thread, if any.
pub fn running() -> Option<Arc<Coroutine>> {
    RUNNING.with(|r| r.borrow().clone())
}

pub(crate) fn set_running(co: Arc<Coroutine>) {
    RUNNING.with(|r| *r.borrow_mut() = Some(co));
}

pub(crate) fn clear_running() {
    RUNNING.with(|r| *r.borrow_mut() = None);
}

/// The scheduler driving this worker thread, if this is a worker thread.
pub fn current_schedule() -> Option<Arc<dyn Schedule>> {
    SCHEDULER.with(|s| s.borrow().clone())
}

/// The IO manager driving this worker thread, if its reactor is one.
pub fn current_io_manager() -> Option<Arc<IoManager>> {
    IO_MANAGER.with(|s| s.borrow().clone())
}

pub(crate) fn set_scheduler(sched: Arc<dyn Schedule>, iom: Option<Arc<IoManager>>) {
    SCHEDULER.with(|s| *s.borrow_mut() = Some(sched));
    IO_MANAGER.with(|s| *s.borrow_mut() = iom);
}

pub(crate) fn clear_scheduler() {
    SCHEDULER.with(|s| *s.borrow_mut() = None);
    IO_MANAGER.with(|s| *s.borrow_mut() = None);
}

/// Whether blocking-call interception is on for this thread.
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

/// Turn blocking-call interception on or off for this thread.
#[inline]
pub fn enable_hook(on: bool) {
    HOOK_ENABLED.with(|h| h.set(on));
}

/// The kernel thread id of the calling thread.
#[inline]
pub fn current_tid() -> libc::pid_t {
    nix::unistd::gettid().as_raw()
}
