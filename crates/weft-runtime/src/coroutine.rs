//! Stackful coroutines
//!
//! A [`Coroutine`] owns an mmap'd stack and a saved register set. Control
//! moves strictly between a thread's main context and the coroutine:
//! `resume` switches in from the main context, [`Coroutine::yield_current`]
//! switches back out. A coroutine is never resumed from inside another
//! coroutine.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::error::BodyError;
use weft_core::id::CoId;
use weft_core::state::CoState;
use weft_core::{kdebug, kerror, kprint};

use crate::arch::{self, RegSet};
use crate::config;
use crate::stack::Stack;
use crate::tls;

type Body = Box<dyn FnOnce() -> Result<(), BodyError> + Send + 'static>;

/// A stackful coroutine.
///
/// States move Init -> Running -> (Yield -> Running)* -> Terminal, or to
/// Except when the body returns an error or panics. A finished coroutine can
/// be given a new body and id with [`reset`](Self::reset), reusing its stack.
pub struct Coroutine {
    id: AtomicU64,
    state: AtomicU8,
    regs: UnsafeCell<RegSet>,
    stack: Stack,
    body: Mutex<Option<Body>>,
    error: Mutex<Option<BodyError>>,
}

// `regs` is only written through by the thread currently switching this
// coroutine, and the state machine keeps that to one thread at a time.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Create a coroutine whose body cannot fail.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Self::fallible(move || {
            f();
            Ok(())
        })
    }

    /// Create a coroutine with a fallible body and the default stack size.
    pub fn fallible(f: impl FnOnce() -> Result<(), BodyError> + Send + 'static) -> Arc<Self> {
        Self::with_stack_size(f, 0)
    }

    /// Create a coroutine with an explicit stack size (0 means the
    /// configured default).
    ///
    /// Stack allocation failure is not recoverable for the caller, so it
    /// panics rather than returning an error.
    pub fn with_stack_size(
        f: impl FnOnce() -> Result<(), BodyError> + Send + 'static,
        stack_size: usize,
    ) -> Arc<Self> {
        let size = if stack_size == 0 {
            config::global().stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(size).expect("coroutine stack allocation failed");
        let id = CoId::next();
        let co = Arc::new(Self {
            id: AtomicU64::new(id.as_u64()),
            state: AtomicU8::new(CoState::Init as u8),
            regs: UnsafeCell::new(RegSet::default()),
            stack,
            body: Mutex::new(Some(Box::new(f))),
            error: Mutex::new(None),
        });
        unsafe {
            arch::init_context(co.regs.get(), co.stack.top(), co_entry as usize, 0);
        }
        kdebug!("coroutine {} created, stack {} bytes", id, co.stack.len());
        co
    }

    #[inline]
    pub fn id(&self) -> CoId {
        CoId::from_u64(self.id.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn state(&self) -> CoState {
        CoState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: CoState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// The error that moved this coroutine to `Except`, if any.
    pub fn error(&self) -> Option<BodyError> {
        self.error.lock().unwrap().clone()
    }

    /// Lowest mapped address of the backing stack, for diagnostics.
    pub fn stack_base(&self) -> usize {
        self.stack.base() as usize
    }

    /// Switch from this thread's main context into the coroutine.
    ///
    /// Returns once the coroutine yields or finishes. Panics when called
    /// from inside a coroutine or on a coroutine that is not resumable.
    pub fn resume(self: &Arc<Self>) {
        let st = self.state();
        assert!(
            st.can_resume(),
            "coroutine {} resumed in state {}",
            self.id(),
            st
        );
        assert!(
            tls::running().is_none(),
            "resume must be called from the thread's main context"
        );
        self.set_state(CoState::Running);
        tls::set_running(self.clone());
        kprint::set_co_id(self.id().as_u64());
        unsafe {
            arch::context_switch(tls::main_regs(), self.regs.get());
        }
        kprint::clear_co_id();
        tls::clear_running();
    }

    /// Suspend the running coroutine and return to the thread's main
    /// context.
    ///
    /// Panics in the main context; the main context has nowhere to yield to.
    pub fn yield_current() {
        let co = tls::running().expect("yield called outside a coroutine");
        co.set_state(CoState::Yield);
        let regs = co.regs.get();
        drop(co);
        unsafe {
            arch::context_switch(regs, tls::main_regs());
        }
    }

    /// The id of the running coroutine, or [`CoId::NONE`] in the main
    /// context.
    pub fn current_id() -> CoId {
        tls::running().map_or(CoId::NONE, |co| co.id())
    }

    /// Give a finished coroutine a new body and a fresh id, reusing its
    /// stack. Returns false unless the coroutine is Init, Terminal or
    /// Except.
    pub fn reset(&self, f: impl FnOnce() -> Result<(), BodyError> + Send + 'static) -> bool {
        if !self.state().can_reset() {
            return false;
        }
        *self.body.lock().unwrap() = Some(Box::new(f));
        *self.error.lock().unwrap() = None;
        let id = CoId::next();
        self.id.store(id.as_u64(), Ordering::Relaxed);
        unsafe {
            arch::init_context(self.regs.get(), self.stack.top(), co_entry as usize, 0);
        }
        self.set_state(CoState::Init);
        true
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// First frame on every coroutine stack.
///
/// Runs the body, records the outcome, then switches back to the main
/// context for good. The final switch must not be returned from.
extern "C" fn co_entry(_arg: usize) {
    let co = tls::running().expect("coroutine entry without a running coroutine");
    let body = co.body.lock().unwrap().take();
    let outcome = match body {
        Some(f) => panic::catch_unwind(AssertUnwindSafe(f)),
        None => Ok(Ok(())),
    };
    match outcome {
        Ok(Ok(())) => co.set_state(CoState::Terminal),
        Ok(Err(e)) => {
            kerror!("coroutine {} failed: {}", co.id(), e);
            *co.error.lock().unwrap() = Some(e);
            co.set_state(CoState::Except);
        }
        Err(payload) => {
            let what = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "coroutine body panicked".to_string()
            };
            kerror!("coroutine {} panicked: {}", co.id(), what);
            *co.error.lock().unwrap() = Some(BodyError::from(what));
            co.set_state(CoState::Except);
        }
    }
    // The thread-local slot still holds its own Arc; drop ours before the
    // stack is abandoned so nothing leaks on it.
    let regs = co.regs.get();
    drop(co);
    unsafe {
        arch::context_switch(regs, tls::main_regs());
    }
    unreachable!("finished coroutine resumed");
}
