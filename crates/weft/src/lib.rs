//! # weft - stackful coroutine runtime
//!
//! Userspace cooperative threading for Linux: coroutines with their own
//! mmap'd stacks, an N:M scheduler, and an epoll-backed IO manager whose
//! hooked socket calls park the coroutine instead of the thread.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{Coroutine, IoManager, ScheduleExt};
//! use std::time::Duration;
//!
//! fn main() {
//!     let iom = IoManager::new("main", true, 2);
//!
//!     let i = iom.clone();
//!     iom.schedule(move || {
//!         // Suspends this coroutine only; the worker keeps scheduling.
//!         weft::hook::sleep(Duration::from_millis(100));
//!         println!("awake");
//!         i.stop();
//!     });
//!
//!     // The calling thread becomes a worker until stop completes.
//!     iom.start();
//! }
//! ```
//!
//! ## Layers
//!
//! ```text
//! hook        blocking-call wrappers (read/write/connect/accept/sleep)
//! iomanager   epoll reactor + deadline-ordered timers
//! scheduler   FIFO task queue, worker pool, thread affinity
//! coroutine   resume/yield state machine over arch + stack
//! ```

// Core types
pub use weft_core::error::{BodyError, RuntimeError, RuntimeResult, StackError};
pub use weft_core::id::{CoId, TimerId};
pub use weft_core::state::CoState;

// Logging macros and controls
pub use weft_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};
pub use weft_core::{kdebug, kerror, kinfo, ktrace, kwarn};

// Env helpers
pub use weft_core::env::{env_get, env_get_bool, env_get_str};

// Runtime
pub use weft_runtime::config::{self, RuntimeConfig};
pub use weft_runtime::coroutine::Coroutine;
pub use weft_runtime::hook;
pub use weft_runtime::iomanager::{EventKind, IoManager};
pub use weft_runtime::scheduler::{Schedule, ScheduleExt, Scheduler, Task};
pub use weft_runtime::timer::Timer;
pub use weft_runtime::tls::current_tid;

/// Suspend the running coroutine; panics in the main context.
pub fn yield_now() {
    Coroutine::yield_current();
}
