//! weft-runtime: stackful coroutines, an N:M scheduler, and an epoll-backed
//! IO manager with hooked blocking calls.
//!
//! The layering is bottom-up: [`arch`] and [`stack`] give a coroutine its
//! context and memory, [`coroutine`] the resume/yield state machine,
//! [`scheduler`] the worker pool, [`iomanager`] the epoll reactor with
//! timers, and [`hook`] the blocking-call wrappers on top of it all.

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod fd;
pub mod hook;
pub mod iomanager;
pub mod parking;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

pub use config::RuntimeConfig;
pub use coroutine::Coroutine;
pub use iomanager::{EventKind, IoManager};
pub use scheduler::{Schedule, ScheduleExt, Scheduler, Task};
pub use timer::Timer;
