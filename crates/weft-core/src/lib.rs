//! Core types and helpers for the weft coroutine runtime.
//!
//! This crate is platform agnostic: identifiers, the coroutine state
//! machine, the error taxonomy, environment helpers and the kernel-style
//! logging macros. Everything that touches the OS lives in `weft-runtime`.

pub mod env;
pub mod error;
pub mod id;
pub mod kprint;
pub mod state;

pub use env::{env_get, env_get_bool, env_get_str};
pub use error::{BodyError, RuntimeError, RuntimeResult, StackError};
pub use id::{CoId, TimerId};
pub use kprint::LogLevel;
pub use state::CoState;
