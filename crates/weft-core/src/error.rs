//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations.
///
/// Event and scheduling boundary operations report success via `bool`;
/// this enum covers the setup paths that return `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The process-wide config was already installed or read
    AlreadyStarted,

    /// Stack allocation failed
    StackError(StackError),

    /// Invalid configuration value
    InvalidConfig(&'static str),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AlreadyStarted => write!(f, "config already installed"),
            RuntimeError::StackError(e) => write!(f, "stack error: {}", e),
            RuntimeError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Stack allocation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocationFailed,

    /// mprotect for the guard page failed
    ProtectionFailed,

    /// Requested size too small to be usable
    SizeTooSmall,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed => write!(f, "stack allocation failed"),
            StackError::ProtectionFailed => write!(f, "guard page protection failed"),
            StackError::SizeTooSmall => write!(f, "stack size too small"),
        }
    }
}

impl From<StackError> for RuntimeError {
    fn from(e: StackError) -> Self {
        RuntimeError::StackError(e)
    }
}

/// The error value a coroutine body may finish with.
///
/// A body returning `Err(BodyError)` puts the coroutine into the EXCEPT
/// state; the error never unwinds into the scheduler. A panic inside the
/// body is caught at the trampoline and converted into one of these too.
#[derive(Debug, Clone)]
pub struct BodyError {
    /// Human-readable diagnostic, logged when the coroutine excepts.
    pub what: String,
}

impl BodyError {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.what)
    }
}

impl std::error::Error for BodyError {}

impl From<&str> for BodyError {
    fn from(s: &str) -> Self {
        BodyError::new(s)
    }
}

impl From<String> for BodyError {
    fn from(s: String) -> Self {
        BodyError::new(s)
    }
}

impl From<std::io::Error> for BodyError {
    fn from(e: std::io::Error) -> Self {
        BodyError::new(e.to_string())
    }
}
