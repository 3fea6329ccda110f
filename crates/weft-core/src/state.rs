//! Coroutine state machine

use core::fmt;

/// State of a coroutine.
///
/// Transitions: `Init -> Running -> Yield -> Running -> ... -> Terminal`
/// (body returned) or `Except` (body failed). Terminal/Except coroutines
/// may be reset back to `Init` with a fresh body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoState {
    /// Constructed, never run
    Init = 0,

    /// Actively executing on some thread
    Running = 1,

    /// Suspended, resumable
    Yield = 2,

    /// Body returned normally
    Terminal = 3,

    /// Body returned an error or panicked
    Except = 4,
}

impl CoState {
    /// Check if `resume` is legal in this state.
    #[inline]
    pub const fn can_resume(&self) -> bool {
        matches!(self, CoState::Init | CoState::Yield)
    }

    /// Check if `reset` is legal in this state.
    #[inline]
    pub const fn can_reset(&self) -> bool {
        matches!(self, CoState::Init | CoState::Terminal | CoState::Except)
    }

    /// Check if the coroutine is done (normally or not).
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, CoState::Terminal | CoState::Except)
    }
}

impl From<u8> for CoState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoState::Init,
            1 => CoState::Running,
            2 => CoState::Yield,
            3 => CoState::Terminal,
            4 => CoState::Except,
            _ => CoState::Init, // Default for invalid values
        }
    }
}

impl From<CoState> for u8 {
    fn from(state: CoState) -> u8 {
        state as u8
    }
}

impl fmt::Display for CoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoState::Init => write!(f, "INIT"),
            CoState::Running => write!(f, "RUNNING"),
            CoState::Yield => write!(f, "YIELD"),
            CoState::Terminal => write!(f, "TERMINAL"),
            CoState::Except => write!(f, "EXCEPT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(CoState::Init.can_resume());
        assert!(CoState::Yield.can_resume());
        assert!(!CoState::Running.can_resume());
        assert!(!CoState::Terminal.can_resume());

        assert!(CoState::Init.can_reset());
        assert!(CoState::Terminal.can_reset());
        assert!(CoState::Except.can_reset());
        assert!(!CoState::Running.can_reset());
        assert!(!CoState::Yield.can_reset());

        assert!(CoState::Terminal.is_finished());
        assert!(CoState::Except.is_finished());
        assert!(!CoState::Yield.is_finished());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            CoState::Init,
            CoState::Running,
            CoState::Yield,
            CoState::Terminal,
            CoState::Except,
        ] {
            assert_eq!(CoState::from(u8::from(s)), s);
        }
        assert_eq!(CoState::from(200u8), CoState::Init);
    }
}
