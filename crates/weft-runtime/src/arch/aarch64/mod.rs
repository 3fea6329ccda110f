//! aarch64 context switching implementation
//!
//! TODO: Implement for ARM64 (macOS Apple Silicon, Linux ARM, etc.)

use super::RegSet;

/// Initialize a fresh coroutine context
pub unsafe fn init_context(
    _regs: *mut RegSet,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Perform a voluntary context switch
pub unsafe extern "C" fn context_switch(_old_regs: *mut RegSet, _new_regs: *const RegSet) {
    todo!("aarch64 context_switch not yet implemented")
}
