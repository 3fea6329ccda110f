//! x86_64 context switching implementation
//!
//! Uses inline assembly for context switch.
//! Now stable in Rust 1.88+

use super::RegSet;
use std::arch::naked_asm;

/// Initialize a fresh coroutine context
///
/// Sets up the stack so that the first switch into `regs` begins execution
/// at `entry_fn` with `entry_arg` in rdi.
///
/// # Safety
///
/// `regs` must point to valid RegSet memory.
/// `stack_top` must point one past the highest usable byte of a live stack.
#[inline]
pub unsafe fn init_context(
    regs: *mut RegSet,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Align to 16 bytes; the trampoline's `call` then leaves rsp at
    // 16n+8 on entry, which is what the ABI prescribes.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // Entry function
    regs.r13 = entry_arg as u64; // Entry argument
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// The entry function switches away for good once the body has run, so the
/// `call` never returns; ud2 traps if it somehow does.
#[unsafe(naked)]
pub unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Perform a voluntary context switch
///
/// Saves callee-saved registers to `old_regs` and loads from `new_regs`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut RegSet, _new_regs: *const RegSet) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for saved context
        "1:",
        "ret",
    );
}
