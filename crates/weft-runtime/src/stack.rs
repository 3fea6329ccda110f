//! Per-coroutine stacks backed by mmap
//!
//! Each stack carries one PROT_NONE guard page at its low end so that an
//! overflow faults instead of silently corrupting neighbouring memory.

use weft_core::error::StackError;

const PAGE_SIZE: usize = 4096;
const MIN_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// An owned, guard-paged coroutine stack.
///
/// The region stays mapped for the lifetime of the owning coroutine and is
/// reused across `reset` calls.
pub struct Stack {
    base: *mut u8,
    total_size: usize,
}

// The raw pointer is only touched by whichever thread currently runs the
// owning coroutine.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a new stack of at least `size` usable bytes plus a guard page.
    pub fn new(size: usize) -> Result<Self, StackError> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::SizeTooSmall);
        }
        let usable = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let total_size = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocationFailed);
        }

        // Guard page at the low end; growth is downwards on every target
        // we support.
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total_size) };
            return Err(StackError::ProtectionFailed);
        }

        Ok(Self {
            base: base as *mut u8,
            total_size,
        })
    }

    /// One past the highest usable byte, where execution starts.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total_size) }
    }

    /// Lowest mapped address (the guard page).
    #[inline]
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Usable bytes, excluding the guard page.
    #[inline]
    pub fn len(&self) -> usize {
        self.total_size - PAGE_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe { libc::munmap(self.base as *mut libc::c_void, self.total_size) };
        }
    }
}
