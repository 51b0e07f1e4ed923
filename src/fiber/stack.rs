//! Stack allocation for fibers.
//!
//! A [`Stack`] is a raw `mmap`-backed allocation with a guard page at the
//! low address (the stack grows down from the high address towards it). If
//! a fiber ever overflows its stack it will (hopefully) hit the guard page
//! and fault rather than corrupting adjacent memory.

use std::io;
use std::ptr;

use crate::error::ResourceError;

fn page_size() -> usize {
    // SAFETY: `sysconf` with this argument never fails in practice; a
    // negative return would only happen for an unsupported `name`.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// An `mmap`-backed fiber stack with a guard page at the low end.
///
/// The "Stack" name is inherited from the coroutine libraries this is
/// modeled on; there is nothing segmented about it.
#[derive(Debug)]
pub struct Stack {
    base: *mut libc::c_void,
    len: usize,
}

// The memory is privately mapped and only ever touched by the one thread
// running the fiber at a time; moving the handle across threads is the
// entire point of a fiber.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocates a new stack of at least `min_size` bytes, rounded up to a
    /// whole number of pages, plus one extra guard page.
    pub fn new(min_size: usize) -> Result<Self, ResourceError> {
        let page = page_size();
        let usable = min_size.div_ceil(page) * page;
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | stack_flag(),
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ResourceError::StackAllocation {
                size: usable,
                source: io::Error::last_os_error(),
            });
        }

        // The guard page is the *first* page of the mapping: the stack
        // grows from the high end (`base + len`) down towards `base`, so
        // the first overrun hits `base..base+page`.
        let guard_rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if guard_rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(ResourceError::GuardPage(err));
        }

        Ok(Stack { base, len })
    }

    /// Pointer one byte past the high end of the usable region — the
    /// initial stack pointer value for a freshly created fiber (after
    /// whatever alignment the context-switch ABI requires).
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) as *mut u8 }
    }

    /// Pointer to the start of the guard page (the low end of the mapping).
    pub fn guard(&self) -> *const u8 {
        self.base as *const u8
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

#[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
fn stack_flag() -> libc::c_int {
    libc::MAP_STACK
}

// MAP_STACK interacts badly with MAP_FIXED on these platforms.
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn stack_flag() -> libc::c_int {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_requested_size_rounded_to_pages() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.len >= 64 * 1024);
        assert!(!stack.top().is_null());
        assert!(!stack.guard().is_null());
        assert!((stack.top() as usize) > (stack.guard() as usize));
    }

    #[test]
    fn zero_size_still_gets_a_guard_page() {
        let stack = Stack::new(0).unwrap();
        assert!(stack.len >= page_size());
    }
}
