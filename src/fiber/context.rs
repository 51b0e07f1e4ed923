//! The raw register-context switch.
//!
//! This is the x86-64 System V ABI implementation: save the callee-saved
//! registers and the stack pointer into `old`, load them from `new`, and
//! `ret` into whatever instruction pointer `new` was parked at.
//!
//! The save/restore sequence is the same shape as a textbook green-thread
//! switch (callee-saved regs + return address, stack pointer last so the
//! trailing `ret` lands in the new context), using the x86-64 registers
//! (`rbx`, `rbp`, `r12`-`r15`) the SysV ABI requires a callee to preserve.
//! `switch` is `#[naked]` rather than an ordinary `fn` containing `asm!`: an
//! ordinary function may insert its own prologue (e.g. a stack-alignment
//! `sub rsp`) before the inline asm runs, which would corrupt the saved
//! `rsp` the next switch back relies on.

use std::arch::naked_asm;

/// Saved callee-saved register state for one fiber.
///
/// `rsp` must always point at a valid return address on entry to
/// [`switch`]; the trampoline that starts a fresh fiber relies on this by
/// pushing its entry point as that return address (see [`Context::prepare`]).
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares a context so that the next [`switch`] into it starts
    /// executing `entry` on `stack_top`, with `entry` receiving no
    /// arguments (state is instead recovered via thread-locals, matching
    /// [`super::Fiber::current`]).
    ///
    /// # Safety
    /// `stack_top` must be the top (high address) of a live, writable stack
    /// allocation that outlives this context, and `entry` must never return
    /// (it must terminate by switching away, never via a normal `ret`).
    pub unsafe fn prepare(&mut self, stack_top: *mut u8, entry: extern "C" fn() -> !) {
        // Reserve the "return address" that `switch`'s `ret` will pop. x86-64's
        // `call` leaves `rsp % 16 == 8` on entry to the callee. We land in
        // `entry` via `ret` instead of `call`, which pops one word and adds 8
        // to `rsp`; to reproduce that same `rsp % 16 == 8` postcondition, `sp`
        // itself (the slot `ret` pops from) must be 16-byte aligned, not 8 mod
        // 16.
        let aligned_top = (stack_top as usize & !0xf) as *mut u8;
        let sp = unsafe { aligned_top.sub(16) } as *mut u64;
        unsafe {
            // The slot `ret` will pop as the new instruction pointer.
            sp.write(entry as usize as u64);
        }
        self.rsp = sp as u64;
        self.r15 = 0;
        self.r14 = 0;
        self.r13 = 0;
        self.r12 = 0;
        self.rbx = 0;
        self.rbp = 0;
    }
}

/// Saves the current register state into `old`, restores it from `new`,
/// and transfers control to whatever the new context's saved `rsp` points
/// at (either a previously suspended fiber, resuming right where it called
/// `switch`, or a freshly [`prepare`]d one, entering its trampoline).
///
/// # Safety
/// Both contexts must describe a consistent, currently-suspended or
/// freshly-prepared machine state; `new` must belong to a stack that is
/// still live. Must be called with `old`/`new` pointing at memory that
/// outlives the switch (typically each fiber's own heap-allocated
/// [`Context`]).
#[unsafe(naked)]
pub unsafe extern "C" fn switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        // Save the current callee-saved registers and stack pointer.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], r15",
        "mov [rdi + 0x10], r14",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], rbx",
        "mov [rdi + 0x30], rbp",
        // Load the new ones.
        "mov rsp, [rsi + 0x00]",
        "mov r15, [rsi + 0x08]",
        "mov r14, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov rbx, [rsi + 0x28]",
        "mov rbp, [rsi + 0x30]",
        // Pops the word now on top of the restored stack: either a
        // previously-saved return address (resuming a suspended fiber) or
        // the entry trampoline (first resume).
        "ret",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::stack::Stack;
    use std::sync::atomic::{AtomicBool, Ordering};

    static RAN: AtomicBool = AtomicBool::new(false);
    // Filled in by the first `switch()` call below with the register state
    // to resume when `probe` switches back; `probe` has no other way to
    // reach it since it runs on a different stack with no arguments.
    static mut CALLER: Context = Context {
        rsp: 0,
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        rbx: 0,
        rbp: 0,
    };

    extern "C" fn probe() -> ! {
        RAN.store(true, Ordering::SeqCst);
        let mut discard = Context::new();
        unsafe {
            switch(std::ptr::addr_of_mut!(discard), std::ptr::addr_of!(CALLER));
        }
        unreachable!("switching back must not return");
    }

    #[test]
    fn switch_runs_entry_and_returns() {
        RAN.store(false, Ordering::SeqCst);
        let stack = Stack::new(256 * 1024).unwrap();
        let mut target = Context::new();
        unsafe { target.prepare(stack.top(), probe) };

        unsafe {
            // Saves the state to resume at into `CALLER` (as `old`) and
            // jumps into `target`/`probe`. `probe` switches back into
            // `CALLER`, so control returns here once it has run.
            switch(std::ptr::addr_of_mut!(CALLER), &target as *const Context);
        }
        assert!(RAN.load(Ordering::SeqCst));
    }
}
