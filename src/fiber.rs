//! Stackful coroutines.
//!
//! A [`Fiber`] is a unit of cooperative execution: its own stack and saved
//! register context, resumed and suspended explicitly rather than
//! pre-empted. [`Fiber::resume`] (`swapIn`) switches the calling thread onto
//! the fiber's stack; [`yield_now`] (`swapOut`) switches back to whichever
//! fiber called `resume`. Every OS thread has an implicit *main fiber*
//! representing its own native stack, created lazily the first time
//! [`Fiber::current`] is asked for it on that thread; `resume`/`yield_now`
//! treat it exactly like any other fiber, just one that is never put in a
//! run queue and never allocates a [`stack::Stack`] of its own.
//!
//! A [`Builder`] configures name/stack size/entry, then spawns a handle;
//! fibers are built directly on [`context`] and [`stack`] rather than FFI
//! into some host process's own fiber implementation.

pub mod context;
pub mod stack;

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, UsageError};

use context::Context;
use stack::Stack;

////////////////////////////////////////////////////////////////////////////////
// Status
////////////////////////////////////////////////////////////////////////////////

/// A fiber's execution status.
///
/// Transitions: `Init -> Ready -> Running -> (Hold | Ready | Term | Except)`.
/// Once `Term` or `Except`, a fiber is never resumed again (unless
/// explicitly [`Fiber::reset`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Created, never resumed.
    Init = 0,
    /// Runnable, waiting for a worker to resume it.
    Ready = 1,
    /// Currently executing on some thread.
    Running = 2,
    /// Suspended, waiting to be explicitly rescheduled (e.g. by a timer or
    /// an I/O readiness event).
    Hold = 3,
    /// Returned from its entry callable normally.
    Term = 4,
    /// Its entry callable panicked; the panic was caught at the boundary.
    Except = 5,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Init,
            1 => Status::Ready,
            2 => Status::Running,
            3 => Status::Hold,
            4 => Status::Term,
            5 => Status::Except,
            _ => unreachable!("invalid fiber status byte {v}"),
        }
    }

    /// Whether a fiber in this state may be [`Fiber::resume`]d.
    pub fn is_resumable(self) -> bool {
        matches!(self, Status::Init | Status::Ready)
    }

    /// Whether a fiber in this state has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Term | Status::Except)
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Opaque, process-unique fiber identifier, assigned at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

fn next_fiber_id() -> FiberId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    FiberId(NEXT.fetch_add(1, Ordering::Relaxed))
}

////////////////////////////////////////////////////////////////////////////////
// Inner / Fiber
////////////////////////////////////////////////////////////////////////////////

type Entry = Box<dyn FnOnce() + Send>;

struct Inner {
    id: FiberId,
    name: String,
    status: AtomicU8,
    /// `None` for a thread's main fiber: it runs on the thread's native
    /// stack rather than one we allocated.
    stack: Option<Stack>,
    /// Saved register context. Accessed only while no other thread is
    /// running this fiber (the scheduling invariant this whole module
    /// exists to provide), so a plain `UnsafeCell` is sufficient; the
    /// `unsafe impl Sync` below documents that reliance.
    context: std::cell::UnsafeCell<Context>,
    /// The callable to run next, taken by the trampoline on first resume.
    /// Re-armed by [`Fiber::reset`].
    entry: Mutex<Option<Entry>>,
    /// Whoever last called `resume()` on this fiber; `yield_now` switches
    /// back into it. Same single-active-thread invariant as `context`.
    resumer: std::cell::UnsafeCell<Option<Arc<Inner>>>,
}

// SAFETY: `context` and `resumer` are only ever read or written by the one
// thread currently executing this fiber (enforced by `Fiber::resume`'s
// status check and the cooperative scheduling discipline this crate
// implements); no two threads touch them concurrently.
unsafe impl Sync for Inner {}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, s: Status) {
        self.status.store(s as u8, Ordering::Release);
    }

    fn new_main() -> Arc<Self> {
        Arc::new(Inner {
            id: next_fiber_id(),
            name: "<main>".into(),
            status: AtomicU8::new(Status::Running as u8),
            stack: None,
            context: std::cell::UnsafeCell::new(Context::new()),
            entry: Mutex::new(None),
            resumer: std::cell::UnsafeCell::new(None),
        })
    }
}

/// A handle to a fiber.
///
/// Cloning a `Fiber` clones the handle, not the fiber; all clones refer to
/// the same underlying execution context.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Fiber {}

thread_local! {
    static HOME: Arc<Inner> = Inner::new_main();
    static CURRENT: RefCell<Arc<Inner>> = RefCell::new(HOME.with(Arc::clone));
}

impl Fiber {
    /// Returns a handle to whichever fiber is executing on this thread right
    /// now, lazily creating the thread's main fiber on first call.
    pub fn current() -> Fiber {
        Fiber {
            inner: CURRENT.with(|c| c.borrow().clone()),
        }
    }

    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Transitions this fiber from [`Status::Hold`] back to [`Status::Ready`].
    /// Whoever registered to wake a held fiber (an I/O readiness
    /// notification, a timer, a cancellation) calls this just before handing
    /// the handle back to a scheduler, since `resume` only accepts `Ready`
    /// or `Init`.
    pub(crate) fn mark_ready(&self) {
        debug_assert!(
            matches!(self.inner.status(), Status::Hold),
            "mark_ready called on fiber {:?} in state {:?}",
            self.inner.id,
            self.inner.status()
        );
        self.inner.set_status(Status::Ready);
    }

    /// Whether this handle refers to its thread's implicit main fiber.
    pub fn is_main(&self) -> bool {
        self.inner.stack.is_none()
    }

    /// Switches the calling thread onto this fiber (`swapIn`). Blocks the
    /// caller until the fiber yields or terminates, then returns its new
    /// status.
    ///
    /// # Panics
    /// Panics if this fiber is not in [`Status::Init`] or [`Status::Ready`],
    /// or if it is already the currently-running fiber on this thread.
    pub fn resume(&self) -> Status {
        assert!(
            self.inner.status().is_resumable(),
            "cannot resume fiber {:?} in state {:?}",
            self.inner.id,
            self.inner.status()
        );

        let prev = CURRENT.with(|c| c.borrow().clone());
        assert!(
            !Arc::ptr_eq(&prev, &self.inner),
            "fiber {:?} tried to resume itself",
            self.inner.id
        );

        // SAFETY: single-writer invariant: only the thread currently owning
        // `self.inner` (about to become `prev`'s resumee) touches `resumer`.
        unsafe {
            *self.inner.resumer.get() = Some(prev.clone());
        }
        CURRENT.with(|c| *c.borrow_mut() = self.inner.clone());
        self.inner.set_status(Status::Running);

        // SAFETY: `prev` is the context we're switching away from (still
        // live, owned by this thread); `self.inner` is either freshly
        // prepared or was previously suspended mid-`yield_now` on this same
        // stack. Both outlive the switch.
        unsafe {
            context::switch(prev.context.get(), self.inner.context.get());
        }

        CURRENT.with(|c| *c.borrow_mut() = prev);
        self.inner.status()
    }

    /// Re-arms a terminated fiber with a fresh entry callable, reusing its
    /// stack allocation. Fails with [`UsageError::FiberNotTerminated`] unless
    /// the fiber is in [`Status::Term`] or [`Status::Except`].
    pub fn reset(&self, entry: impl FnOnce() + Send + 'static) -> Result<()> {
        let status = self.inner.status();
        if !status.is_terminal() {
            return Err(UsageError::FiberNotTerminated { status }.into());
        }
        let stack = self
            .inner
            .stack
            .as_ref()
            .expect("a non-main fiber always owns a stack");
        *self.inner.entry.lock().unwrap() = Some(Box::new(entry));
        // SAFETY: the fiber is terminal, so nothing is executing on `stack`;
        // `trampoline` never returns normally.
        unsafe {
            (*self.inner.context.get()).prepare(stack.top(), trampoline);
        }
        self.inner.set_status(Status::Init);
        Ok(())
    }
}

/// Suspends the currently running fiber, transferring control back to
/// whichever fiber resumed it (`swapOut`). `next` must be [`Status::Hold`]
/// or [`Status::Ready`] — the caller's choice of whether this fiber should
/// be explicitly rescheduled later or re-enqueued immediately.
///
/// # Panics
/// Panics if called on a thread's main fiber (there is nothing to yield
/// from) or with any `next` other than `Hold`/`Ready`.
pub fn yield_now(next: Status) {
    assert!(
        matches!(next, Status::Hold | Status::Ready),
        "yield_now: invalid target status {next:?}"
    );
    let cur = CURRENT.with(|c| c.borrow().clone());
    assert!(
        cur.stack.is_some(),
        "yield_now called on a thread's main fiber"
    );
    cur.set_status(next);

    // SAFETY: `resumer` was populated by the matching `resume()` call that
    // is currently blocked waiting for this switch; it is still live.
    let resumer = unsafe { (*cur.resumer.get()).clone() }
        .expect("a non-main fiber always has a resumer while running");
    unsafe {
        context::switch(cur.context.get(), resumer.context.get());
    }
}

/// The trampoline every freshly [`prepare`](Context::prepare)d fiber context
/// enters through. Takes no arguments — state is recovered from the
/// thread-local `CURRENT`, set by [`Builder::spawn`]/[`Fiber::reset`] just
/// before the first `resume()` — and never returns: on completion it sets
/// the terminal status and switches away permanently.
extern "C" fn trampoline() -> ! {
    let inner = CURRENT.with(|c| c.borrow().clone());
    let entry = inner
        .entry
        .lock()
        .unwrap()
        .take()
        .expect("fiber resumed with no entry callable armed");

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(entry));
    match outcome {
        Ok(()) => inner.set_status(Status::Term),
        Err(payload) => {
            log::error!(
                "fiber {:?} ({}) panicked: {}",
                inner.id,
                inner.name,
                panic_message(&payload)
            );
            inner.set_status(Status::Except);
        }
    }

    // SAFETY: same reasoning as in `yield_now`; this fiber never runs again
    // so we don't need to preserve its own context afterwards.
    let resumer = unsafe { (*inner.resumer.get()).clone() }
        .expect("a non-main fiber always has a resumer while running");
    loop {
        unsafe {
            context::switch(inner.context.get(), resumer.context.get());
        }
        // Reachable only if something erroneously resumes a Term/Except
        // fiber; loop rather than executing past the end of the stack.
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

pub(crate) const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Configures and spawns a [`Fiber`] (name / stack size / entry callable,
/// chained, then `spawn()`).
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Allocates the fiber's stack and prepares its context, but does not
    /// resume it; the caller (typically the scheduler) decides when.
    pub fn spawn(self, entry: impl FnOnce() + Send + 'static) -> Result<Fiber> {
        let stack = Stack::new(self.stack_size)?;
        let inner = Arc::new(Inner {
            id: next_fiber_id(),
            name: self.name.unwrap_or_else(|| "<fiber>".into()),
            status: AtomicU8::new(Status::Init as u8),
            stack: Some(stack),
            context: std::cell::UnsafeCell::new(Context::new()),
            entry: Mutex::new(Some(Box::new(entry))),
            resumer: std::cell::UnsafeCell::new(None),
        });
        // SAFETY: `stack` was just allocated for this fiber alone and
        // outlives `inner`; `trampoline` never returns normally.
        unsafe {
            let top = inner.stack.as_ref().unwrap().top();
            (*inner.context.get()).prepare(top, trampoline);
        }
        Ok(Fiber { inner })
    }
}

/// Shorthand for `Builder::new().spawn(entry)`.
pub fn spawn(entry: impl FnOnce() + Send + 'static) -> Result<Fiber> {
    Builder::new().spawn(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn fresh_fiber_starts_in_init() {
        let f = Builder::new().spawn(|| {}).unwrap();
        assert_eq!(f.status(), Status::Init);
    }

    #[test]
    fn resume_runs_to_term_on_normal_return() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let f = Builder::new().spawn(move || ran2.store(true, Ordering::SeqCst)).unwrap();
        let status = f.resume();
        assert_eq!(status, Status::Term);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn resume_catches_panics_as_except() {
        let f = Builder::new().spawn(|| panic!("boom")).unwrap();
        let status = f.resume();
        assert_eq!(status, Status::Except);
    }

    #[test]
    fn yield_to_hold_suspends_and_resume_continues() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let f = Builder::new()
            .spawn(move || {
                seen2.lock().unwrap().push(1);
                yield_now(Status::Hold);
                seen2.lock().unwrap().push(2);
            })
            .unwrap();

        let after_first = f.resume();
        assert_eq!(after_first, Status::Hold);
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        f.inner.set_status(Status::Ready);
        let after_second = f.resume();
        assert_eq!(after_second, Status::Term);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn reset_rejects_non_terminal_fiber() {
        let f = Builder::new()
            .spawn(|| {
                yield_now(Status::Hold);
            })
            .unwrap();
        f.resume();
        assert_eq!(f.status(), Status::Hold);
        let err = f.reset(|| {}).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Usage(UsageError::FiberNotTerminated { status: Status::Hold })
        ));
    }

    #[test]
    fn reset_rearms_a_terminated_fiber() {
        let f = Builder::new().spawn(|| {}).unwrap();
        f.resume();
        assert_eq!(f.status(), Status::Term);

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        f.reset(move || ran2.store(true, Ordering::SeqCst)).unwrap();
        assert_eq!(f.status(), Status::Init);
        f.resume();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn current_on_fresh_thread_is_the_main_fiber() {
        let handle = std::thread::spawn(|| {
            let main = Fiber::current();
            assert!(main.is_main());
            assert_eq!(main.status(), Status::Running);
        });
        handle.join().unwrap();
    }
}
