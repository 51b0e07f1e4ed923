//! A [`Scheduler`](crate::scheduler::Scheduler) whose idle policy is a
//! kernel readiness wait — the scheduler's hardest piece.
//!
//! Composition instead of inheritance: [`IoManager`] owns a plain
//! [`Scheduler`] configured with [`EpollIdle`] as its
//! [`IdlePolicy`](crate::scheduler::IdlePolicy), plus the per-fd
//! registration table and [`TimerManager`] that `EpollIdle::idle` drains on
//! every iteration, built from the same `Arc<Mutex<..>>` idiom as
//! [`crate::timer`] and the raw-`libc` style of [`epoll`].

pub mod epoll;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::cell::RefCell;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Result, UsageError};
use crate::fiber::Fiber;
use crate::scheduler::{IdlePolicy, Scheduler, SchedulerHandle, Task, WorkerId};
use crate::timer::{TimerId, TimerManager, WeakCondition};
use crate::config::IoManagerConfig;

use epoll::{Epoll, Readiness, WakeFd};

bitflags! {
    /// The interest kinds a caller can register on a file descriptor: a
    /// bit-set, possibly empty, drawn from `{READ, WRITE}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventKind: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

fn to_epoll_readiness(mask: EventKind) -> Readiness {
    let mut r = Readiness::empty();
    if mask.contains(EventKind::READ) {
        r |= Readiness::READ;
    }
    if mask.contains(EventKind::WRITE) {
        r |= Readiness::WRITE;
    }
    r
}

/// What fires when a registered (fd, kind) pair becomes ready: either the
/// fiber that was running when it called `add_event` (the common "blocking"
/// I/O path), or a bare callable supplied explicitly (the accept-loop
/// pattern).
struct EventContext {
    /// The scheduler this handler is dispatched onto when its kind fires.
    /// Captured at registration time so `cancel_event` can wake a fiber
    /// blocked on a different worker than the one observing readiness.
    scheduler: SchedulerHandle,
    task: Task,
}

/// Per-fd registration record. `registered_mask` always equals the union of
/// kinds whose `EventContext` has a non-empty handler.
struct FdContext {
    registered_mask: EventKind,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

impl FdContext {
    fn new() -> Self {
        FdContext {
            registered_mask: EventKind::empty(),
            read: None,
            write: None,
        }
    }

    fn slot(&mut self, kind: EventKind) -> &mut Option<EventContext> {
        match kind {
            EventKind::READ => &mut self.read,
            EventKind::WRITE => &mut self.write,
            _ => unreachable!("FdContext::slot called with a non-singleton EventKind"),
        }
    }
}

/// The append-only, never-shrinking table of [`FdContext`]s indexed by fd;
/// grows to accommodate the largest fd seen and never shrinks.
struct FdTable {
    slots: Mutex<Vec<Option<Arc<Mutex<FdContext>>>>>,
}

impl FdTable {
    fn new() -> Self {
        FdTable {
            slots: Mutex::new(Vec::new()),
        }
    }

    fn get_or_create(&self, fd: RawFd) -> Arc<Mutex<FdContext>> {
        let idx = fd as usize;
        let mut slots = self.slots.lock().unwrap();
        if idx >= slots.len() {
            slots.resize_with(idx + 1, || None);
        }
        slots[idx]
            .get_or_insert_with(|| Arc::new(Mutex::new(FdContext::new())))
            .clone()
    }

    fn get(&self, fd: RawFd) -> Option<Arc<Mutex<FdContext>>> {
        let slots = self.slots.lock().unwrap();
        slots.get(idx_of(fd)).and_then(|s| s.clone())
    }
}

fn idx_of(fd: RawFd) -> usize {
    fd as usize
}

/// A held fiber's handle sits in an `EventContext` from registration until
/// it fires; since `resume` only accepts `Ready`/`Init`, it has to be
/// flipped back to `Ready` here, right before going back on a run queue.
/// A no-op for `Task::Callable`.
fn prepare_for_redispatch(task: &Task) {
    if let Task::Fiber(fb) = task {
        fb.mark_ready();
    }
}

struct IoManagerState {
    epoll: Epoll,
    wake: WakeFd,
    timers: TimerManager,
    fds: FdTable,
    pending_events: AtomicUsize,
    max_idle_timeout: Duration,
    event_batch: usize,
}

impl IoManagerState {
    /// Intersects observed readiness with the registered mask, unions in
    /// the registered mask on error/hangup, extracts and fires each
    /// matching kind's handler, and re-registers the residual mask with the
    /// kernel.
    fn handle_fd_readiness(&self, fd: RawFd, readiness: Readiness) {
        let Some(slot) = self.fds.get(fd) else {
            // Already torn down (race between del_event and epoll_wait
            // returning a stale event for it); nothing to do.
            return;
        };

        let mut fired = Vec::new();
        {
            let mut ctx = slot.lock().unwrap();
            let mut observed = EventKind::empty();
            if readiness.contains(Readiness::READ) {
                observed |= EventKind::READ;
            }
            if readiness.contains(Readiness::WRITE) {
                observed |= EventKind::WRITE;
            }
            if readiness.contains(Readiness::ERROR) {
                observed |= ctx.registered_mask;
            }
            let firing = observed & ctx.registered_mask;

            for kind in [EventKind::READ, EventKind::WRITE] {
                if firing.contains(kind) {
                    if let Some(ec) = ctx.slot(kind).take() {
                        ctx.registered_mask.remove(kind);
                        fired.push(ec);
                    }
                }
            }

            if ctx.registered_mask.is_empty() {
                let _ = self.epoll.remove(fd);
            } else if firing.intersects(EventKind::READ | EventKind::WRITE) {
                let _ = self.epoll.modify(fd, to_epoll_readiness(ctx.registered_mask));
            }
        }

        for ec in fired {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
            prepare_for_redispatch(&ec.task);
            if let Err(e) = ec.scheduler.schedule(ec.task, None) {
                log::warn!("io_manager: failed to reschedule handler for fd {fd}: {e}");
            }
        }
    }
}

/// The [`IdlePolicy`] that turns a plain [`Scheduler`] into an [`IoManager`].
struct EpollIdle {
    state: Arc<IoManagerState>,
}

impl std::fmt::Debug for EpollIdle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollIdle")
            .field("pending_events", &self.state.pending_events.load(Ordering::SeqCst))
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<IoManagerHandle>> = const { RefCell::new(None) };
}

impl IdlePolicy for EpollIdle {
    fn tickle(&self) {
        self.state.wake.wake();
    }

    fn on_worker_start(&self, _worker: WorkerId, sched: &SchedulerHandle) {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(IoManagerHandle {
                scheduler: sched.clone(),
                state: self.state.clone(),
            })
        });
    }

    fn on_worker_exit(&self, _worker: WorkerId, _sched: &SchedulerHandle) {
        CURRENT.with(|c| *c.borrow_mut() = None);
    }

    fn extra_stopping_satisfied(&self) -> bool {
        self.state.pending_events.load(Ordering::SeqCst) == 0 && self.state.timers.is_empty()
    }

    /// One readiness-wait iteration per call, always returning control to
    /// the dispatcher afterwards so freshly scheduled tasks (timer
    /// callables, woken fd handlers) get a chance to run before the next
    /// wait.
    fn idle(&self, _worker: WorkerId, sched: &SchedulerHandle) {
        let expired = self.state.timers.list_expired_callables();
        if !expired.is_empty() {
            for cb in expired {
                if let Err(e) = sched.schedule(Task::Callable(cb), None) {
                    log::warn!("io_manager: failed to schedule expired timer: {e}");
                }
            }
            return;
        }

        let budget_ms = self.wait_budget_ms();
        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; self.state.event_batch];
        let n = match self.state.epoll.wait(&mut buf, Some(budget_ms)) {
            Ok(n) => n,
            Err(e) => {
                log::error!("io_manager: epoll_wait failed: {e}");
                return;
            }
        };

        for raw in &buf[..n] {
            let (readiness, fd) = epoll::decode_event(raw);
            if fd == self.state.wake.as_raw_fd() {
                self.state.wake.drain();
                continue;
            }
            self.state.handle_fd_readiness(fd, readiness);
        }
    }
}

impl EpollIdle {
    /// `min(next_timer_timeout, max_idle_timeout)`, so the idle fiber always
    /// wakes periodically even with nothing registered.
    fn wait_budget_ms(&self) -> i32 {
        let next = self.state.timers.next_timeout().unwrap_or(self.state.max_idle_timeout);
        let capped = next.min(self.state.max_idle_timeout);
        capped.as_millis().min(i32::MAX as u128) as i32
    }
}

/// A lightweight, cloneable handle into a running [`IoManager`], the thing
/// `IoManager::current()` hands back and what [`crate::coio`]'s blocking
/// wrappers use to register events without holding a reference to the
/// owning `IoManager` itself.
#[derive(Clone)]
pub struct IoManagerHandle {
    scheduler: SchedulerHandle,
    state: Arc<IoManagerState>,
}

impl IoManagerHandle {
    pub fn schedule(&self, task: Task, pin: Option<WorkerId>) -> Result<()> {
        self.scheduler.schedule(task, pin)
    }

    pub fn pending_event_count(&self) -> usize {
        self.state.pending_events.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.scheduler.is_stopping()
    }

    /// Registers interest in `kind` on `fd`. `cb = None` means "the
    /// currently running fiber" — the blocking I/O idiom [`crate::coio`]
    /// builds on: register, then [`fiber::yield_now`].
    ///
    /// Fails with [`UsageError::EventAlreadyRegistered`] if `kind` is
    /// already registered on `fd`; re-adding is a caller mistake, not
    /// absorbed.
    pub fn add_event(&self, fd: RawFd, kind: EventKind, cb: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        let task = match cb {
            Some(f) => Task::Callable(f),
            None => Task::Fiber(Fiber::current()),
        };
        self.add_event_task(fd, kind, task)
    }

    fn add_event_task(&self, fd: RawFd, kind: EventKind, task: Task) -> Result<()> {
        let slot = self.state.fds.get_or_create(fd);
        let mut ctx = slot.lock().unwrap();
        if ctx.registered_mask.contains(kind) {
            return Err(UsageError::EventAlreadyRegistered { fd, kind }.into());
        }
        let was_empty = ctx.registered_mask.is_empty();
        ctx.registered_mask.insert(kind);
        *ctx.slot(kind) = Some(EventContext {
            scheduler: self.scheduler.clone(),
            task,
        });
        let new_mask = ctx.registered_mask;

        let ctl_result = if was_empty {
            self.state.epoll.add(fd, to_epoll_readiness(new_mask))
        } else {
            self.state.epoll.modify(fd, to_epoll_readiness(new_mask))
        };

        match ctl_result {
            Ok(()) => {
                drop(ctx);
                self.state.pending_events.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                // Registration never took effect; unwind the bookkeeping and
                // hand the syscall failure straight back to the caller
                // instead of pretending the event fired. The caller (still
                // running, not yet yielded) is the only safe place to retry.
                log::error!("io_manager: epoll_ctl failed registering fd {fd} for {kind:?}: {e}");
                ctx.slot(kind).take();
                ctx.registered_mask.remove(kind);
                Err(e.into())
            }
        }
    }

    /// Clears `kind` on `fd` without dispatching its handler.
    pub fn del_event(&self, fd: RawFd, kind: EventKind) {
        let Some(slot) = self.state.fds.get(fd) else {
            return;
        };
        let mut ctx = slot.lock().unwrap();
        let had = ctx.slot(kind).take().is_some();
        if !had {
            return;
        }
        ctx.registered_mask.remove(kind);
        if ctx.registered_mask.is_empty() {
            let _ = self.state.epoll.remove(fd);
        } else {
            let _ = self.state.epoll.modify(fd, to_epoll_readiness(ctx.registered_mask));
        }
        drop(ctx);
        self.state.pending_events.fetch_sub(1, Ordering::SeqCst);
    }

    /// As [`Self::del_event`], but dispatches the handler once so a fiber
    /// blocked on this event observes the cancellation.
    pub fn cancel_event(&self, fd: RawFd, kind: EventKind) {
        let Some(slot) = self.state.fds.get(fd) else {
            return;
        };
        let taken = {
            let mut ctx = slot.lock().unwrap();
            let ec = ctx.slot(kind).take();
            if ec.is_some() {
                ctx.registered_mask.remove(kind);
                if ctx.registered_mask.is_empty() {
                    let _ = self.state.epoll.remove(fd);
                } else {
                    let _ = self.state.epoll.modify(fd, to_epoll_readiness(ctx.registered_mask));
                }
            }
            ec
        };
        let Some(ec) = taken else {
            return;
        };
        self.state.pending_events.fetch_sub(1, Ordering::SeqCst);
        prepare_for_redispatch(&ec.task);
        if let Err(e) = ec.scheduler.schedule(ec.task, None) {
            log::warn!("io_manager: failed to reschedule cancelled fd {fd} handler: {e}");
        }
    }

    /// [`Self::cancel_event`] for every registered kind on `fd`.
    pub fn cancel_all(&self, fd: RawFd) {
        self.cancel_event(fd, EventKind::READ);
        self.cancel_event(fd, EventKind::WRITE);
    }

    pub fn add_timer(&self, delay: Duration, callable: impl FnMut() + Send + 'static, recurring: bool) -> TimerId {
        let (id, became_earliest) = self.state.timers.add_timer(delay, callable, recurring);
        if became_earliest {
            self.state.wake.wake();
        }
        id
    }

    pub fn add_condition_timer(
        &self,
        delay: Duration,
        callable: impl FnMut() + Send + 'static,
        condition: Arc<dyn WeakCondition>,
        recurring: bool,
    ) -> TimerId {
        let (id, became_earliest) = self.state.timers.add_condition_timer(delay, callable, condition, recurring);
        if became_earliest {
            self.state.wake.wake();
        }
        id
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.state.timers.cancel(id);
    }
}

/// An I/O-aware [`Scheduler`] whose idle wait is a kernel readiness
/// syscall.
pub struct IoManager {
    scheduler: Scheduler,
    state: Arc<IoManagerState>,
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("name", &self.scheduler.name())
            .field("pending_events", &self.pending_event_count())
            .finish()
    }
}

impl IoManager {
    /// Constructs (but does not [`Self::start`]) an `IoManager`: creates the
    /// epoll instance and self-wake eventfd and registers the latter for
    /// edge-triggered readable interest.
    pub fn new(config: IoManagerConfig) -> Result<Self> {
        let epoll = Epoll::new().map_err(crate::error::ResourceError::ReadinessHandle)?;
        let wake = WakeFd::new().map_err(crate::error::ResourceError::ReadinessHandle)?;
        epoll
            .add(wake.as_raw_fd(), Readiness::READ)
            .map_err(crate::error::ResourceError::ReadinessHandle)?;

        let state = Arc::new(IoManagerState {
            epoll,
            wake,
            timers: TimerManager::new(),
            fds: FdTable::new(),
            pending_events: AtomicUsize::new(0),
            max_idle_timeout: config.max_idle_timeout,
            event_batch: config.event_batch,
        });

        let policy = Box::new(EpollIdle { state: state.clone() });
        let scheduler = Scheduler::with_policy_and_stack_size(
            config.name,
            config.thread_count,
            config.use_caller,
            policy,
            config.stack_size,
        );

        Ok(IoManager { scheduler, state })
    }

    /// Returns a handle to the `IoManager` currently driving this thread, if
    /// any (set for the lifetime of a worker's dispatch loop, including the
    /// caller thread when `use_caller` is set).
    pub fn current() -> Option<IoManagerHandle> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn handle(&self) -> IoManagerHandle {
        IoManagerHandle {
            scheduler: self.scheduler.handle(),
            state: self.state.clone(),
        }
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    /// Runs this `IoManager`'s share of the dispatch loop on the calling
    /// thread; only valid when constructed with `use_caller = true`.
    pub fn run(&self) {
        self.scheduler.run()
    }

    pub fn stop(&self) {
        self.scheduler.stop()
    }

    pub fn tickle(&self) {
        self.scheduler.tickle()
    }

    pub fn schedule(&self, task: Task, pin: Option<WorkerId>) -> Result<()> {
        self.scheduler.schedule(task, pin)
    }

    pub fn add_event(&self, fd: RawFd, kind: EventKind, cb: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        self.handle().add_event(fd, kind, cb)
    }

    pub fn del_event(&self, fd: RawFd, kind: EventKind) {
        self.handle().del_event(fd, kind);
    }

    pub fn cancel_event(&self, fd: RawFd, kind: EventKind) {
        self.handle().cancel_event(fd, kind);
    }

    pub fn cancel_all(&self, fd: RawFd) {
        self.handle().cancel_all(fd);
    }

    pub fn add_timer(&self, delay: Duration, callable: impl FnMut() + Send + 'static, recurring: bool) -> TimerId {
        self.handle().add_timer(delay, callable, recurring)
    }

    pub fn add_condition_timer(
        &self,
        delay: Duration,
        callable: impl FnMut() + Send + 'static,
        condition: Arc<dyn WeakCondition>,
        recurring: bool,
    ) -> TimerId {
        self.handle().add_condition_timer(delay, callable, condition, recurring)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.state.timers.cancel(id);
    }

    pub fn pending_event_count(&self) -> usize {
        self.state.pending_events.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.scheduler.is_stopping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe {
            for fd in fds {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    #[test]
    fn double_registration_of_same_kind_is_usage_error() {
        let io = IoManager::new(IoManagerConfig::new("t1").thread_count(1)).unwrap();
        io.start().unwrap();
        let (read_fd, write_fd) = pipe();

        io.add_event(read_fd, EventKind::READ, Some(Box::new(|| {}))).unwrap();
        let err = io
            .add_event(read_fd, EventKind::READ, Some(Box::new(|| {})))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Usage(UsageError::EventAlreadyRegistered { kind: EventKind::READ, .. })
        ));

        io.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn readiness_fires_registered_callback_exactly_once() {
        let io = IoManager::new(IoManagerConfig::new("t2").thread_count(1)).unwrap();
        io.start().unwrap();
        let (read_fd, write_fd) = pipe();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        io.add_event(
            read_fd,
            EventKind::READ,
            Some(Box::new(move || {
                fired2.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        std::thread::sleep(StdDuration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(io.pending_event_count(), 0);

        io.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn cancel_event_wakes_the_handler_and_clears_the_registration() {
        let io = IoManager::new(IoManagerConfig::new("t3").thread_count(1)).unwrap();
        io.start().unwrap();
        let (read_fd, write_fd) = pipe();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        io.add_event(
            read_fd,
            EventKind::READ,
            Some(Box::new(move || {
                fired2.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();

        std::thread::sleep(StdDuration::from_millis(20));
        io.cancel_event(read_fd, EventKind::READ);
        std::thread::sleep(StdDuration::from_millis(50));

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(io.pending_event_count(), 0);

        // a second cancel is a no-op, not a double-fire.
        io.cancel_event(read_fd, EventKind::READ);

        io.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn timers_fire_through_the_same_run_queue() {
        let io = IoManager::new(IoManagerConfig::new("t4").thread_count(1)).unwrap();
        io.start().unwrap();

        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let a = order.clone();
        let b = order.clone();
        let c = order.clone();
        io.add_timer(StdDuration::from_millis(50), move || a.lock().unwrap().push("A"), false);
        io.add_timer(StdDuration::from_millis(50), move || b.lock().unwrap().push("B"), false);
        io.add_timer(StdDuration::from_millis(10), move || c.lock().unwrap().push("C"), false);

        std::thread::sleep(StdDuration::from_millis(150));
        io.stop();
        assert_eq!(*order.lock().unwrap(), vec!["C", "A", "B"]);
    }

    #[test]
    fn stop_drains_pending_timers_before_returning() {
        let io = IoManager::new(IoManagerConfig::new("t5").thread_count(1)).unwrap();
        io.start().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        io.add_timer(
            StdDuration::from_millis(100),
            move || ran2.store(true, Ordering::SeqCst),
            false,
        );

        let started = std::time::Instant::now();
        io.stop();
        assert!(started.elapsed() >= StdDuration::from_millis(90));
        assert!(ran.load(Ordering::SeqCst));
    }
}
