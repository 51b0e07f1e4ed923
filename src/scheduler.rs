//! The M:N multiplexer: a pool of worker threads draining a shared run
//! queue of [`Task`]s, each either a live [`Fiber`] or a bare callable to be
//! wrapped into one on first dispatch.
//!
//! [`Scheduler`] implements the base policy (idle-wait on a condition
//! variable); [`crate::io_manager::IOManager`] is a `Scheduler` composed
//! with a different [`IdlePolicy`] that waits on a readiness syscall
//! instead — composition standing in for the inheritance a C++ version of
//! this design would reach for, built from the `Arc<Mutex<..>>` + `Condvar`
//! idiom used throughout this crate's cross-thread primitives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::config::SchedulerConfig;
use crate::error::{Result, ResourceError, UsageError};
use crate::fiber::{self, Fiber, Status};

/// Identifies one of a scheduler's worker slots (`0..thread_count`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId(pub usize);

/// A unit of work on the run queue: either a live fiber being rescheduled,
/// or a bare callable to be spawned into a fresh one at dispatch time (so
/// cancelling a task before it ever runs doesn't cost a stack allocation).
pub enum Task {
    Fiber(Fiber),
    Callable(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Fiber(fb) => f.debug_tuple("Task::Fiber").field(fb).finish(),
            Task::Callable(_) => f.write_str("Task::Callable(..)"),
        }
    }
}

struct QueueEntry {
    task: Task,
    pin: Option<usize>,
}

/// Overrides the base scheduler's idle behavior. [`crate::io_manager`]'s
/// `EpollIdle` is the interesting implementation; [`CondvarIdle`] is the
/// default used by a plain [`Scheduler`].
pub(crate) trait IdlePolicy: Send + Sync + std::fmt::Debug {
    /// Wakes at least one idle worker, if any exists.
    fn tickle(&self);
    /// Called by a worker with no runnable task. May block.
    fn idle(&self, worker: WorkerId, sched: &SchedulerHandle);
    /// Additional predicate `stopping()` requires besides "queue empty, no
    /// task active". The base policy has none.
    fn extra_stopping_satisfied(&self) -> bool {
        true
    }
    /// Called once on each worker thread (including the caller thread, if
    /// `use_caller`) before its dispatch loop starts. `IOManager` uses this
    /// to populate the thread-local "current IO manager" pointer. Takes the
    /// worker's own [`SchedulerHandle`] so the policy can stash it (e.g. so
    /// `IOManager::current()` can schedule tasks) without the policy itself
    /// needing to own one permanently.
    fn on_worker_start(&self, _worker: WorkerId, _sched: &SchedulerHandle) {}
    /// Called once as a worker thread's dispatch loop exits.
    fn on_worker_exit(&self, _worker: WorkerId, _sched: &SchedulerHandle) {}
}

/// The default [`IdlePolicy`]: block on a condition variable until tickled
/// or until stopping.
#[derive(Debug, Default)]
pub(crate) struct CondvarIdle {
    condvar: Condvar,
}

impl IdlePolicy for CondvarIdle {
    fn tickle(&self) {
        self.condvar.notify_one();
    }

    fn idle(&self, _worker: WorkerId, sched: &SchedulerHandle) {
        let guard = sched.shared.queue.lock().unwrap();
        let _guard = self
            .condvar
            .wait_while(guard, |q| {
                q.is_empty() && !sched.shared.stopping.load(Ordering::SeqCst)
            })
            .unwrap();
    }
}

struct Shared {
    name: String,
    queue: Mutex<VecDeque<QueueEntry>>,
    running: AtomicBool,
    ever_started: AtomicBool,
    stopping: AtomicBool,
    active: AtomicUsize,
    thread_count: usize,
    use_caller: bool,
    policy: Box<dyn IdlePolicy>,
    /// Stack size used when a bare [`Task::Callable`] is wrapped into a
    /// fresh [`Fiber`] at dispatch time. Defaults to
    /// [`fiber::DEFAULT_STACK_SIZE`]; `IOManager` configures this from
    /// [`crate::config::IoManagerConfig::stack_size`].
    stack_size: usize,
}

/// A lightweight, cloneable handle into a running [`Scheduler`], passed to
/// [`IdlePolicy`] methods so they can enqueue work without owning the
/// scheduler themselves.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Appends `task` to the run queue, optionally pinned to a specific
    /// worker. If the queue was empty, tickles one idle worker.
    pub fn schedule(&self, task: Task, pin: Option<WorkerId>) -> Result<()> {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(UsageError::SchedulerStopped {
                name: self.shared.name.clone(),
            }
            .into());
        }
        let became_nonempty = {
            let mut q = self.shared.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(QueueEntry {
                task,
                pin: pin.map(|w| w.0),
            });
            was_empty
        };
        if became_nonempty {
            self.shared.policy.tickle();
        }
        Ok(())
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    pub fn pending_task_count(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }
}

/// Owns the worker pool and the shared run queue.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.shared.name)
            .field("thread_count", &self.shared.thread_count)
            .field("use_caller", &self.shared.use_caller)
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Scheduler {
    /// Creates but does not start a scheduler with `thread_count` workers
    /// (including the caller, if `use_caller`). Shorthand for
    /// [`Self::with_config`] with every other field left at its default.
    pub fn new(name: impl Into<String>, thread_count: usize, use_caller: bool) -> Self {
        Self::with_config(SchedulerConfig {
            name: name.into(),
            thread_count,
            use_caller,
            ..SchedulerConfig::default()
        })
    }

    /// Creates but does not start a scheduler from a [`SchedulerConfig`].
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_policy_and_stack_size(
            config.name,
            config.thread_count,
            config.use_caller,
            Box::new(CondvarIdle::default()),
            config.stack_size,
        )
    }

    pub(crate) fn with_policy_and_stack_size(
        name: impl Into<String>,
        thread_count: usize,
        use_caller: bool,
        policy: Box<dyn IdlePolicy>,
        stack_size: usize,
    ) -> Self {
        assert!(thread_count > 0, "a scheduler needs at least one worker");
        Scheduler {
            shared: Arc::new(Shared {
                name: name.into(),
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                ever_started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                thread_count,
                use_caller,
                policy,
                stack_size,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Appends a task to the run queue. See [`SchedulerHandle::schedule`].
    pub fn schedule(&self, task: Task, pin: Option<WorkerId>) -> Result<()> {
        self.handle().schedule(task, pin)
    }

    /// Wakes at least one idle worker, if any exists.
    pub fn tickle(&self) {
        self.shared.policy.tickle();
    }

    /// Spawns `thread_count - use_caller` worker threads. Idempotent while
    /// already running; fails if this scheduler was previously stopped.
    pub fn start(&self) -> Result<()> {
        if self.shared.ever_started.load(Ordering::SeqCst) && !self.shared.running.load(Ordering::SeqCst) {
            return Err(UsageError::SchedulerStopped {
                name: self.shared.name.clone(),
            }
            .into());
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // idempotent
        }
        self.shared.ever_started.store(true, Ordering::SeqCst);

        let spawn_count = self.shared.thread_count - usize::from(self.shared.use_caller);
        let caller_slot = usize::from(self.shared.use_caller);
        let mut workers = self.workers.lock().unwrap();
        for i in 0..spawn_count {
            let worker_id = caller_slot + i;
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{worker_id}", self.shared.name))
                .spawn(move || dispatch_loop(shared, worker_id))
                .map_err(ResourceError::ThreadSpawn)?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Runs the dispatch loop for worker slot 0 on the calling thread.
    /// Only meaningful when constructed with `use_caller = true`; blocks
    /// until [`Self::stop`] is called (from elsewhere) and the scheduler
    /// drains.
    pub fn run(&self) {
        assert!(
            self.shared.use_caller,
            "Scheduler::run is only for schedulers constructed with use_caller = true"
        );
        dispatch_loop(self.shared.clone(), 0);
    }

    /// Requests shutdown: sets the stopping flag, wakes idle workers, and
    /// joins every spawned worker thread. Does not forcibly terminate
    /// running fibers; waits for the queue and any pending external events
    /// to drain (see [`crate::io_manager::IOManager`]'s `extra_stopping`).
    /// After this returns, [`Self::start`] may not be called again.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.policy.tickle();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    pub fn pending_task_count(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }
}

/// Front-to-back scan for the first task whose pin matches `worker` or is
/// unpinned. Tickles once, best-effort, if a task
/// pinned to some other worker was skipped over — with a single shared
/// wake primitive per scheduler there's no way to target that specific
/// peer, so this is a nudge rather than a guarantee.
fn try_take_task(shared: &Shared, worker: usize) -> Option<Task> {
    let mut q = shared.queue.lock().unwrap();
    let mut found_idx = None;
    let mut saw_other_pin = false;
    for (i, entry) in q.iter().enumerate() {
        match entry.pin {
            None => {
                found_idx = Some(i);
                break;
            }
            Some(p) if p == worker => {
                found_idx = Some(i);
                break;
            }
            Some(_) => saw_other_pin = true,
        }
    }
    let task = found_idx.map(|i| q.remove(i).unwrap().task);
    drop(q);
    if task.is_none() && saw_other_pin {
        shared.policy.tickle();
    }
    task
}

fn is_done(shared: &Shared) -> bool {
    shared.stopping.load(Ordering::SeqCst)
        && shared.queue.lock().unwrap().is_empty()
        && shared.active.load(Ordering::SeqCst) == 0
        && shared.policy.extra_stopping_satisfied()
}

fn dispatch_loop(shared: Arc<Shared>, worker: usize) {
    log::debug!("scheduler {:?} worker {worker} starting", shared.name);
    let sched = SchedulerHandle {
        shared: shared.clone(),
    };
    shared.policy.on_worker_start(WorkerId(worker), &sched);
    loop {
        if let Some(task) = try_take_task(&shared, worker) {
            shared.active.fetch_add(1, Ordering::SeqCst);
            run_task(task, &shared, worker);
            shared.active.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        if is_done(&shared) {
            break;
        }

        shared.policy.idle(WorkerId(worker), &sched);
    }
    shared.policy.on_worker_exit(WorkerId(worker), &sched);
    log::debug!("scheduler {:?} worker {worker} exiting", shared.name);
}

fn run_task(task: Task, shared: &Arc<Shared>, worker: usize) {
    let fiber = match task {
        Task::Fiber(fb) => fb,
        Task::Callable(f) => match fiber::Builder::new().stack_size(shared.stack_size).spawn(f) {
            Ok(fb) => fb,
            Err(e) => {
                log::error!("scheduler {:?}: failed to spawn fiber for task: {e}", shared.name);
                return;
            }
        },
    };

    let status = fiber.resume();
    match status {
        Status::Ready => {
            let sched = SchedulerHandle {
                shared: shared.clone(),
            };
            if let Err(e) = sched.schedule(Task::Fiber(fiber), Some(WorkerId(worker))) {
                log::warn!("scheduler {:?}: dropping re-ready fiber: {e}", shared.name);
            }
        }
        Status::Hold => {
            // Whoever put this fiber on Hold (a timer, an I/O registration)
            // retains its own clone of the handle and will re-enqueue it.
        }
        Status::Term | Status::Except => {
            // Dropped; its stack is freed when the last handle goes away.
        }
        Status::Init | Status::Running => {
            unreachable!("Fiber::resume never returns Init/Running as the post-status")
        }
    }
}
