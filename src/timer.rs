//! A min-ordered set of pending timers keyed by absolute monotonic
//! deadline.
//!
//! Built from the idiomatic Rust min-heap pattern (`BinaryHeap` of a
//! `Reverse`-ordered key) plus the `Arc<Mutex<..>>` handle-sharing style
//! used throughout this crate's cross-thread state.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::clock::MonotonicClock;

/// A recurring timer's callable is invoked more than once, so it must be
/// `FnMut` rather than `FnOnce`; one-shot timers use the same type and are
/// simply never invoked a second time.
type Callable = Box<dyn FnMut() + Send>;

/// Opaque handle identifying a scheduled timer, used with
/// [`TimerManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

fn next_timer_id() -> TimerId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    TimerId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A trait object a timer can resolve on fire to decide whether it should
/// still run — the `weak_cond` parameter of
/// [`TimerManager::add_condition_timer`]. `upgrade` returns `false` when the
/// watched object is gone, in which case the callable is silently skipped.
pub trait WeakCondition: Send {
    fn upgrade(&self) -> bool;
}

impl<T: Send + Sync + 'static> WeakCondition for Weak<T> {
    fn upgrade(&self) -> bool {
        Weak::upgrade(self).is_some()
    }
}

struct Entry {
    id: TimerId,
    deadline_ns: u64,
    period_ns: u64,
    cancelled: bool,
    condition: Option<Arc<dyn WeakCondition>>,
    callable: Arc<Mutex<Callable>>,
}

/// Ordered purely by `(deadline_ns, seq)`; `seq` breaks ties by insertion
/// order so equal deadlines fire in the order they were scheduled.
#[derive(PartialEq, Eq)]
struct OrderKey {
    deadline_ns: u64,
    seq: u64,
    id: TimerId,
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline_ns, self.seq).cmp(&(other.deadline_ns, other.seq))
    }
}

struct State {
    clock: MonotonicClock,
    heap: BinaryHeap<Reverse<OrderKey>>,
    entries: std::collections::HashMap<u64, Entry>,
    next_seq: u64,
}

/// Deadline-ordered set of pending timed callables, shared by `Arc` between
/// [`crate::io_manager::IOManager`] and the `Timer` handles it hands out.
#[derive(Clone)]
pub struct TimerManager {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("TimerManager")
            .field("pending", &state.entries.len())
            .finish()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            state: Arc::new(Mutex::new(State {
                clock: MonotonicClock::new(),
                heap: BinaryHeap::new(),
                entries: std::collections::HashMap::new(),
                next_seq: 0,
            })),
        }
    }

    /// Inserts a timer firing `delay` from now (and every `delay` again, if
    /// `recurring`). Returns the handle and whether it became the new
    /// earliest deadline (the caller, typically an `IOManager`, uses this
    /// to shorten its current idle-wait budget).
    pub fn add_timer(
        &self,
        delay: Duration,
        callable: impl FnMut() + Send + 'static,
        recurring: bool,
    ) -> (TimerId, bool) {
        self.insert(delay, Arc::new(Mutex::new(Box::new(callable))), recurring, None)
    }

    /// Like [`Self::add_timer`], but on fire first resolves `condition`; if
    /// it no longer holds, the callable is silently skipped rather than
    /// invoked. Used to avoid running handlers against torn-down objects.
    pub fn add_condition_timer(
        &self,
        delay: Duration,
        callable: impl FnMut() + Send + 'static,
        condition: Arc<dyn WeakCondition>,
        recurring: bool,
    ) -> (TimerId, bool) {
        self.insert(
            delay,
            Arc::new(Mutex::new(Box::new(callable))),
            recurring,
            Some(condition),
        )
    }

    fn insert(
        &self,
        delay: Duration,
        callable: Arc<Mutex<Callable>>,
        recurring: bool,
        condition: Option<Arc<dyn WeakCondition>>,
    ) -> (TimerId, bool) {
        let mut state = self.state.lock().unwrap();
        let now_ns = state.clock.now().now_ns;
        let deadline_ns = now_ns + delay.as_nanos() as u64;
        let id = next_timer_id();
        let seq = state.next_seq;
        state.next_seq += 1;

        let became_earliest = state
            .heap
            .peek()
            .map(|Reverse(k)| deadline_ns < k.deadline_ns)
            .unwrap_or(true);

        state.heap.push(Reverse(OrderKey { deadline_ns, seq, id }));
        state.entries.insert(
            id.0,
            Entry {
                id,
                deadline_ns,
                period_ns: if recurring { delay.as_nanos() as u64 } else { 0 },
                cancelled: false,
                condition,
                callable,
            },
        );
        (id, became_earliest)
    }

    /// Removes a pending timer. Idempotent: cancelling an already-fired or
    /// already-cancelled timer is a no-op.
    pub fn cancel(&self, id: TimerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(&id.0) {
            entry.cancelled = true;
        }
    }

    /// Drains every timer whose deadline is `<= now`, re-inserting
    /// recurring ones with `deadline += period`, and returns their
    /// callables (each invokable exactly once, even for a recurring timer's
    /// shared closure) in deadline order, ties broken by insertion order.
    /// The manager's lock is released before the caller runs any of them.
    ///
    /// If the clock reports a coarse rollback, every still-pending timer is
    /// treated as expired exactly once.
    pub fn list_expired_callables(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut state = self.state.lock().unwrap();
        let reading = state.clock.now();
        let now_ns = reading.now_ns;

        if reading.rolled_back {
            log::warn!("monotonic clock rolled back by more than an hour; expiring all pending timers");
            let ids: Vec<u64> = state.entries.keys().copied().collect();
            state.heap.clear();
            let mut out = Vec::new();
            for key in ids {
                if let Some(entry) = state.entries.remove(&key) {
                    if !entry.cancelled {
                        push_resolved(&mut out, &entry);
                    }
                }
            }
            return out;
        }

        let mut out = Vec::new();
        loop {
            let ready = match state.heap.peek() {
                Some(Reverse(k)) => k.deadline_ns <= now_ns,
                None => false,
            };
            if !ready {
                break;
            }
            let Reverse(key) = state.heap.pop().unwrap();
            let Some(entry) = state.entries.remove(&key.id.0) else {
                continue; // cancelled and already removed
            };
            if entry.cancelled {
                continue;
            }

            if !entry.cancelled {
                push_resolved(&mut out, &entry);
            }

            if entry.period_ns > 0 {
                let seq = state.next_seq;
                state.next_seq += 1;
                let next_deadline = entry.deadline_ns + entry.period_ns;
                let id = entry.id;
                state.heap.push(Reverse(OrderKey {
                    deadline_ns: next_deadline,
                    seq,
                    id,
                }));
                state.entries.insert(
                    id.0,
                    Entry {
                        id,
                        deadline_ns: next_deadline,
                        period_ns: entry.period_ns,
                        cancelled: false,
                        condition: entry.condition.clone(),
                        callable: entry.callable.clone(),
                    },
                );
            }
        }
        out
    }

    /// Milliseconds until the earliest pending deadline, or `None` if no
    /// timer is pending.
    pub fn next_timeout(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let entry = state.heap.peek()?;
        let now_ns = state.clock.now().now_ns;
        let delta = entry.0.deadline_ns.saturating_sub(now_ns);
        Some(Duration::from_nanos(delta))
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

fn push_resolved(out: &mut Vec<Box<dyn FnOnce() + Send>>, entry: &Entry) {
    if let Some(cond) = &entry.condition {
        if !cond.upgrade() {
            return;
        }
    }
    let callable = entry.callable.clone();
    out.push(Box::new(move || {
        (callable.lock().unwrap())();
    }));
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use std::thread::sleep;

    #[test]
    fn timers_fire_in_deadline_order_ties_by_insertion() {
        let mgr = TimerManager::new();
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let push = |mgr: &TimerManager, order: &Arc<StdMutex<Vec<&'static str>>>, delay_ms, label| {
            let order = order.clone();
            mgr.add_timer(
                Duration::from_millis(delay_ms),
                move || order.lock().unwrap().push(label),
                false,
            );
        };
        push(&mgr, &order, 50, "A");
        push(&mgr, &order, 50, "B");
        push(&mgr, &order, 10, "C");

        sleep(Duration::from_millis(60));
        for mut cb in mgr.list_expired_callables() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!["C", "A", "B"]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mgr = TimerManager::new();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let (id, _) = mgr.add_timer(
            Duration::from_millis(10),
            move || {
                ran2.store(true, Ordering::SeqCst);
            },
            false,
        );
        mgr.cancel(id);
        sleep(Duration::from_millis(20));
        for mut cb in mgr.list_expired_callables() {
            cb();
        }
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn double_cancel_is_a_no_op() {
        let mgr = TimerManager::new();
        let (id, _) = mgr.add_timer(Duration::from_millis(10), || {}, false);
        mgr.cancel(id);
        mgr.cancel(id); // must not panic
    }

    #[test]
    fn next_timeout_reflects_earliest_deadline() {
        let mgr = TimerManager::new();
        assert!(mgr.next_timeout().is_none());
        mgr.add_timer(Duration::from_millis(100), || {}, false);
        let to = mgr.next_timeout().unwrap();
        assert!(to <= Duration::from_millis(100));
    }

    #[test]
    fn recurring_timer_reinserts_with_incremented_deadline() {
        let mgr = TimerManager::new();
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count2 = count.clone();
        mgr.add_timer(
            Duration::from_millis(5),
            move || {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        sleep(Duration::from_millis(10));
        for mut cb in mgr.list_expired_callables() {
            cb();
        }
        assert_eq!(mgr.pending_count(), 1, "recurring timer stays pending after firing once");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
