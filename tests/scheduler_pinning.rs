//! Integration coverage for a two-worker scheduler's pin-aware dispatch: an
//! unpinned task queued behind a pinned one must not wait behind it when its
//! target worker is busy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fiberio::scheduler::{Scheduler, Task, WorkerId};
use pretty_assertions::assert_eq;

#[test]
fn unpinned_task_overtakes_a_pinned_task_whose_worker_is_busy() {
    let sched = Scheduler::new("s4", 2, false);
    sched.start().unwrap();

    let busy_gate = Arc::new(AtomicBool::new(true));
    let gate = busy_gate.clone();
    // Occupies worker 0 until released, so the pinned task behind it can't
    // start.
    sched
        .schedule(
            Task::Callable(Box::new(move || {
                while gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
            })),
            Some(WorkerId(0)),
        )
        .unwrap();
    // Let the busy task actually claim worker 0 before we enqueue behind it.
    std::thread::sleep(Duration::from_millis(20));

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let pinned_order = order.clone();
    sched
        .schedule(
            Task::Callable(Box::new(move || pinned_order.lock().unwrap().push("pinned"))),
            Some(WorkerId(0)),
        )
        .unwrap();

    let unpinned_order = order.clone();
    sched
        .schedule(
            Task::Callable(Box::new(move || unpinned_order.lock().unwrap().push("unpinned"))),
            None,
        )
        .unwrap();

    // The unpinned task should complete on worker 1 well before worker 0 is
    // released.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*order.lock().unwrap(), vec!["unpinned"]);

    busy_gate.store(false, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    sched.stop();
    assert_eq!(*order.lock().unwrap(), vec!["unpinned", "pinned"]);
}
