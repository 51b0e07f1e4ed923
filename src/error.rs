//! Error handling utils.
//!
//! Every fallible entry point in this crate returns a [`Result<T>`], backed
//! by a single crate-wide [`Error`] enum. The taxonomy follows the three
//! buckets from the scheduler's failure model:
//!
//! - [`Error::Usage`] — a caller mistake (double-registering an event,
//!   resetting a fiber that hasn't terminated, scheduling onto a stopped
//!   scheduler). Surfaced synchronously, never retried.
//! - [`Error::ResourceExhausted`] — allocation of some OS resource failed
//!   (a fiber stack, an epoll instance, a worker thread). Fatal to whatever
//!   was being constructed.
//! - [`Error::Io`] — an underlying syscall failed in a way that isn't
//!   bind/listen/accept paths and event registration.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases produced by this crate's scheduler, timer and
/// I/O manager.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller-side usage mistake. Not retried; surfaced at the call site.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// Allocating some OS-backed resource failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] ResourceError),

    /// An I/O syscall failed in a way that must be surfaced rather than
    /// absorbed (bind/listen/accept paths, not per-event epoll bookkeeping).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// This should only be used if the error doesn't fall into one of the
    /// above categories, e.g. an error propagated out of a user callback.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// See [`Error::Usage`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum UsageError {
    /// `addEvent(fd, kind, ..)` was called while that (fd, kind) pair
    /// already has a registered handler.
    #[error("fd {fd} already has a handler registered for {kind:?}")]
    EventAlreadyRegistered { fd: std::os::unix::io::RawFd, kind: crate::io_manager::EventKind },

    /// `reset()` was called on a fiber that is not in the `Term` or `Except`
    /// state.
    #[error("cannot reset a fiber that hasn't terminated (status: {status:?})")]
    FiberNotTerminated { status: crate::fiber::Status },

    /// `schedule()` or `start()` was called on a scheduler that has already
    /// been stopped.
    #[error("scheduler {name:?} has been stopped and cannot accept more work")]
    SchedulerStopped { name: String },
}

/// See [`Error::ResourceExhausted`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// `mmap` for a fiber's stack failed.
    #[error("failed to allocate a {size}-byte fiber stack: {source}")]
    StackAllocation { size: usize, source: io::Error },

    /// `mprotect` of the stack's guard page failed.
    #[error("failed to protect fiber stack guard page: {0}")]
    GuardPage(io::Error),

    /// `epoll_create1`/`eventfd` failed while constructing an [`IOManager`](crate::io_manager::IOManager).
    #[error("failed to create readiness-notification handle: {0}")]
    ReadinessHandle(io::Error),

    /// Spawning a worker OS thread failed.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(io::Error),
}

const _: () = {
    fn assert_error_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<Error>();
    }
};
