//! Programmatic configuration for [`crate::scheduler::Scheduler`] and
//! [`crate::io_manager::IoManager`].
//!
//! There is no on-disk config format; this is the ambient surface every
//! Rust runtime of this shape exposes instead — builder structs with
//! `Default` impls pinned to sensible runtime defaults (128 KiB stack, 3 s
//! max idle-wait, a 64-256 slot event batch), generalizing the
//! `fiber::Builder`-style configuration-object pattern up to the
//! scheduler/io-manager level.

use std::time::Duration;

use crate::fiber::DEFAULT_STACK_SIZE;

/// Configuration for a plain [`crate::scheduler::Scheduler`] (no I/O).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub name: String,
    pub thread_count: usize,
    /// Whether the thread that constructs the scheduler also runs a
    /// worker's dispatch loop (via [`crate::scheduler::Scheduler::run`]).
    pub use_caller: bool,
    /// Stack size used for fibers spawned around bare callables at
    /// dispatch time.
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            name: "scheduler".to_string(),
            thread_count: 1,
            use_caller: true,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl SchedulerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        SchedulerConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn use_caller(mut self, yes: bool) -> Self {
        self.use_caller = yes;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }
}

/// [`MAX_TIMEOUT`](IoManagerConfig::max_idle_timeout) default: the bound
/// that guarantees periodic housekeeping wake-ups even with no fds or
/// timers registered.
pub const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default size of the `epoll_wait` events buffer.
pub const DEFAULT_EVENT_BATCH: usize = 64;

/// Configuration for an [`crate::io_manager::IoManager`].
#[derive(Debug, Clone)]
pub struct IoManagerConfig {
    pub name: String,
    pub thread_count: usize,
    pub use_caller: bool,
    pub stack_size: usize,
    /// Upper bound on the idle fiber's `epoll_wait` timeout, regardless of
    /// how far away the next timer deadline is.
    pub max_idle_timeout: Duration,
    /// Number of `epoll_event` slots polled per `epoll_wait` call.
    pub event_batch: usize,
}

impl Default for IoManagerConfig {
    fn default() -> Self {
        IoManagerConfig {
            name: "io".to_string(),
            thread_count: 1,
            use_caller: true,
            stack_size: DEFAULT_STACK_SIZE,
            max_idle_timeout: DEFAULT_MAX_IDLE_TIMEOUT,
            event_batch: DEFAULT_EVENT_BATCH,
        }
    }
}

impl IoManagerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        IoManagerConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn use_caller(mut self, yes: bool) -> Self {
        self.use_caller = yes;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn event_batch(mut self, n: usize) -> Self {
        self.event_batch = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_defaults_match_spec() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.stack_size, 128 * 1024);
        assert_eq!(cfg.thread_count, 1);
        assert!(cfg.use_caller);
    }

    #[test]
    fn io_manager_config_defaults_match_spec() {
        let cfg = IoManagerConfig::default();
        assert_eq!(cfg.max_idle_timeout, Duration::from_secs(3));
        assert_eq!(cfg.event_batch, 64);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let cfg = IoManagerConfig::new("custom")
            .thread_count(4)
            .use_caller(false)
            .event_batch(256)
            .max_idle_timeout(Duration::from_millis(500));
        assert_eq!(cfg.name, "custom");
        assert_eq!(cfg.thread_count, 4);
        assert!(!cfg.use_caller);
        assert_eq!(cfg.event_batch, 256);
        assert_eq!(cfg.max_idle_timeout, Duration::from_millis(500));
    }
}
