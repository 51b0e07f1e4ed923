//! Logging conventions.
//!
//! This crate logs exclusively through the [`log`](https://docs.rs/log)
//! facade — `log::{trace,debug,info,warn,error}` — and never prints
//! directly. There is no crate-provided `Log` implementation to register:
//! callers pick whichever `log` backend suits their application. This
//! crate's own demos and tests use `env_logger` (a `[dev-dependencies]`
//! only, not part of the published API surface) — the conventional pairing
//! for bare `log`-facade libraries.
//!
//! Levels, as used across [`crate::scheduler`], [`crate::io_manager`] and
//! [`crate::timer`]:
//!
//! - `error!`/`warn!` — scheduler lifecycle failures, fiber panics, fd
//!   registration errors that had to be absorbed rather than surfaced.
//! - `debug!` — worker thread start/exit, scheduler start/stop.
//! - `trace!` — per-iteration dispatch-loop and timer-firing detail, too
//!   noisy to enable outside of debugging a hang.
