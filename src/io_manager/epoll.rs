//! Thin safe wrappers over the Linux readiness-notification syscalls.
//!
//! Needs add/mod/del of per-fd interest masks, edge-triggered delivery, a
//! blocking wait with millisecond timeout, and thread-safe mutation
//! concurrent with a wait in progress — this is the `epoll` implementation
//! of that contract, in the same raw-`libc`-syscall style used elsewhere in
//! this crate for `mmap`/`mprotect`: a direct `libc::` call checked against
//! `-1`/`MAP_FAILED`, never a `nix`/`epoll`-crate abstraction layered on
//! top.

use std::io;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

bitflags! {
    /// Interest/readiness bits, independent of the kernel's own `EPOLL*`
    /// constants so callers never need `libc` in scope.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u32 {
        const READ  = 0b001;
        const WRITE = 0b010;
        /// Error or hang-up; unioned into whatever kinds are currently
        /// registered so a blocked waiter can observe it.
        const ERROR = 0b100;
    }
}

impl Readiness {
    fn to_epoll_bits(self) -> u32 {
        let mut bits = libc::EPOLLET as u32;
        if self.contains(Readiness::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Readiness::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn from_epoll_bits(bits: u32) -> Self {
        let mut out = Readiness::empty();
        if bits & (libc::EPOLLIN as u32) != 0 {
            out |= Readiness::READ;
        }
        if bits & (libc::EPOLLOUT as u32) != 0 {
            out |= Readiness::WRITE;
        }
        if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            out |= Readiness::ERROR;
        }
        out
    }
}

/// An open `epoll` instance.
#[derive(Debug)]
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        // SAFETY: no preconditions beyond a valid flags value.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll { fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Readiness>) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.map(Readiness::to_epoll_bits).unwrap_or(0),
            u64: fd as u64,
        };
        // SAFETY: `event` is a valid, fully initialized `epoll_event`; `self.fd`
        // is a live epoll instance for the duration of this call.
        let rc = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    pub fn modify(&self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Blocks until at least one registered fd is ready, `timeout_ms`
    /// elapses (`None` means forever), or the call is interrupted by a
    /// signal (returned as `Ok(vec![])`, not an error — the caller retries
    /// with a freshly recomputed budget).
    pub fn wait(&self, buf: &mut [libc::epoll_event], timeout_ms: Option<i32>) -> io::Result<usize> {
        let timeout = timeout_ms.unwrap_or(-1);
        // SAFETY: `buf` is a valid, writable slice of `epoll_event`s for the
        // duration of the call; its length fits in `c_int` (a caller-sized
        // batch, typically 64-256 slots).
        let rc = unsafe { libc::epoll_wait(self.fd, buf.as_mut_ptr(), buf.len() as libc::c_int, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Returns `(readiness, fd)` for one entry returned by [`Epoll::wait`].
pub fn decode_event(event: &libc::epoll_event) -> (Readiness, RawFd) {
    (Readiness::from_epoll_bits(event.events), event.u64 as RawFd)
}

/// A self-wake descriptor: an `eventfd` registered for edge-triggered
/// readable interest, written to from [`super::IoManager::tickle`] to break
/// a blocking `epoll_wait` from another thread.
#[derive(Debug)]
pub struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    pub fn new() -> io::Result<Self> {
        // SAFETY: no preconditions beyond valid flags.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeFd { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Writes one "tickle" to the eventfd counter.
    pub fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: `&one` is a valid 8-byte buffer; the eventfd counter add
        // can only fail with EAGAIN (counter would overflow) which we
        // deliberately ignore — the waiter only needs to observe *a*
        // pending wake, not count them precisely.
        unsafe {
            libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Drains the eventfd counter to zero. Stops at the first `EAGAIN`.
    pub fn drain(&self) {
        let mut buf: u64 = 0;
        loop {
            // SAFETY: `&mut buf` is a valid 8-byte out-buffer.
            let rc = unsafe { libc::read(self.fd, &mut buf as *mut u64 as *mut libc::c_void, 8) };
            if rc < 0 {
                break;
            }
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_fd_drain_is_idempotent_after_empty() {
        let wake = WakeFd::new().unwrap();
        wake.drain();
        wake.drain();
    }

    #[test]
    fn epoll_add_wait_remove_round_trip_on_a_pipe() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let epoll = Epoll::new().unwrap();
        epoll.add(read_fd, Readiness::READ).unwrap();

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = epoll.wait(&mut buf, Some(1000)).unwrap();
        assert_eq!(n, 1);
        let (readiness, fd) = decode_event(&buf[0]);
        assert!(readiness.contains(Readiness::READ));
        assert_eq!(fd, read_fd);

        epoll.remove(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
