//! Epoll echo server: `watch_io_read` registers `test_accept` on the
//! listening fd; `test_accept` accepts one connection, registers a
//! per-connection read/echo closure, then re-registers itself before
//! returning (so the accept loop survives across fiber suspensions instead
//! of looping in place).
//!
//! `n == 0` from `recv` is always treated as EOF, regardless of `errno` — a
//! half-closed peer must close the connection, not spin retrying the read.

use std::io::ErrorKind;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;

use fiberio::config::IoManagerConfig;
use fiberio::io_manager::{EventKind, IoManager};

const PORT: u16 = 8080;

fn main() {
    env_logger::init();

    let listener = TcpListener::bind(("0.0.0.0", PORT)).expect("bind listening socket");
    listener.set_nonblocking(true).expect("set listener non-blocking");
    let listen_fd = listener.as_raw_fd();
    println!("epoll echo server listening for connections on port: {PORT}");

    let io = IoManager::new(IoManagerConfig::new("echo").thread_count(1).use_caller(true))
        .expect("construct io manager");
    io.start().expect("start io manager");

    watch_io_read(&io, &listener, listen_fd);

    // `use_caller(true)` means the calling thread *is* worker 0; this blocks
    // here running the dispatch loop until something calls `io.stop()`
    // (nothing in this demo does, matching the original's run-forever
    // server).
    io.run();
}

/// Registers interest in the listening socket becoming acceptable, arming
/// [`test_accept`] as the handler.
fn watch_io_read(io: &IoManager, listener: &TcpListener, listen_fd: i32) {
    let io2 = io.handle();
    let listener = listener.try_clone().expect("clone listener handle");
    io.add_event(
        listen_fd,
        EventKind::READ,
        Some(Box::new(move || test_accept(io2, listener))),
    )
    .expect("register listening socket");
}

/// Accepts one connection, wires up its echo loop, then re-arms the accept
/// watch for the next one.
fn test_accept(io: fiberio::io_manager::IoManagerHandle, listener: TcpListener) {
    match listener.accept() {
        Ok((conn, peer)) => {
            conn.set_nonblocking(true).expect("set connection non-blocking");
            log::info!("accepted connection from {peer}");
            let fd = conn.as_raw_fd();
            let io3 = io.clone();
            io.add_event(fd, EventKind::READ, Some(Box::new(move || echo_loop(io3, conn))))
                .expect("register connection socket");
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            // Spurious wakeup (another fiber won the race to accept());
            // nothing to do, fall through to re-arming below.
        }
        Err(e) => {
            log::warn!("accept failed: {e}");
        }
    }
    let listen_fd = listener.as_raw_fd();
    watch_io_read_owned(io, listener, listen_fd);
}

fn watch_io_read_owned(io: fiberio::io_manager::IoManagerHandle, listener: TcpListener, listen_fd: i32) {
    let io2 = io.clone();
    io.add_event(
        listen_fd,
        EventKind::READ,
        Some(Box::new(move || test_accept(io2, listener))),
    )
    .expect("re-register listening socket");
}

/// Drains one connection's read side until it reports `WouldBlock`,
/// echoing back whatever arrives, re-arming itself for the next chunk. `n
/// == 0` always means the peer closed its write side: close and stop
/// re-arming.
fn echo_loop(io: fiberio::io_manager::IoManagerHandle, mut conn: std::net::TcpStream) {
    use std::io::{Read, Write};

    let mut buf = [0u8; 1024];
    loop {
        match conn.read(&mut buf) {
            Ok(0) => {
                log::info!("connection closed by peer");
                return;
            }
            Ok(n) => {
                if let Err(e) = conn.write_all(&buf[..n]) {
                    log::warn!("write failed, closing connection: {e}");
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                log::warn!("read failed, closing connection: {e}");
                return;
            }
        }
    }

    let fd = conn.as_raw_fd();
    let io2 = io.clone();
    io.add_event(fd, EventKind::READ, Some(Box::new(move || echo_loop(io2, conn))))
        .expect("re-register connection socket");
}
