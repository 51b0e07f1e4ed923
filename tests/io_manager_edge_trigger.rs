//! A client bursts 3x64 KiB in one write, and the registered handler must
//! drain all of it off a single edge-triggered READ readiness notification
//! by reading until `WouldBlock`.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fiberio::config::IoManagerConfig;
use fiberio::io_manager::{EventKind, IoManager};

const CHUNK: usize = 64 * 1024;
const TOTAL: usize = CHUNK * 3;

#[test]
fn edge_triggered_read_drains_a_multi_chunk_burst_in_one_notification() {
    let io = IoManager::new(IoManagerConfig::new("s5").thread_count(1).use_caller(false)).unwrap();
    io.start().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let total_read = Arc::new(AtomicUsize::new(0));
    let notifications = Arc::new(AtomicUsize::new(0));

    let total_read2 = total_read.clone();
    let notifications2 = notifications.clone();
    let io2 = io.handle();
    let listen_fd = listener.as_raw_fd();
    io.add_event(
        listen_fd,
        EventKind::READ,
        Some(Box::new(move || {
            let (conn, _) = listener.accept().unwrap();
            conn.set_nonblocking(true).unwrap();
            let fd = conn.as_raw_fd();
            register_drain(io2, conn, fd, total_read2, notifications2);
        })),
    )
    .unwrap();

    // One write, one notification expected, regardless of how many reads
    // it takes to drain it.
    let mut client = TcpStream::connect(addr).unwrap();
    let payload = vec![7u8; TOTAL];
    client.write_all(&payload).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while total_read.load(Ordering::SeqCst) < TOTAL && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    io.stop();
    assert_eq!(total_read.load(Ordering::SeqCst), TOTAL);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

fn register_drain(
    io: fiberio::io_manager::IoManagerHandle,
    mut conn: TcpStream,
    fd: i32,
    total_read: Arc<AtomicUsize>,
    notifications: Arc<AtomicUsize>,
) {
    notifications.fetch_add(1, Ordering::SeqCst);
    let mut buf = [0u8; 4096];
    loop {
        match conn.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                total_read.fetch_add(n, Ordering::SeqCst);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => return,
        }
    }
    let io2 = io.clone();
    let total_read2 = total_read.clone();
    let notifications2 = notifications.clone();
    io.add_event(
        fd,
        EventKind::READ,
        Some(Box::new(move || register_drain(io2, conn, fd, total_read2, notifications2))),
    )
    .unwrap();
}
