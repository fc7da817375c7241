use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactor_net::{EventLoopThread, TcpConnectionPtr, TcpServer};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn echo_round_trip_and_close() {
    init_logging();

    let loop_thread = EventLoopThread::start("echo-base", None);
    let event_loop = loop_thread.event_loop().clone();

    let server = TcpServer::new(&event_loop, &any_addr(), "echo", false).unwrap();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.disconnected() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));
    server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buf, _time| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    }));

    server.start();
    // start is idempotent
    server.start();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello").unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");
    assert_eq!(server.connection_count(), 1);

    drop(client);
    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 0));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_drains_output_before_half_close() {
    init_logging();

    const PAYLOAD: usize = 10 * 1024 * 1024;

    let loop_thread = EventLoopThread::start("drain-base", None);
    let event_loop = loop_thread.event_loop().clone();

    let server = TcpServer::new(&event_loop, &any_addr(), "drain", false).unwrap();
    server.set_connection_callback(Arc::new(|conn: &TcpConnectionPtr| {
        if conn.connected() {
            conn.send(&vec![b'd'; PAYLOAD]);
            conn.shutdown();
        }
    }));
    server.start();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();

    assert_eq!(received.len(), PAYLOAD);
    assert!(received.iter().all(|&b| b == b'd'));
}

#[test]
fn write_complete_once_per_drain_and_high_water_mark_once_per_crossing() {
    init_logging();

    const PAYLOAD: usize = 16 * 1024 * 1024;
    const MARK: usize = 1024 * 1024;

    let loop_thread = EventLoopThread::start("marks-base", None);
    let event_loop = loop_thread.event_loop().clone();

    let server = TcpServer::new(&event_loop, &any_addr(), "marks", false).unwrap();

    let high_water_marks = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let marks = high_water_marks.clone();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            let marks = marks.clone();
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn: &TcpConnectionPtr, queued| {
                    assert!(queued >= MARK);
                    marks.fetch_add(1, Ordering::SeqCst);
                }),
                MARK,
            );
            conn.send(&vec![b'm'; PAYLOAD]);
        }
    }));
    let completes = write_completes.clone();
    server.set_write_complete_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        completes.fetch_add(1, Ordering::SeqCst);
        conn.shutdown();
    }));

    server.start();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received.len(), PAYLOAD);

    assert!(wait_until(Duration::from_secs(5), || {
        write_completes.load(Ordering::SeqCst) == 1
    }));
    // 16 MiB against the kernel's send buffer queues well past 1 MiB,
    // in one upward crossing.
    assert_eq!(high_water_marks.load(Ordering::SeqCst), 1);
}
