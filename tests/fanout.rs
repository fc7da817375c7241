use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use reactor_net::{EventLoopThread, TcpConnectionPtr, TcpServer};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

const CLIENTS: usize = 100;
const MESSAGES_PER_CLIENT: usize = 10;

#[test]
fn four_loops_hundred_clients() {
    let _ = env_logger::builder().is_test(true).try_init();

    let loop_thread = EventLoopThread::start("fan-base", None);
    let event_loop = loop_thread.event_loop().clone();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(&event_loop, &addr, "fan", false).unwrap();
    server.set_thread_num(4);

    // Every callback of a connection must run on the thread the
    // connection was assigned at accept time.
    server.set_connection_callback(Arc::new(|conn: &TcpConnectionPtr| {
        if conn.connected() {
            conn.set_context(thread::current().id());
        } else {
            conn.with_context(|tid: Option<&mut ThreadId>| {
                assert_eq!(*tid.expect("set at accept"), thread::current().id());
            });
        }
    }));

    let total = Arc::new(AtomicUsize::new(0));
    let counter = total.clone();
    server.set_message_callback(Arc::new(move |conn: &TcpConnectionPtr, buf, _time| {
        conn.with_context(|tid: Option<&mut ThreadId>| {
            assert_eq!(*tid.expect("set at accept"), thread::current().id());
        });
        let data = buf.retrieve_all_as_bytes();
        let messages = data.iter().filter(|&&b| b == b'\n').count();
        counter.fetch_add(messages, Ordering::SeqCst);
    }));

    server.start();
    let addr = server.local_addr().unwrap();

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            for _ in 0..MESSAGES_PER_CLIENT {
                stream.write_all(b"msg\n").unwrap();
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        total.load(Ordering::SeqCst) == CLIENTS * MESSAGES_PER_CLIENT
    }));
    assert!(wait_until(Duration::from_secs(10), || {
        server.connection_count() == 0
    }));
}
