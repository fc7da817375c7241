use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use reactor_net::{EventLoopThread, TcpClient, TcpConnectionPtr, TcpServer};

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

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn client_talks_to_server_and_disconnects() {
    let server_thread = EventLoopThread::start("cli-srv", None);
    let server_loop = server_thread.event_loop().clone();

    let server = TcpServer::new(&server_loop, &any_addr(), "echo", false).unwrap();
    server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buf, _time| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();
    let addr = server.local_addr().unwrap();

    let client_thread = EventLoopThread::start("cli", None);
    let client_loop = client_thread.event_loop().clone();

    let client = TcpClient::new(&client_loop, addr, "echo-client");
    client.set_connection_callback(Arc::new(|conn: &TcpConnectionPtr| {
        if conn.connected() {
            conn.send(b"ping");
        }
    }));
    let (tx, rx) = mpsc::channel();
    client.set_message_callback(Arc::new(move |_conn: &TcpConnectionPtr, buf, _time| {
        tx.send(buf.retrieve_all_as_bytes()).unwrap();
    }));

    client.connect();

    let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reply, b"ping");
    assert!(client.connection().is_some());

    client.disconnect();
    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 0));
    assert!(wait_until(Duration::from_secs(5), || client.connection().is_none()));
}

#[test]
fn connector_backs_off_until_the_target_opens() {
    // Reserve an address, then free it so the first attempt is
    // refused.
    let placeholder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let client_thread = EventLoopThread::start("backoff-cli", None);
    let client_loop = client_thread.event_loop().clone();

    let connected = Arc::new(AtomicBool::new(false));
    let client = TcpClient::new(&client_loop, addr, "backoff");
    let flag = connected.clone();
    client.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            flag.store(true, Ordering::SeqCst);
        }
    }));

    let started = Instant::now();
    client.connect();

    // Let the refused attempt happen, then open the target; the
    // 500 ms retry timer picks it up.
    thread::sleep(Duration::from_millis(200));
    assert!(!connected.load(Ordering::SeqCst));
    let listener = std::net::TcpListener::bind(addr).unwrap();
    let accepted = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

    assert!(wait_until(Duration::from_secs(5), || {
        connected.load(Ordering::SeqCst)
    }));
    assert!(started.elapsed() >= Duration::from_millis(400));

    let _stream = accepted.join().unwrap().unwrap();
    client.stop();
}
