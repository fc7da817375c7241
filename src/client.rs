use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info};

use crate::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;

/// TCP client: one connector, at most one live connection, all on one
/// loop.
///
/// With [`enable_retry`](TcpClient::enable_retry) the client
/// reconnects (with the backoff reset) when an established connection
/// drops.
pub struct TcpClient {
    loop_: EventLoop,
    connector: Arc<Connector>,
    name: String,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    state: Mutex<ClientState>,
    self_weak: Weak<TcpClient>,
}

struct ClientState {
    connection: Option<TcpConnectionPtr>,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
}

impl TcpClient {
    pub fn new(event_loop: &EventLoop, server_addr: SocketAddr, name: &str) -> Arc<TcpClient> {
        let client = Arc::new_cyclic(|weak| TcpClient {
            loop_: event_loop.clone(),
            connector: Connector::new(event_loop, server_addr),
            name: name.to_string(),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(0),
            state: Mutex::new(ClientState {
                connection: None,
                connection_cb: Arc::new(default_connection_callback),
                message_cb: Arc::new(default_message_callback),
                write_complete_cb: None,
            }),
            self_weak: weak.clone(),
        });

        let weak = client.self_weak.clone();
        client
            .connector
            .set_new_connection_callback(Arc::new(move |socket| {
                if let Some(client) = weak.upgrade() {
                    client.new_connection(socket);
                }
            }));

        client
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.loop_
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.state.lock().unwrap().connection.clone()
    }

    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.state.lock().unwrap().connection_cb = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.state.lock().unwrap().message_cb = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.state.lock().unwrap().write_complete_cb = Some(cb);
    }

    pub fn connect(&self) {
        debug!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.store(true, Ordering::SeqCst);
        self.connector.start();
    }

    /// Half-close the live connection; queued output still drains.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::SeqCst);
        let conn = self.state.lock().unwrap().connection.clone();
        if let Some(conn) = conn {
            conn.shutdown();
        }
    }

    /// Abandon an in-flight connect attempt.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        self.connector.stop();
    }

    fn new_connection(&self, socket: Socket) {
        self.loop_.assert_in_loop_thread();

        let peer_addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("TcpClient::new_connection: peer_addr: {}", e);
                return;
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("TcpClient::new_connection: local_addr: {}", e);
                return;
            }
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = TcpConnection::new(self.loop_.clone(), conn_name, socket, local_addr, peer_addr);

        {
            let state = self.state.lock().unwrap();
            conn.set_connection_callback(state.connection_cb.clone());
            conn.set_message_callback(state.message_cb.clone());
            if let Some(cb) = state.write_complete_cb.clone() {
                conn.set_write_complete_callback(cb);
            }
        }

        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        self.state.lock().unwrap().connection = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();

        {
            let mut state = self.state.lock().unwrap();
            assert!(state
                .connection
                .as_ref()
                .map_or(false, |current| Arc::ptr_eq(current, conn)));
            state.connection = None;
        }

        let conn = conn.clone();
        self.loop_.queue_in_loop(move || conn.connect_destroyed());

        if self.retry() && self.connect.load(Ordering::SeqCst) {
            info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        debug!("TcpClient::drop [{}]", self.name);

        let conn = self.state.lock().unwrap().connection.take();
        match conn {
            Some(conn) => {
                // The client is going away: re-point the close path
                // straight at destruction, then force the close.
                conn.set_close_callback(Arc::new(|conn: &TcpConnectionPtr| {
                    let io_loop = conn.event_loop().clone();
                    let conn = conn.clone();
                    io_loop.queue_in_loop(move || conn.connect_destroyed());
                }));
                conn.force_close();
            }
            None => self.connector.stop(),
        }
    }
}
