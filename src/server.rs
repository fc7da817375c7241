use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use log::{error, info, trace};

use crate::acceptor::Acceptor;
use crate::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::sys::socket::Socket;

/// TCP server: one acceptor on the base loop, connections partitioned
/// across a loop pool.
///
/// The connection map is touched only on the base loop's thread.
pub struct TcpServer {
    loop_: EventLoop,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    state: Mutex<ServerState>,
    self_weak: Weak<TcpServer>,
}

struct ServerState {
    connections: IndexMap<String, TcpConnectionPtr>,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    thread_init_cb: Option<ThreadInitCallback>,
}

impl TcpServer {
    /// `reuse_port` additionally sets SO_REUSEPORT on the listening
    /// socket; address reuse is always on.
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: &SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(event_loop, listen_addr, reuse_port)?;
        let ip_port = acceptor.local_addr()?.to_string();

        let server = Arc::new_cyclic(|weak| TcpServer {
            loop_: event_loop.clone(),
            ip_port,
            name: name.to_string(),
            acceptor,
            pool: Arc::new(EventLoopThreadPool::new(event_loop, name)),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            state: Mutex::new(ServerState {
                connections: IndexMap::new(),
                connection_cb: Arc::new(default_connection_callback),
                message_cb: Arc::new(default_message_callback),
                write_complete_cb: None,
                thread_init_cb: None,
            }),
            self_weak: weak.clone(),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));

        Ok(server)
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.loop_
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of loop threads carrying connections; zero keeps
    /// everything on the base loop. Set before `start`.
    pub fn set_thread_num(&self, num: usize) {
        self.pool.set_thread_num(num);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.state.lock().unwrap().thread_init_cb = Some(cb);
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

    pub fn pool(&self) -> &Arc<EventLoopThreadPool> {
        &self.pool
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// Start the loop pool and begin listening. Idempotent and
    /// thread-safe.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            let this = self.self_weak.upgrade().expect("server alive in start");
            // The pool starts before the listen so a connection can
            // never arrive ahead of its loop.
            self.loop_.run_in_loop(move || {
                let init = this.state.lock().unwrap().thread_init_cb.clone();
                this.pool.start(init);

                assert!(!this.acceptor.listening());
                this.acceptor.listen();
            });
        }
    }

    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.loop_.assert_in_loop_thread();

        let io_loop = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);

        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("TcpServer::new_connection: local_addr: {}", e);
                return;
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);

        {
            let mut state = self.state.lock().unwrap();
            conn.set_connection_callback(state.connection_cb.clone());
            conn.set_message_callback(state.message_cb.clone());
            if let Some(cb) = state.write_complete_cb.clone() {
                conn.set_write_complete_callback(cb);
            }
            state.connections.insert(conn_name, conn.clone());
        }

        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let conn = conn.clone();
        io_loop.run_in_loop(move || conn.connect_established());
    }

    // Runs on the connection's loop; removal is marshalled onto the
    // server's loop, destruction back onto the connection's.
    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        let this = self.self_weak.upgrade().expect("server alive in close callback");
        let conn = conn.clone();
        self.loop_
            .run_in_loop(move || this.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );

        let removed = self.state.lock().unwrap().connections.swap_remove(conn.name());
        if removed.is_none() {
            // Already drained by server teardown.
            return;
        }

        let io_loop = conn.event_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        trace!("TcpServer::drop [{}]", self.name);

        let connections: Vec<TcpConnectionPtr> = {
            let mut state = self.state.lock().unwrap();
            state.connections.drain(..).map(|(_, conn)| conn).collect()
        };

        for conn in connections {
            let io_loop = conn.event_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
