use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

fn state_from(value: u8) -> State {
    match value {
        0 => State::Connecting,
        1 => State::Connected,
        2 => State::Disconnecting,
        3 => State::Disconnected,
        _ => unreachable!("invalid connection state {}", value),
    }
}

pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
    // Do not force-close here: some users register a message callback
    // only.
}

pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _time: Instant) {
    buf.retrieve_all();
}

/// One established TCP connection, pinned to one event loop.
///
/// Shared as [`TcpConnectionPtr`] by the owning server/client, by loop
/// tasks, and by user code; the channel only holds a weak
/// back-reference. `send`, `shutdown` and `force_close` are safe to
/// call from any thread; after the connection has disconnected they
/// are silent no-ops.
pub struct TcpConnection {
    loop_: EventLoop,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    high_water_mark: AtomicUsize,
    self_weak: Weak<TcpConnection>,
    io: Mutex<Io>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

// Loop-owned state: only ever locked from the owning loop's thread,
// apart from callback setters at setup time.
struct Io {
    input: Buffer,
    output: Buffer,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<CloseCallback>,
}

impl TcpConnection {
    pub fn new(
        event_loop: EventLoop,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        if let Err(e) = socket.set_keep_alive(true) {
            warn!("enable keep-alive on [{}]: {}", name, e);
        }

        let channel = Channel::new(&event_loop, socket.as_raw_fd());
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| TcpConnection {
            loop_: event_loop,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            channel,
            local_addr,
            peer_addr,
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            self_weak: weak.clone(),
            io: Mutex::new(Io {
                input: Buffer::new(),
                output: Buffer::new(),
                connection_cb: None,
                message_cb: None,
                write_complete_cb: None,
                high_water_mark_cb: None,
                close_cb: None,
            }),
            context: Mutex::new(None),
        });
        debug!("TcpConnection::new [{}] fd = {}", conn.name, conn.channel.fd());

        let weak = conn.self_weak.clone();
        conn.channel.set_read_callback(Box::new(move |time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(time);
            }
        }));
        let weak = conn.self_weak.clone();
        conn.channel.set_write_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        }));
        let weak = conn.self_weak.clone();
        conn.channel.set_close_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        }));
        let weak = conn.self_weak.clone();
        conn.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));

        conn
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.loop_
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> State {
        state_from(self.state.load(Ordering::SeqCst))
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn strong(&self) -> TcpConnectionPtr {
        self.self_weak.upgrade().expect("connection is alive during its own call")
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.io.lock().unwrap().connection_cb = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.io.lock().unwrap().message_cb = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.io.lock().unwrap().write_complete_cb = Some(cb);
    }

    /// Called once the output buffer grows past `mark` bytes, at the
    /// upward crossing only.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::SeqCst);
        self.io.lock().unwrap().high_water_mark_cb = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.io.lock().unwrap().close_cb = Some(cb);
    }

    pub fn set_nodelay(&self, on: bool) {
        if let Err(e) = self.socket.set_nodelay(on) {
            warn!("TCP_NODELAY on [{}]: {}", self.name, e);
        }
    }

    pub fn set_context<T: Any + Send + Sync>(&self, context: T) {
        *self.context.lock().unwrap() = Some(Box::new(context));
    }

    pub fn with_context<T: Any + Send + Sync, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.context.lock().unwrap();
        f(guard.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    /// Queue `data` for delivery. Thread-safe; a no-op unless
    /// connected.
    pub fn send(&self, data: &[u8]) {
        if self.state() == State::Connected {
            if self.loop_.is_in_loop_thread() {
                self.send_in_loop(data);
            } else {
                let this = self.strong();
                let data = data.to_vec();
                self.loop_.run_in_loop(move || this.send_in_loop(&data));
            }
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("[{}] disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0;
        let mut fault = false;
        let mut io = self.io.lock().unwrap();

        // Nothing queued and not watching for writability: try the
        // kernel buffer directly.
        if !self.channel.is_writing() && io.output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    if nwrote == data.len() {
                        if let Some(cb) = io.write_complete_cb.clone() {
                            let this = self.strong();
                            self.loop_.queue_in_loop(move || cb(&this));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send [{}]: {}", self.name, e);
                        if let Some(code) = e.raw_os_error() {
                            if code == libc::EPIPE || code == libc::ECONNRESET {
                                fault = true;
                            }
                        }
                    }
                }
            }
        }

        assert!(nwrote <= data.len());
        let remaining = data.len() - nwrote;
        if !fault && remaining > 0 {
            let old_len = io.output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::SeqCst);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = io.high_water_mark_cb.clone() {
                    let this = self.strong();
                    let queued = old_len + remaining;
                    self.loop_.queue_in_loop(move || cb(&this, queued));
                }
            }
            io.output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once the output buffer drains.
    /// Thread-safe; a no-op unless connected.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let this = self.strong();
            self.loop_.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!("TcpConnection::shutdown [{}]: {}", self.name, e);
            }
        }
        // Still writing: handle_write finishes the close after the
        // drain.
    }

    /// Close both directions without waiting for queued output.
    /// Thread-safe.
    pub fn force_close(&self) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let this = self.strong();
            self.loop_.queue_in_loop(move || this.force_close_in_loop());
        }
    }

    /// Like [`force_close`](TcpConnection::force_close), after a
    /// delay. The timer holds only a weak reference: firing after the
    /// connection is gone is a no-op.
    pub fn force_close_with_delay(&self, delay: Duration) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let weak = self.self_weak.clone();
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            // As if a zero-byte read had occurred.
            self.handle_close();
        }
    }

    pub fn start_read(&self) {
        let this = self.strong();
        self.loop_.run_in_loop(move || {
            this.loop_.assert_in_loop_thread();
            if !this.reading.load(Ordering::SeqCst) || !this.channel.is_reading() {
                this.channel.enable_reading();
                this.reading.store(true, Ordering::SeqCst);
            }
        });
    }

    pub fn stop_read(&self) {
        let this = self.strong();
        self.loop_.run_in_loop(move || {
            this.loop_.assert_in_loop_thread();
            if this.reading.load(Ordering::SeqCst) || this.channel.is_reading() {
                this.channel.disable_reading();
                this.reading.store(false, Ordering::SeqCst);
            }
        });
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    /// Enter the connected state: tie the channel, enable reading,
    /// deliver the connection callback. Called once by the owning
    /// server/client, on the loop thread.
    pub fn connect_established(&self) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        let this = self.strong();
        self.channel.tie(&this);
        self.channel.enable_reading();

        let cb = self.io.lock().unwrap().connection_cb.clone();
        if let Some(cb) = cb {
            cb(&this);
        }
    }

    /// Final teardown: unregister the channel. Called once by the
    /// owning server/client after removal, on the loop thread.
    pub fn connect_destroyed(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();

            let cb = self.io.lock().unwrap().connection_cb.clone();
            if let Some(cb) = cb {
                cb(&self.strong());
            }
        }
        self.channel.remove();
    }

    fn handle_read(&self, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let mut io = self.io.lock().unwrap();

        let read = loop {
            match io.input.read_fd(self.channel.fd()) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match read {
            Ok(0) => {
                drop(io);
                self.handle_close();
            }
            Ok(_) => {
                let cb = io.message_cb.clone();
                let mut input = std::mem::take(&mut io.input);
                drop(io);

                if let Some(cb) = cb {
                    cb(&self.strong(), &mut input, receive_time);
                }

                // Only this thread fills the input buffer; the slot is
                // still empty.
                self.io.lock().unwrap().input = input;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => {
                drop(io);
                error!("TcpConnection::handle_read [{}]: {}", self.name, e);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection fd = {} is down, no more writing", self.channel.fd());
            return;
        }

        let mut io = self.io.lock().unwrap();
        match self.socket.write(io.output.peek()) {
            Ok(n) => {
                io.output.retrieve(n);
                if io.output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = io.write_complete_cb.clone() {
                        let this = self.strong();
                        self.loop_.queue_in_loop(move || cb(&this));
                    }
                    drop(io);
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => error!("TcpConnection::handle_write [{}]: {}", self.name, e),
        }
    }

    fn handle_close(&self) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        trace!("fd = {} state = {:?}", self.channel.fd(), state);
        assert!(state == State::Connected || state == State::Disconnecting);
        // The descriptor is not closed here; it lives until drop, so
        // leaks stay visible.
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let io = self.io.lock().unwrap();
            (io.connection_cb.clone(), io.close_cb.clone())
        };

        let guard = self.strong();
        if let Some(cb) = connection_cb {
            cb(&guard);
        }
        // Must be the last callback delivered for this connection.
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("TcpConnection::handle_error [{}] - SO_ERROR = {}", self.name, e),
            Ok(None) => (),
            Err(e) => error!("TcpConnection::handle_error [{}]: {}", self.name, e),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd = {} state = {:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .finish()
    }
}
