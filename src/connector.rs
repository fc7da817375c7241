use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Receives ownership of the connected descriptor.
pub type NewConnectionCallback = Arc<dyn Fn(Socket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

fn state_from(value: u8) -> State {
    match value {
        0 => State::Disconnected,
        1 => State::Connecting,
        2 => State::Connected,
        _ => unreachable!("invalid connector state {}", value),
    }
}

struct Attempt {
    socket: Socket,
    channel: Arc<Channel>,
}

/// Non-blocking connect with exponential-backoff retry.
///
/// `start` and `stop` are thread-safe. The connect errno decides the
/// path: in-progress class waits for writability, transient class
/// retries after the current delay (doubling 500 ms up to 30 s), the
/// rest close the socket and give up. Writability alone does not mean
/// success; SO_ERROR and self-connection are re-checked first.
pub struct Connector {
    loop_: EventLoop,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    attempt: Mutex<Option<Attempt>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    self_weak: Weak<Connector>,
}

impl Connector {
    pub fn new(event_loop: &EventLoop, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|weak| Connector {
            loop_: event_loop.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
            attempt: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    fn state(&self) -> State {
        state_from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn strong(&self) -> Arc<Connector> {
        self.self_weak.upgrade().expect("connector is alive during its own call")
    }

    /// Begin connecting. Thread-safe.
    pub fn start(&self) {
        self.connect.store(true, Ordering::SeqCst);
        let this = self.strong();
        self.loop_.run_in_loop(move || this.start_in_loop());
    }

    /// Abandon the current attempt and any scheduled retry.
    /// Thread-safe.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        let this = self.strong();
        self.loop_.queue_in_loop(move || this.stop_in_loop());
    }

    /// Reconnect with the backoff delay reset. Loop thread only.
    pub fn restart(&self) {
        self.loop_.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::SeqCst);
        self.connect.store(true, Ordering::SeqCst);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::SeqCst) {
            self.do_connect();
        } else {
            debug!("Connector: do not connect");
        }
    }

    fn stop_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel() {
                // connect is off: this only closes the socket.
                self.retry(socket);
            }
        }
    }

    fn do_connect(&self) {
        let socket = match Socket::new_nonblocking(&self.server_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Connector: create socket: {}", e);
                return;
            }
        };

        match socket.connect(&self.server_addr) {
            Ok(()) => self.connecting(socket),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(socket)
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => self.retry(socket),
                Some(libc::EACCES)
                | Some(libc::EPERM)
                | Some(libc::EAFNOSUPPORT)
                | Some(libc::EALREADY)
                | Some(libc::EBADF)
                | Some(libc::EFAULT)
                | Some(libc::ENOTSOCK) => {
                    error!("Connector: connect to {}: {}", self.server_addr, e);
                }
                _ => {
                    error!("Connector: unexpected connect error to {}: {}", self.server_addr, e);
                }
            },
        }
    }

    fn connecting(&self, socket: Socket) {
        self.set_state(State::Connecting);

        let channel = Channel::new(&self.loop_, socket.as_raw_fd());
        let weak = self.self_weak.clone();
        channel.set_write_callback(Box::new(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        }));
        let weak = self.self_weak.clone();
        channel.set_error_callback(Box::new(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        }));
        channel.enable_writing();

        let mut attempt = self.attempt.lock().unwrap();
        assert!(attempt.is_none());
        *attempt = Some(Attempt { socket, channel });
    }

    // Unregister the attempt's channel and recover the socket. Safe to
    // run from inside the channel's own callback: dispatch holds its
    // own strong reference to the channel.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        let attempt = self.attempt.lock().unwrap().take();
        attempt.map(|Attempt { socket, channel }| {
            channel.disable_all();
            channel.remove();
            socket
        })
    }

    fn handle_write(&self) {
        trace!("Connector::handle_write state = {:?}", self.state());

        if self.state() == State::Connecting {
            let socket = match self.remove_and_reset_channel() {
                Some(socket) => socket,
                None => return,
            };

            // Writable does not imply connected.
            let sock_err = socket.take_error().unwrap_or_else(Some);
            if let Some(err) = sock_err {
                warn!("Connector::handle_write - SO_ERROR = {}", err);
                self.retry(socket);
            } else if socket.is_self_connect() {
                warn!("Connector::handle_write - self connect");
                self.retry(socket);
            } else {
                self.set_state(State::Connected);
                if self.connect.load(Ordering::SeqCst) {
                    let cb = self.new_connection_cb.lock().unwrap().clone();
                    match cb {
                        Some(cb) => cb(socket),
                        None => drop(socket),
                    }
                }
                // Stopped while connecting: the socket drops here.
            }
        } else {
            assert_eq!(self.state(), State::Disconnected);
        }
    }

    fn handle_error(&self) {
        error!("Connector::handle_error state = {:?}", self.state());
        if self.state() == State::Connecting {
            if let Some(socket) = self.remove_and_reset_channel() {
                if let Ok(Some(err)) = socket.take_error() {
                    trace!("SO_ERROR = {}", err);
                }
                self.retry(socket);
            }
        }
    }

    fn retry(&self, socket: Socket) {
        drop(socket);
        self.set_state(State::Disconnected);

        if self.connect.load(Ordering::SeqCst) {
            let delay = Duration::from_millis(self.retry_delay_ms.load(Ordering::SeqCst));
            info!(
                "Connector::retry - retry connecting to {} in {:?}",
                self.server_addr, delay
            );

            let weak = self.self_weak.clone();
            self.loop_.run_after(delay, move || {
                if let Some(connector) = weak.upgrade() {
                    connector.start_in_loop();
                }
            });

            let next = (delay * 2).min(MAX_RETRY_DELAY);
            self.retry_delay_ms
                .store(next.as_millis() as u64, Ordering::SeqCst);
        } else {
            debug!("Connector: do not connect");
        }
    }
}
