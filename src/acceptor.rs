use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::fd::FileDesc;
use crate::sys::socket::Socket;

/// Receives ownership of each accepted descriptor with its peer
/// address.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Owns the listening socket of one server.
///
/// On readable the acceptor takes one connection off the kernel queue
/// and hands it to the callback. A descriptor is parked on `/dev/null`
/// at construction; when the process runs out of descriptors the park
/// is released to accept-and-discard, which stops a level-triggered
/// poller from spinning on the un-acceptable connection.
pub struct Acceptor {
    loop_: EventLoop,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<FileDesc>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

fn open_idle_fd() -> io::Result<FileDesc> {
    let path = b"/dev/null\0";
    let fd = syscall!(open(
        path.as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    Ok(unsafe { FileDesc::new(fd) })
}

impl Acceptor {
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;

        let idle_fd = open_idle_fd()?;
        let channel = Channel::new(event_loop, socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            loop_: event_loop.clone(),
            socket,
            channel,
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
            new_connection_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        self.listening.store(true, Ordering::SeqCst);
        self.socket.listen().expect("listen on acceptor socket");
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();

        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                let mut cb = self.new_connection_cb.lock().unwrap();
                match cb.as_mut() {
                    Some(cb) => cb(socket, peer_addr),
                    None => drop(socket),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => {
                error!("Acceptor::handle_read: {}", e);
                // See "The special problem of accept()ing when you
                // can't" in libev's documentation.
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.drain_one_with_idle_fd();
                }
            }
        }
    }

    fn drain_one_with_idle_fd(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        idle.take();

        let fd = unsafe {
            libc::accept(
                self.socket.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }

        *idle = open_idle_fd().ok();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let channel = self.channel.clone();
        if self.loop_.is_in_loop_thread() {
            channel.disable_all();
            channel.remove();
        } else {
            self.loop_.run_in_loop(move || {
                channel.disable_all();
                channel.remove();
            });
        }
    }
}
