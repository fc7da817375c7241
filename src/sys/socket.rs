use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{self, c_int, c_void, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM};

use super::fd::FileDesc;

pub fn setsockopt<T>(sock: &Socket, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        payload,
        mem::size_of::<T>() as libc::socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn addr_to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in) = sin;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6) = sin6;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as libc::socklen_t)
}

pub fn storage_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = sin.sin_addr.s_addr.to_ne_bytes();
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip.into(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                sin6.sin6_addr.s6_addr.into(),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut libc::sockaddr, *mut libc::socklen_t) -> io::Result<c_int>,
{
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as libc::socklen_t;
    f(&mut storage as *mut _ as *mut _, &mut len)?;
    storage_to_addr(&storage, len as usize)
}

/// An owned non-blocking TCP socket.
pub struct Socket(FileDesc);

impl Socket {
    /// Create a non-blocking stream socket for `addr`'s family.
    pub fn new_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let fam = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };

        let fd = syscall!(socket(fam, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, 0))?;
        Ok(Socket(unsafe { FileDesc::new(fd) }))
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_storage(addr);
        syscall!(bind(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), libc::SOMAXCONN))?;
        Ok(())
    }

    /// Issue a non-blocking connect. The raw OS error is left intact so
    /// the caller can classify the errno itself.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_storage(addr);
        syscall!(connect(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    /// Accept one queued connection; the new socket is non-blocking and
    /// close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;

        let fd = loop {
            match syscall!(accept4(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                SOCK_NONBLOCK | SOCK_CLOEXEC
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other,
            }
        }?;

        let addr = storage_to_addr(&storage, len as usize)?;
        Ok((Socket(unsafe { FileDesc::new(fd) }), addr))
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(
            self.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(
            self.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| syscall!(getsockname(self.as_raw_fd(), storage, len)))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| syscall!(getpeername(self.as_raw_fd(), storage, len)))
    }

    /// SO_ERROR, cleared by reading.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    /// A connect that landed on its own ephemeral port.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.as_raw_fd()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::Socket;
    use std::io::ErrorKind;
    use std::net::SocketAddr;

    #[test]
    fn bind_listen_connect_accept() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let listener = Socket::new_nonblocking(&any).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&any).unwrap();
        listener.listen().unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Socket::new_nonblocking(&addr).unwrap();
        match client.connect(&addr) {
            Ok(()) => (),
            Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS)),
        }

        // Loopback accept completes promptly; poll briefly.
        let accepted = loop {
            match listener.accept() {
                Ok((sock, peer)) => {
                    assert_eq!(peer, client.local_addr().unwrap());
                    break sock;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept: {}", e),
            }
        };

        assert_eq!(accepted.local_addr().unwrap(), addr);
        assert!(client.take_error().unwrap().is_none());
    }

    #[test]
    fn storage_round_trip_v4_and_v6() {
        for text in ["192.0.2.7:4242", "[2001:db8::1]:8080"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (storage, len) = super::addr_to_storage(&addr);
            let back = super::storage_to_addr(&storage, len as usize).unwrap();
            assert_eq!(addr, back);
        }
    }
}
