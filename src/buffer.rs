use std::io;
use std::os::unix::io::RawFd;

use libc::c_void;

/// Size of the fixed prepend zone at the head of every buffer, kept
/// free so a length or header can be patched in front of queued data
/// without copying.
pub const CHEAP_PREPEND: usize = 8;

pub const INITIAL_SIZE: usize = 1024;

const EXTRA_BUF_SIZE: usize = 64 * 1024;

/// A growable byte queue with a prepend zone.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=      readerIndex   <=   writerIndex    <=     size
/// ```
pub struct Buffer {
    data: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            data: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader_index..self.writer_index]
    }

    /// Consume `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Put `data` in front of the readable region. There must be room
    /// in the prepend zone.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.data[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.resize(self.writer_index + len, 0);
        } else {
            // Compact: shift the readable region down to the prepend
            // boundary instead of growing.
            let readable = self.readable_bytes();
            self.data
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Drain `fd` with one scatter read: whatever fits lands in the
    /// writable region, the rest goes through a 64 KiB stack buffer
    /// and is appended, bounding per-call memory while still emptying
    /// the socket's backlog quickly.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let iovs = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.writer_index) } as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iovs.as_ptr(), iovcnt))? as usize;

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.data.len();
            self.append(&extrabuf[..n - writable]);
        }

        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let payload = vec![b'x'; 200];
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);

        buf.retrieve(50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);
        assert_eq!(buf.peek(), &payload[..150]);

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn round_trip() {
        let mut buf = Buffer::new();
        let payload: Vec<u8> = (0..=255).collect();
        buf.append(&payload);
        assert_eq!(buf.retrieve_all_as_bytes(), payload);
    }

    #[test]
    fn grows() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1400);
        assert_eq!(&buf.peek()[..400], &vec![b'y'; 400][..]);
        assert_eq!(&buf.peek()[400..], &vec![b'z'; 1000][..]);
    }

    #[test]
    fn compacts_inside_current_allocation() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700);

        // 100 readable; appending 900 fits after compaction without
        // growing the backing store.
        let capacity = INITIAL_SIZE + CHEAP_PREPEND;
        buf.append(&vec![b'b'; 900]);
        assert_eq!(buf.readable_bytes(), 1000);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.data.len(), capacity);
        assert_eq!(&buf.peek()[..100], &vec![b'a'; 100][..]);
    }

    #[test]
    fn prepend_into_head_zone() {
        let mut buf = Buffer::new();
        buf.append(b"world");

        let len = (5u32).to_be_bytes();
        buf.prepend(&len);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.retrieve_as_bytes(4), len);
        assert_eq!(buf.retrieve_all_as_bytes(), b"world");
    }

    #[test]
    fn read_fd_overflow_spills_into_extra_buffer() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let payload = vec![b'p'; 3000];
        let n = unsafe { libc::write(wr, payload.as_ptr() as *const _, payload.len()) };
        assert_eq!(n as usize, payload.len());

        let mut buf = Buffer::with_capacity(100);
        let read = buf.read_fd(rd).unwrap();
        assert_eq!(read, 3000);
        assert_eq!(buf.readable_bytes(), 3000);
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
