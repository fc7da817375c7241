use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::buffer::{FixedBuffer, LARGE_BUFFER_SIZE};
use super::file::{format_utc, unix_now, LogFile, DEFAULT_CHECK_EVERY_N, DEFAULT_FLUSH_INTERVAL};

/// Tuning knobs of the async logger. The defaults match a busy
/// service: 4 MiB buffers, a 3 s flush tick, drop once 25 buffers
/// queue up and keep 2.
pub struct Config {
    pub dir: PathBuf,
    pub basename: String,
    pub roll_size: u64,
    pub flush_interval: Duration,
    pub buffer_size: usize,
    pub drop_threshold: usize,
    pub keep_after_drop: usize,
}

impl Config {
    pub fn new(dir: impl Into<PathBuf>, basename: &str, roll_size: u64) -> Config {
        Config {
            dir: dir.into(),
            basename: basename.to_string(),
            roll_size,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            buffer_size: LARGE_BUFFER_SIZE,
            drop_threshold: 25,
            keep_after_drop: 2,
        }
    }
}

/// Double-buffered asynchronous logging.
///
/// Producers append whole lines into the current front buffer under a
/// mutex; a single background thread swaps filled buffers out and
/// writes them to a rolling [`LogFile`]. Producers are never blocked
/// on disk: when the backlog passes `drop_threshold` buffers the
/// excess is dropped and one diagnostic line records how many, on
/// stderr and in the file.
pub struct AsyncLogging {
    inner: Arc<Inner>,
    backend: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: Config,
    running: AtomicBool,
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    current: FixedBuffer,
    next: Option<FixedBuffer>,
    buffers: Vec<FixedBuffer>,
}

impl AsyncLogging {
    pub fn new(dir: impl Into<PathBuf>, basename: &str, roll_size: u64) -> AsyncLogging {
        AsyncLogging::with_config(Config::new(dir, basename, roll_size))
    }

    pub fn with_config(config: Config) -> AsyncLogging {
        let buffer_size = config.buffer_size;
        AsyncLogging {
            inner: Arc::new(Inner {
                config,
                running: AtomicBool::new(false),
                state: Mutex::new(State {
                    current: FixedBuffer::with_capacity(buffer_size),
                    next: Some(FixedBuffer::with_capacity(buffer_size)),
                    buffers: Vec::with_capacity(16),
                }),
                cond: Condvar::new(),
            }),
            backend: Mutex::new(None),
        }
    }

    /// Append one log line. Callable from any thread, before or after
    /// `start`; never blocks on file I/O.
    pub fn append(&self, line: &[u8]) {
        let mut state = self.inner.state.lock().unwrap();

        if state.current.available() > line.len() {
            state.current.append(line);
        } else {
            let promoted = state
                .next
                .take()
                .unwrap_or_else(|| FixedBuffer::with_capacity(self.inner.config.buffer_size));
            let full = std::mem::replace(&mut state.current, promoted);
            state.buffers.push(full);

            state.current.append(line);
            self.inner.cond.notify_one();
        }
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("logging".to_string())
            .spawn(move || backend(inner))
            .expect("spawn logging thread");
        *self.backend.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cond.notify_one();
        if let Some(handle) = self.backend.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncLogging {
    fn drop(&mut self) {
        self.stop();
    }
}

fn backend(inner: Arc<Inner>) {
    let config = &inner.config;
    let mut output = match LogFile::new(
        &config.dir,
        &config.basename,
        config.roll_size,
        config.flush_interval,
        DEFAULT_CHECK_EVERY_N,
    ) {
        Ok(output) => output,
        Err(e) => {
            eprintln!("AsyncLogging: cannot open log file: {}", e);
            return;
        }
    };

    let mut spare1 = Some(FixedBuffer::with_capacity(config.buffer_size));
    let mut spare2 = Some(FixedBuffer::with_capacity(config.buffer_size));
    let mut to_write: Vec<FixedBuffer> = Vec::with_capacity(16);

    while inner.running.load(Ordering::SeqCst) {
        assert!(to_write.is_empty());

        {
            let mut state = inner.state.lock().unwrap();
            if state.buffers.is_empty() {
                // Single consumer: a spurious or timed-out wake only
                // means an early flush of the current buffer.
                let (guard, _) = inner
                    .cond
                    .wait_timeout(state, config.flush_interval)
                    .unwrap();
                state = guard;
            }

            let filled = std::mem::replace(
                &mut state.current,
                spare1.take().expect("first spare is replenished each round"),
            );
            state.buffers.push(filled);
            std::mem::swap(&mut to_write, &mut state.buffers);

            if state.next.is_none() {
                state.next = spare2.take();
            }
        }

        assert!(!to_write.is_empty());

        if to_write.len() > config.drop_threshold {
            let dropped = to_write.len() - config.keep_after_drop;
            let line = format!(
                "Dropped log messages at {}, {} larger buffers\n",
                format_utc(unix_now()),
                dropped
            );
            eprint!("{}", line);
            output.append(line.as_bytes());
            to_write.truncate(config.keep_after_drop);
        }

        for buffer in &to_write {
            output.append(buffer.as_bytes());
        }

        if to_write.len() > 2 {
            // Keep two for the spares, free the rest.
            to_write.truncate(2);
        }

        if spare1.is_none() {
            if let Some(mut buffer) = to_write.pop() {
                buffer.reset();
                spare1 = Some(buffer);
            } else {
                spare1 = Some(FixedBuffer::with_capacity(config.buffer_size));
            }
        }

        if spare2.is_none() {
            if let Some(mut buffer) = to_write.pop() {
                buffer.reset();
                spare2 = Some(buffer);
            } else {
                spare2 = Some(FixedBuffer::with_capacity(config.buffer_size));
            }
        }

        to_write.clear();
        output.flush();
    }

    // Flush whatever is left behind the front mutex.
    {
        let mut state = inner.state.lock().unwrap();
        let filled = std::mem::replace(
            &mut state.current,
            spare1.take().unwrap_or_else(|| FixedBuffer::with_capacity(config.buffer_size)),
        );
        state.buffers.push(filled);
        std::mem::swap(&mut to_write, &mut state.buffers);
    }
    for buffer in &to_write {
        if !buffer.is_empty() {
            output.append(buffer.as_bytes());
        }
    }
    output.flush();
}
