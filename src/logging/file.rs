use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const FILE_BUFFER_SIZE: usize = 64 * 1024;
const ROLL_PER_SECONDS: u64 = 60 * 60 * 24;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CHECK_EVERY_N: u32 = 1024;

static TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");
static LINE_STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second].[subsecond digits:6]");

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn format_utc(secs: u64) -> String {
    OffsetDateTime::from_unix_timestamp(secs as i64)
        .ok()
        .and_then(|dt| dt.format(TIMESTAMP_FORMAT).ok())
        .unwrap_or_default()
}

pub(crate) fn format_utc_now_micros() -> String {
    OffsetDateTime::now_utc()
        .format(LINE_STAMP_FORMAT)
        .unwrap_or_default()
}

pub(crate) fn hostname() -> String {
    let mut buf = [0u8; 256];
    let res = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if res == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "unknownhost".to_string()
    }
}

fn log_file_name(basename: &str, now: u64) -> String {
    format!(
        "{}.{}.{}.{}.log",
        basename,
        format_utc(now),
        hostname(),
        std::process::id()
    )
}

/// A file appender with a 64 KiB userspace buffer, counting the bytes
/// it has accepted.
struct AppendFile {
    out: BufWriter<File>,
    written_bytes: u64,
}

impl AppendFile {
    fn open(path: &std::path::Path) -> io::Result<AppendFile> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AppendFile {
            out: BufWriter::with_capacity(FILE_BUFFER_SIZE, file),
            written_bytes: 0,
        })
    }

    fn append(&mut self, data: &[u8]) {
        match self.out.write_all(data) {
            Ok(()) => self.written_bytes += data.len() as u64,
            Err(e) => eprintln!("AppendFile::append failed: {}", e),
        }
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

/// A rolling log file.
///
/// Rolls immediately once `roll_size` bytes land in the current file;
/// every `check_every_n` appends it additionally rolls on a UTC day
/// change or flushes after `flush_interval`. File names are
/// `<basename>.<YYYYMMDD-HHMMSS>.<hostname>.<pid>.log` in `dir`.
///
/// Methods take `&mut self`; a multi-producer setup wraps the file in
/// a mutex, while the async logger's single writer owns it directly.
pub struct LogFile {
    dir: PathBuf,
    basename: String,
    roll_size: u64,
    flush_interval: Duration,
    check_every_n: u32,
    count: u32,
    start_of_period: u64,
    last_roll: u64,
    last_flush: u64,
    file: AppendFile,
}

impl LogFile {
    pub fn new(
        dir: impl Into<PathBuf>,
        basename: &str,
        roll_size: u64,
        flush_interval: Duration,
        check_every_n: u32,
    ) -> io::Result<LogFile> {
        assert!(!basename.contains('/'), "basename must not contain '/'");
        let dir = dir.into();
        let now = unix_now();
        let file = AppendFile::open(&dir.join(log_file_name(basename, now)))?;

        Ok(LogFile {
            dir,
            basename: basename.to_string(),
            roll_size,
            flush_interval,
            check_every_n,
            count: 0,
            start_of_period: now / ROLL_PER_SECONDS * ROLL_PER_SECONDS,
            last_roll: now,
            last_flush: now,
            file,
        })
    }

    pub fn append(&mut self, data: &[u8]) {
        self.file.append(data);

        if self.file.written_bytes > self.roll_size {
            let _ = self.roll();
        } else {
            self.count += 1;
            if self.count >= self.check_every_n {
                self.count = 0;
                let now = unix_now();
                let this_period = now / ROLL_PER_SECONDS * ROLL_PER_SECONDS;
                if this_period != self.start_of_period {
                    let _ = self.roll();
                } else if now - self.last_flush > self.flush_interval.as_secs() {
                    self.last_flush = now;
                    self.file.flush();
                }
            }
        }
    }

    pub fn flush(&mut self) {
        self.file.flush();
    }

    /// Open a fresh file. At most one roll per second: within the same
    /// second the name would collide, so the call is a no-op.
    pub fn roll(&mut self) -> io::Result<bool> {
        let now = unix_now();
        if now > self.last_roll {
            self.last_roll = now;
            self.last_flush = now;
            self.start_of_period = now / ROLL_PER_SECONDS * ROLL_PER_SECONDS;
            self.file = AppendFile::open(&self.dir.join(log_file_name(&self.basename, now)))?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn written_bytes(&self) -> u64 {
        self.file.written_bytes
    }
}

#[cfg(test)]
mod test {
    use super::{LogFile, DEFAULT_CHECK_EVERY_N, DEFAULT_FLUSH_INTERVAL};

    #[test]
    fn file_name_shape() {
        let name = super::log_file_name("svc", 0);
        // svc.19700101-000000.<host>.<pid>.log
        assert!(name.starts_with("svc.19700101-000000."));
        assert!(name.ends_with(&format!(".{}.log", std::process::id())));
    }

    #[test]
    fn appends_and_rolls_by_size() {
        let dir = tempfile::tempdir().unwrap();

        let mut file = LogFile::new(
            dir.path(),
            "roll",
            1024,
            DEFAULT_FLUSH_INTERVAL,
            DEFAULT_CHECK_EVERY_N,
        )
        .unwrap();

        for _ in 0..64 {
            file.append(&[b'x'; 64]);
        }
        file.flush();

        // 4 KiB at a 1 KiB roll size, but at most one roll per second.
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap())
            .collect();
        assert!(!files.is_empty());

        let total: u64 = files.iter().map(|f| f.metadata().unwrap().len()).sum();
        assert_eq!(total, 64 * 64);
    }

    #[test]
    #[should_panic(expected = "basename must not contain '/'")]
    fn rejects_path_separator() {
        let dir = tempfile::tempdir().unwrap();
        let _ = LogFile::new(
            dir.path(),
            "a/b",
            1024,
            DEFAULT_FLUSH_INTERVAL,
            DEFAULT_CHECK_EVERY_N,
        );
    }
}
