use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_net::logging::{AsyncLogging, Config, LogBridge};

fn read_log_dir(dir: &std::path::Path) -> String {
    let mut content = String::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        content.push_str(&std::fs::read_to_string(entry.path()).unwrap());
    }
    content
}

#[test]
fn every_appended_line_reaches_the_file() {
    let dir = tempfile::tempdir().unwrap();

    let log = AsyncLogging::new(dir.path(), "app", 100 * 1024 * 1024);
    log.start();
    for i in 0..1000 {
        log.append(format!("line {}\n", i).as_bytes());
    }
    log.stop();

    let content = read_log_dir(dir.path());
    for i in 0..1000 {
        assert!(content.contains(&format!("line {}\n", i)), "missing line {}", i);
    }
}

#[test]
fn overload_drops_buffers_and_records_a_diagnostic() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::new(dir.path(), "burst", 1 << 30);
    config.buffer_size = 4096;
    config.drop_threshold = 4;
    config.keep_after_drop = 2;
    config.flush_interval = Duration::from_millis(100);
    let log = AsyncLogging::with_config(config);

    // Build a deep backlog before the writer exists.
    let line = [b'z'; 1024];
    for _ in 0..200 {
        log.append(&line);
    }

    log.start();
    thread::sleep(Duration::from_millis(300));
    log.stop();

    let content = read_log_dir(dir.path());
    assert!(
        content.contains("Dropped log messages at"),
        "diagnostic line missing:\n{}",
        content
    );
    // Backlog capped at keep_after_drop buffers plus the tail written
    // after the drop round.
    assert!(content.len() < 200 * 1024);
}

#[test]
fn bridge_stamps_and_forwards_records() {
    use log::Log;

    let dir = tempfile::tempdir().unwrap();

    let sink = Arc::new(AsyncLogging::new(dir.path(), "bridge", 100 * 1024 * 1024));
    sink.start();

    let bridge = LogBridge::new(sink.clone(), log::LevelFilter::Info);
    bridge.log(
        &log::Record::builder()
            .args(format_args!("loop started"))
            .level(log::Level::Info)
            .target("reactor")
            .build(),
    );
    bridge.log(
        &log::Record::builder()
            .args(format_args!("noisy detail"))
            .level(log::Level::Trace)
            .target("reactor")
            .build(),
    );

    sink.stop();

    let content = read_log_dir(dir.path());
    assert!(content.contains("INFO  reactor - loop started"));
    assert!(!content.contains("noisy detail"));
}
