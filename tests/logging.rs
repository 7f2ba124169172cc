use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use muxio::logging::{AsyncLogging, LogFile};

mod util;

use util::init;

fn base_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("muxio-{}-{}", tag, std::process::id()))
}

fn files_for(base: &PathBuf) -> Vec<PathBuf> {
    let dir = base.parent().unwrap();
    let prefix = format!("{}.", base.file_name().unwrap().to_string_lossy());
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(&prefix))
        })
        .collect();
    files.sort();
    files
}

fn read_all(base: &PathBuf) -> String {
    files_for(base)
        .iter()
        .map(|path| fs::read_to_string(path).unwrap())
        .collect()
}

fn cleanup(base: &PathBuf) {
    for path in files_for(base) {
        let _ = fs::remove_file(path);
    }
}

#[test]
fn log_file_rolls_past_the_size_threshold() {
    init();
    let base = base_path("roll");
    cleanup(&base);

    let mut file = LogFile::new(base.to_string_lossy().into_owned(), 4096).unwrap();
    let line = vec![b'x'; 512];
    for _ in 0..10 {
        file.append(&line).unwrap();
    }
    // Rolling is suppressed within the same second; step past it so the
    // next oversized append actually switches files.
    std::thread::sleep(Duration::from_millis(1100));
    for _ in 0..10 {
        file.append(&line).unwrap();
    }
    drop(file);

    let files = files_for(&base);
    assert!(files.len() >= 2, "expected a roll, got {:?}", files);
    cleanup(&base);
}

#[test]
fn async_logging_writes_every_record() {
    init();
    let base = base_path("async");
    cleanup(&base);

    let sink = AsyncLogging::with_options(
        base.to_string_lossy().into_owned(),
        10 * 1024 * 1024,
        Duration::from_millis(100),
        64 * 1024,
    );
    sink.start();
    for i in 0..1000 {
        sink.append(format!("record-{:04}\n", i).as_bytes());
    }
    sink.stop();

    let content = read_all(&base);
    assert_eq!(content.lines().count(), 1000);
    assert!(content.contains("record-0000"));
    assert!(content.contains("record-0999"));
    cleanup(&base);
}

#[test]
fn overloaded_sink_drops_with_a_marker() {
    init();
    let base = base_path("drop");
    cleanup(&base);

    // Tiny handoff buffers so each record fills one: the backlog below
    // is 30 buffers by the time the writer first wakes up.
    let sink = AsyncLogging::with_options(
        base.to_string_lossy().into_owned(),
        100 * 1024 * 1024,
        Duration::from_secs(3),
        4096,
    );
    let mut line = vec![b'z'; 3000];
    line.push(b'\n');
    for _ in 0..30 {
        sink.append(&line);
    }
    sink.start();
    // Give the writer one round against the backlog before stopping;
    // stop's final drain bypasses the overflow check on purpose.
    std::thread::sleep(Duration::from_millis(500));
    sink.stop();

    let content = read_all(&base);
    let markers = content
        .lines()
        .filter(|line| line.starts_with("Dropped log messages"))
        .count();
    assert_eq!(markers, 1);
    // Backpressure by discard: only the two retained buffers survive.
    let survivors = content.lines().filter(|line| line.starts_with("zzz")).count();
    assert_eq!(survivors, 2);
    cleanup(&base);
}
