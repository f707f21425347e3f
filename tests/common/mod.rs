//! Common test utilities for double-fork integration tests
//!
//! Detached workers cannot be waited for, so tests watch the files they
//! write.

#![allow(dead_code)]

use double_fork::{Fork, ProcessControl};
use std::{
    cell::Cell,
    fs, io,
    path::Path,
    thread,
    time::{Duration, Instant},
};

/// Wait for a file to exist with timeout
pub fn wait_for_file(path: &Path, timeout_ms: u64) -> bool {
    wait_for_content(path, timeout_ms, |_| true)
}

/// Wait until a file exists and its content satisfies `ready`
pub fn wait_for_content(path: &Path, timeout_ms: u64, ready: impl Fn(&str) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if let Ok(content) = fs::read_to_string(path) {
            if ready(&content) {
                return true;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Append one line; `O_APPEND` keeps lines from several processes whole
pub fn append_line(path: &Path, line: &str) {
    use std::io::Write;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("Failed to open file for append");
    writeln!(file, "{line}").expect("Failed to append line");
}

/// Real fork/setsid, except the `fail_at`-th fork (1-based) fails with
/// `errno`. Fork counts survive into children, so `fail_at = 2` fails the
/// second fork inside the intermediate process.
pub struct FailingFork {
    fail_at: usize,
    errno: i32,
    forks: Cell<usize>,
}

impl FailingFork {
    pub fn at(fail_at: usize, errno: i32) -> Self {
        Self {
            fail_at,
            errno,
            forks: Cell::new(0),
        }
    }
}

impl ProcessControl for FailingFork {
    fn fork(&self) -> io::Result<Fork> {
        let n = self.forks.get() + 1;
        self.forks.set(n);
        if n == self.fail_at {
            return Err(io::Error::from_raw_os_error(self.errno));
        }
        double_fork::fork()
    }

    fn setsid(&self) -> io::Result<libc::pid_t> {
        double_fork::setsid()
    }
}

/// Real fork, but setsid always fails with `errno`
pub struct FailingSetsid(pub i32);

impl ProcessControl for FailingSetsid {
    fn fork(&self) -> io::Result<Fork> {
        double_fork::fork()
    }

    fn setsid(&self) -> io::Result<libc::pid_t> {
        Err(io::Error::from_raw_os_error(self.0))
    }
}
