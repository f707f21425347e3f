//! Daemonizer integration tests
//!
//! These tests spawn real detached workers from the test process. The
//! workers write files, the test (the original caller) watches for them.
//! These tests verify:
//! - The caller gets control back while the worker is still busy
//! - Exactly one process runs the work
//! - The worker is in a new session without leading it or owning a terminal
//! - The chdir and redirect_stdio options take effect in the worker
//! - A panicking work never unwinds into the caller's code

mod common;

use common::{append_line, wait_for_content, wait_for_file};
use double_fork::{Daemonizer, ProcessIdentity, Role, getpid, spawn_daemon};
use std::{
    env, fs,
    os::unix::fs::MetadataExt,
    process::exit,
    thread,
    time::{Duration, Instant},
};

#[test]
fn test_caller_returns_before_work_is_done() {
    // work sleeps 1s then writes "done"; the caller is back right away and
    // the file shows up within 2s
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let out = dir.path().join("out.txt");
    let worker_out = out.clone();

    let start = Instant::now();
    let detached = spawn_daemon(move || {
        thread::sleep(Duration::from_secs(1));
        fs::write(&worker_out, "done").expect("Failed to write out.txt");
    })
    .expect("spawn_daemon failed");

    assert!(
        start.elapsed() < Duration::from_secs(1),
        "caller should not wait for the work"
    );
    assert!(!out.exists(), "work should still be asleep");
    assert!(detached.pid > 0);
    assert_ne!(detached.pid, getpid());

    assert!(
        wait_for_content(&out, 2000, |content| content == "done"),
        "out.txt should contain \"done\""
    );
}

#[test]
fn test_exactly_one_process_runs_work() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let log = dir.path().join("runs.log");
    let worker_log = log.clone();

    let detached = spawn_daemon(move || {
        append_line(&worker_log, &format!("work {}", getpid()));
    })
    .expect("spawn_daemon failed");
    append_line(&log, &format!("caller {}", getpid()));

    assert!(
        wait_for_content(&log, 1000, |content| content.contains("work")),
        "work should have run"
    );
    // give any stray copy of the caller time to show up
    thread::sleep(Duration::from_millis(200));

    let content = fs::read_to_string(&log).expect("Failed to read log");
    let work: Vec<&str> = content.lines().filter(|l| l.starts_with("work")).collect();
    let caller: Vec<&str> = content.lines().filter(|l| l.starts_with("caller")).collect();
    assert_eq!(work, vec![format!("work {}", detached.pid)]);
    assert_eq!(caller, vec![format!("caller {}", getpid())]);
}

#[test]
fn test_worker_is_detached_from_session() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let marker = dir.path().join("identity.marker");
    let worker_marker = marker.clone();
    let caller = ProcessIdentity::current().expect("Failed to read identity");

    let detached = spawn_daemon(move || {
        let id = ProcessIdentity::current().expect("Failed to read identity");
        fs::write(&worker_marker, format!("{},{},{}", id.pid, id.pgid, id.sid))
            .expect("Failed to write marker file");
    })
    .expect("spawn_daemon failed");

    assert!(
        wait_for_content(&marker, 1000, |c| c.split(',').count() == 3),
        "worker should have written its identity"
    );
    let content = fs::read_to_string(&marker).expect("Failed to read marker file");
    let ids: Vec<i32> = content
        .split(',')
        .map(|part| part.parse().expect("Failed to parse id"))
        .collect();
    let worker = ProcessIdentity {
        pid: ids[0],
        pgid: ids[1],
        sid: ids[2],
    };

    assert_eq!(worker.pid, detached.pid);
    assert_ne!(worker.sid, caller.sid, "worker should be in a new session");
    assert!(!worker.is_session_leader(), "worker must not lead its session");
    assert!(!worker.is_group_leader());
    // the group and session both belong to the intermediate that is now gone
    assert_eq!(worker.pgid, worker.sid);
}

#[test]
fn test_worker_has_no_controlling_terminal() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let tty_file = dir.path().join("tty.info");
    let worker_tty_file = tty_file.clone();

    spawn_daemon(move || {
        let state = match fs::File::open("/dev/tty") {
            Ok(_) => "tty",
            Err(_) => "none",
        };
        fs::write(&worker_tty_file, state).expect("Failed to write tty file");
    })
    .expect("spawn_daemon failed");

    assert!(wait_for_file(&tty_file, 1000), "TTY info file should exist");
    assert!(wait_for_content(&tty_file, 500, |c| c == "none"));
}

#[test]
fn test_worker_keeps_working_directory_by_default() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let marker = dir.path().join("cwd.marker");
    let worker_marker = marker.clone();
    let cwd = env::current_dir().expect("Failed to get current dir");

    spawn_daemon(move || {
        let current = env::current_dir().expect("Failed to get current dir");
        fs::write(&worker_marker, current.display().to_string())
            .expect("Failed to write marker file");
    })
    .expect("spawn_daemon failed");

    let expected = cwd.display().to_string();
    assert!(
        wait_for_content(&marker, 1000, |c| c == expected),
        "worker should stay in {expected}"
    );
}

#[test]
fn test_chdir_option_moves_worker_to_root() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let marker = dir.path().join("cwd.marker");
    let worker_marker = marker.clone();
    let cwd = env::current_dir().expect("Failed to get current dir");

    Daemonizer::new()
        .chdir(true)
        .spawn(move || {
            let current = env::current_dir().expect("Failed to get current dir");
            fs::write(&worker_marker, current.display().to_string())
                .expect("Failed to write marker file");
        })
        .expect("spawn failed");

    assert!(wait_for_content(&marker, 1000, |c| c == "/"));
    // only the worker moved
    assert_eq!(env::current_dir().expect("Failed to get current dir"), cwd);
}

#[test]
fn test_redirect_stdio_option_points_at_dev_null() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let marker = dir.path().join("stdio.marker");
    let worker_marker = marker.clone();
    let null_rdev = fs::metadata("/dev/null")
        .expect("Failed to stat /dev/null")
        .rdev();

    Daemonizer::new()
        .redirect_stdio(true)
        .spawn(move || {
            let states: Vec<&str> = (0..=2)
                .map(|fd| match fs::metadata(format!("/dev/fd/{fd}")) {
                    Ok(meta) if meta.rdev() == null_rdev => "null",
                    _ => "other",
                })
                .collect();
            // goes to /dev/null, not into the marker
            println!("stdout is gone");
            fs::write(&worker_marker, states.join(",")).expect("Failed to write marker file");
        })
        .expect("spawn failed");

    assert!(
        wait_for_content(&marker, 1000, |c| c == "null,null,null"),
        "stdin, stdout and stderr should all be /dev/null"
    );
}

#[test]
fn test_panicking_work_does_not_return_to_caller() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let log = dir.path().join("panic.log");
    let worker_log = log.clone();

    spawn_daemon(move || {
        append_line(&worker_log, "work");
        panic!("work failed on purpose");
    })
    .expect("spawn_daemon failed");
    append_line(&log, &format!("caller {}", getpid()));

    assert!(wait_for_content(&log, 1000, |c| c.contains("work")));
    thread::sleep(Duration::from_millis(200));

    let content = fs::read_to_string(&log).expect("Failed to read log");
    assert_eq!(
        content.lines().filter(|l| l.starts_with("caller")).count(),
        1,
        "the worker must not continue as the caller after a panic"
    );
}

#[test]
fn test_detach_returns_in_caller_and_worker() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let marker = dir.path().join("detach.marker");

    match Daemonizer::new().detach().expect("detach failed") {
        Role::Caller(detached) => {
            let expected = detached.pid.to_string();
            assert!(
                wait_for_content(&marker, 1000, |c| c == expected),
                "worker should report its own pid"
            );
        }
        Role::Worker => {
            fs::write(&marker, getpid().to_string()).expect("Failed to write marker file");
            exit(0);
        }
    }
}
