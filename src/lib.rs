//! Run a unit of work in a process detached from the controlling terminal.
//!
//! The work runs in the grandchild of a double fork: the caller forks, the
//! child starts a new session and forks again, and the grandchild, which is
//! not a session leader and can never reacquire a terminal, runs the work.
//! The caller gets the worker's pid back and carries on.
//!
//! Example:
//! ```no_run
//!use double_fork::spawn_daemon;
//!use std::{fs, thread, time::Duration};
//!
//!match spawn_daemon(|| {
//!    thread::sleep(Duration::from_secs(3));
//!    let _ = fs::write("done.txt", "done\n");
//!}) {
//!    Ok(detached) => println!("worker pid: {}", detached.pid),
//!    Err(e) => eprintln!("{e}"),
//!}
//!```

pub mod catnap;
mod daemon;
mod error;
mod identity;
pub mod keyfile;
mod report;

pub use catnap::Catnap;
pub use daemon::{Daemonizer, Detached, ProcessControl, Role, System, spawn_daemon};
pub use error::{Error, ForkStage, KeyFileError, Result};
pub use identity::ProcessIdentity;
pub use keyfile::KeyFile;

use std::ffi::CStr;
use std::io;

/// Fork result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

/// Create a new child process [see fork(2)](https://www.freebsd.org/cgi/man.cgi?fork)
///
/// Returns [`Fork::Child`] in the child and `Fork::Parent(pid)` with the
/// child's process ID in the parent.
///
/// ```no_run
///use double_fork::{fork, Fork};
///
///match fork() {
///    Ok(Fork::Parent(child)) => println!("new child has pid: {child}"),
///    Ok(Fork::Child) => println!("I'm a new child process"),
///    Err(e) => eprintln!("Fork failed: {e}"),
///}
///```
///
/// # Errors
/// Returns an [`io::Error`] if the fork system call fails, typically
/// `EAGAIN` (process limit reached) or `ENOMEM`.
pub fn fork() -> io::Result<Fork> {
    let res = unsafe { libc::fork() };
    match res {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        res => Ok(Fork::Parent(res)),
    }
}

/// Wait for a child to terminate [see wait(2)](https://man.freebsd.org/cgi/man.cgi?waitpid)
///
/// Returns the exit code if the child exited normally, `None` if it was
/// killed by a signal. Interrupted waits are restarted.
///
/// # Errors
/// Returns an [`io::Error`] if the waitpid system call fails, e.g. `ECHILD`
/// when `pid` is not a child of the calling process.
pub fn waitpid(pid: libc::pid_t) -> io::Result<Option<i32>> {
    let mut status: libc::c_int = 0;
    loop {
        let res = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if res != -1 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    if libc::WIFEXITED(status) {
        Ok(Some(libc::WEXITSTATUS(status)))
    } else {
        Ok(None)
    }
}

/// Create session and set process group ID [see setsid(2)](https://www.freebsd.org/cgi/man.cgi?setsid)
///
/// On success the caller is the leader of a new session and a new process
/// group, both identified by its own pid, which is returned.
///
/// # Errors
/// Returns an [`io::Error`] if the setsid system call fails, e.g. `EPERM`
/// when the caller already leads a process group.
pub fn setsid() -> io::Result<libc::pid_t> {
    let res = unsafe { libc::setsid() };
    match res {
        -1 => Err(io::Error::last_os_error()),
        res => Ok(res),
    }
}

/// The process group of the current process [see getpgrp(2)](https://www.freebsd.org/cgi/man.cgi?query=getpgrp)
///
/// # Errors
/// This should not fail, but `-1` from the system call is still mapped to an
/// [`io::Error`].
pub fn getpgrp() -> io::Result<libc::pid_t> {
    let res = unsafe { libc::getpgrp() };
    match res {
        -1 => Err(io::Error::last_os_error()),
        res => Ok(res),
    }
}

/// The session of the current process [see getsid(2)](https://www.freebsd.org/cgi/man.cgi?query=getsid)
///
/// # Errors
/// Returns an [`io::Error`] if the system call fails.
pub fn getsid() -> io::Result<libc::pid_t> {
    let res = unsafe { libc::getsid(0) };
    match res {
        -1 => Err(io::Error::last_os_error()),
        res => Ok(res),
    }
}

/// The pid of the current process.
#[must_use]
pub fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

/// Change the working directory to `/` [see chdir(2)](https://www.freebsd.org/cgi/man.cgi?query=chdir&sektion=2)
///
/// A daemon that stays in its start directory keeps that file system busy.
///
/// # Errors
/// Returns an [`io::Error`] if the system call fails.
pub fn chdir() -> io::Result<()> {
    let res = unsafe { libc::chdir(c"/".as_ptr()) };
    match res {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Point stdin, stdout and stderr at `/dev/null`.
///
/// Unlike closing them, this keeps fds 0, 1 and 2 occupied, so files opened
/// later get fd >= 3 and stray `println!` or panic output cannot land in
/// them.
///
/// # Errors
/// Returns an [`io::Error`] if `/dev/null` cannot be opened or `dup2()`
/// fails for any of the three descriptors.
pub fn redirect_stdio() -> io::Result<()> {
    // no O_CLOEXEC: the fd may itself end up as 0, 1 or 2.
    // runs between fork and _exit, so no allocation and no locks
    let null_fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
    if null_fd == -1 {
        return Err(io::Error::last_os_error());
    }

    let redirected = [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
        .into_iter()
        .try_for_each(|fd| match unsafe { libc::dup2(null_fd, fd) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        });

    // if /dev/null itself landed on 0, 1 or 2 it is now one of the stdio fds
    if null_fd > libc::STDERR_FILENO {
        unsafe { libc::close(null_fd) };
    }

    redirected
}

/// Human readable description of an errno value, as `strerror(3)` gives it.
#[must_use]
pub fn describe_errno(code: i32) -> String {
    let mut buf: [libc::c_char; 256] = [0; 256];
    let res = unsafe { libc::strerror_r(code, buf.as_mut_ptr(), buf.len()) };
    if res != 0 {
        return format!("Unknown error {code}");
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Leave the process right away, skipping destructors and `atexit` handlers.
///
/// Forked copies of the caller use this so they never unwind back into the
/// caller's stack frames.
pub(crate) fn exit_now(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::process::exit;

    #[test]
    fn test_fork_and_waitpid_exit_code() {
        match fork() {
            Ok(Fork::Parent(child)) => {
                assert!(child > 0);
                assert_eq!(waitpid(child).expect("waitpid failed"), Some(7));
            }
            Ok(Fork::Child) => exit(7),
            Err(_) => panic!("Fork failed"),
        }
    }

    #[test]
    fn test_waitpid_killed_by_signal() {
        match fork() {
            Ok(Fork::Parent(child)) => {
                assert_eq!(waitpid(child).expect("waitpid failed"), None);
            }
            Ok(Fork::Child) => {
                unsafe { libc::raise(libc::SIGKILL) };
                exit(0);
            }
            Err(_) => panic!("Fork failed"),
        }
    }

    #[test]
    fn test_waitpid_not_a_child() {
        let err = waitpid(i32::MAX).expect_err("waitpid should fail");
        assert_eq!(err.raw_os_error(), Some(libc::ECHILD));
    }

    #[test]
    fn test_setsid_makes_session_leader() {
        match fork() {
            Ok(Fork::Parent(child)) => {
                assert_eq!(waitpid(child).expect("waitpid failed"), Some(0));
            }
            Ok(Fork::Child) => {
                let code = match setsid() {
                    Ok(sid) if sid == getpid() && getsid().ok() == Some(sid) => 0,
                    _ => 1,
                };
                exit(code);
            }
            Err(_) => panic!("Fork failed"),
        }
    }

    #[test]
    fn test_chdir_moves_to_root() {
        match fork() {
            Ok(Fork::Parent(child)) => {
                assert_eq!(waitpid(child).expect("waitpid failed"), Some(0));
            }
            Ok(Fork::Child) => {
                let in_root = chdir().is_ok()
                    && env::current_dir().ok().as_deref() == Some(std::path::Path::new("/"));
                exit(i32::from(!in_root));
            }
            Err(_) => panic!("Fork failed"),
        }
    }

    #[test]
    fn test_getpgrp_and_getsid_in_parent() {
        assert!(getpgrp().expect("getpgrp should succeed") > 0);
        assert!(getsid().expect("getsid should succeed") > 0);
        assert!(getpid() > 0);
    }

    #[test]
    fn test_describe_errno() {
        let description = describe_errno(libc::ENOENT);
        assert!(!description.is_empty());
        assert!(!description.contains("os error"));
        assert_eq!(
            description,
            io::Error::from_raw_os_error(libc::ENOENT)
                .to_string()
                .trim_end_matches(&format!(" (os error {})", libc::ENOENT))
        );
    }
}
