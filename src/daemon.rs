//! The double fork.
//!
//! ```text
//! caller ──fork #1──> intermediate ──setsid, fork #2──> worker
//!   │                      │                              │
//!   │ reads one report     │ writes pid/errno, exits      │ runs the work,
//!   │ reaps intermediate   │                              │ then _exit(0)
//!   ▼                      ▼                              ▼
//! returns               gone                        reparented to init
//! ```

use std::io;
use std::panic::{self, AssertUnwindSafe};

use os_pipe::{PipeReader, PipeWriter};
use tracing::debug;

use crate::error::{Error, ForkStage, Result, errno};
use crate::report::Report;
use crate::{Fork, exit_now};

/// Exit status of a worker whose work panicked, same as an unhandled panic
/// in `main`.
const PANIC_EXIT_CODE: i32 = 101;

/// Intermediate exit statuses: a step failed and was reported, or the worker
/// was started but its pid could not be written to the caller.
const FAILED_EXIT_CODE: i32 = 1;
const UNREPORTED_EXIT_CODE: i32 = 2;

/// The process-creation calls a [`Daemonizer`] makes.
///
/// [`System`] makes the real system calls; other implementations can fail
/// on purpose.
pub trait ProcessControl {
    /// # Errors
    /// Whatever `fork(2)` reports.
    fn fork(&self) -> io::Result<Fork>;

    /// # Errors
    /// Whatever `setsid(2)` reports.
    fn setsid(&self) -> io::Result<libc::pid_t>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct System;

impl ProcessControl for System {
    fn fork(&self) -> io::Result<Fork> {
        crate::fork()
    }

    fn setsid(&self) -> io::Result<libc::pid_t> {
        crate::setsid()
    }
}

/// What the original caller learns once the worker is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    /// Pid of the worker. It is not a child of the caller and cannot be
    /// waited for, only signalled.
    pub pid: libc::pid_t,
}

/// Where execution continues after [`Daemonizer::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller(Detached),
    Worker,
}

/// Detaches work from the controlling terminal.
///
/// ```no_run
///use double_fork::Daemonizer;
///
///let detached = Daemonizer::new()
///    .chdir(true)
///    .redirect_stdio(true)
///    .spawn(|| std::thread::sleep(std::time::Duration::from_secs(30)))?;
///println!("worker pid: {}", detached.pid);
///# Ok::<(), double_fork::Error>(())
///```
#[derive(Debug, Clone)]
pub struct Daemonizer<C = System> {
    chdir: bool,
    redirect_stdio: bool,
    control: C,
}

impl Daemonizer {
    /// Stays in the current directory and keeps stdio as inherited.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chdir: false,
            redirect_stdio: false,
            control: System,
        }
    }
}

impl Default for Daemonizer {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ProcessControl> Daemonizer<C> {
    /// Change the worker's working directory to `/`.
    #[must_use]
    pub const fn chdir(mut self, chdir: bool) -> Self {
        self.chdir = chdir;
        self
    }

    /// Point the worker's stdin, stdout and stderr at `/dev/null`.
    #[must_use]
    pub const fn redirect_stdio(mut self, redirect: bool) -> Self {
        self.redirect_stdio = redirect;
        self
    }

    /// Use `control` instead of the real `fork`/`setsid` calls.
    pub fn control<D: ProcessControl>(self, control: D) -> Daemonizer<D> {
        Daemonizer {
            chdir: self.chdir,
            redirect_stdio: self.redirect_stdio,
            control,
        }
    }

    /// Run `work` in a detached process and return to the caller.
    ///
    /// The call returns once the worker exists, not when it is done. The
    /// worker leaves with status 0 after `work` returns, or 101 if it
    /// panicked; it never returns into the caller's code. Its stdout is not
    /// flushed on the way out, so `work` should flush what it prints.
    ///
    /// # Errors
    /// Any [`Error`] from [`detach`](Self::detach). Except for
    /// [`Error::Unreported`], `work` has not run and never will when an
    /// error comes back.
    pub fn spawn<F: FnOnce()>(&self, work: F) -> Result<Detached> {
        match self.detach()? {
            Role::Caller(detached) => Ok(detached),
            Role::Worker => run_worker(work),
        }
    }

    /// Do the double fork and return in two places: `Role::Caller` in the
    /// original process and `Role::Worker` in the detached grandchild. The
    /// process in between never returns.
    ///
    /// Code running as `Role::Worker` should finish with `_exit` rather than
    /// unwinding through the caller's frames.
    ///
    /// # Errors
    /// - [`Error::ProcessCreation`] when either fork fails
    /// - [`Error::Session`] when `setsid` fails
    /// - [`Error::Setup`] when the `chdir` or stdio option fails
    /// - [`Error::Pipe`], [`Error::Wait`], [`Error::Intermediate`] when the
    ///   outcome cannot be collected from the intermediate process
    /// - [`Error::Unreported`] when the worker started but its pid was lost
    pub fn detach(&self) -> Result<Role> {
        debug!(
            chdir = self.chdir,
            redirect_stdio = self.redirect_stdio,
            "detaching"
        );
        let (mut reader, writer) = os_pipe::pipe().map_err(Error::Pipe)?;

        match self.control.fork() {
            Ok(Fork::Parent(intermediate)) => {
                drop(writer);
                collect(intermediate, &mut reader)
            }
            Ok(Fork::Child) => {
                drop(reader);
                self.intermediate(writer)
            }
            Err(e) => {
                let err = Error::process_creation(ForkStage::First, errno(&e), None);
                debug!(%err, "could not detach");
                Err(err)
            }
        }
    }

    /// Runs in the first child. Returns only in the worker.
    ///
    /// A fork may have left another thread's locks held forever in this
    /// process, so nothing here allocates or takes a lock: failures go to
    /// the caller as a fixed-size report and the caller formats them.
    fn intermediate(&self, mut writer: PipeWriter) -> Result<Role> {
        if let Err(e) = self.control.setsid() {
            abandon(&mut writer, Report::SessionFailed(errno(&e)));
        }
        if let Err(e) = self.prepare() {
            abandon(&mut writer, Report::SetupFailed(errno(&e)));
        }

        match self.control.fork() {
            Ok(Fork::Parent(worker)) => match Report::Spawned(worker).write_to(&mut writer) {
                Ok(()) => exit_now(0),
                Err(_) => exit_now(UNREPORTED_EXIT_CODE),
            },
            Ok(Fork::Child) => {
                drop(writer);
                Ok(Role::Worker)
            }
            Err(e) => abandon(&mut writer, Report::ForkFailed(errno(&e))),
        }
    }

    fn prepare(&self) -> io::Result<()> {
        if self.chdir {
            crate::chdir()?;
        }
        if self.redirect_stdio {
            crate::redirect_stdio()?;
        }
        Ok(())
    }
}

/// Run `work` synchronously in a detached process.
///
/// Shorthand for `Daemonizer::new().spawn(work)`.
///
/// # Errors
/// See [`Daemonizer::spawn`].
pub fn spawn_daemon<F: FnOnce()>(work: F) -> Result<Detached> {
    Daemonizer::new().spawn(work)
}

/// Caller side: wait for the intermediate's report, then reap it.
fn collect(intermediate: libc::pid_t, reader: &mut PipeReader) -> Result<Role> {
    let report = Report::read_from(reader);

    let status = match crate::waitpid(intermediate) {
        Ok(status) => status,
        // SIGCHLD ignored: the kernel reaped it for us
        Err(e) if e.raw_os_error() == Some(libc::ECHILD) => None,
        Err(e) => return Err(Error::Wait(e)),
    };
    debug!(intermediate, ?status, "reaped intermediate process");

    let outcome = resolve(report.map_err(Error::Pipe)?, status);
    match &outcome {
        Ok(Role::Caller(detached)) => debug!(pid = detached.pid, "worker detached"),
        Ok(Role::Worker) => {}
        Err(err) => debug!(%err, "could not detach"),
    }
    outcome
}

/// Turn the intermediate's report and exit status into the caller's result.
fn resolve(report: Option<Report>, status: Option<i32>) -> Result<Role> {
    match report {
        Some(Report::Spawned(pid)) => Ok(Role::Caller(Detached { pid })),
        Some(Report::SessionFailed(code)) => {
            Err(Error::Session(io::Error::from_raw_os_error(code)))
        }
        Some(Report::SetupFailed(code)) => Err(Error::Setup(io::Error::from_raw_os_error(code))),
        Some(Report::ForkFailed(code)) => {
            Err(Error::process_creation(ForkStage::Second, code, status))
        }
        None if status == Some(UNREPORTED_EXIT_CODE) => Err(Error::Unreported),
        None => Err(Error::Intermediate { status }),
    }
}

/// Intermediate side of a failure: report it to the caller and leave.
fn abandon(writer: &mut PipeWriter, report: Report) -> ! {
    let _ = report.write_to(writer);
    exit_now(FAILED_EXIT_CODE)
}

fn run_worker<F: FnOnce()>(work: F) -> ! {
    let status = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(()) => 0,
        Err(_) => PANIC_EXIT_CODE,
    };
    exit_now(status)
}
