use std::path::PathBuf;
use std::time::Duration;
use std::{fmt, io};
use thiserror::Error;

use crate::describe_errno;

/// Which of the two forks of a detach attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkStage {
    /// The fork in the original caller.
    First,
    /// The fork in the session leader that would have produced the worker.
    Second,
}

impl ForkStage {
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

impl fmt::Display for ForkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Errors reported to the caller of [`Daemonizer::spawn`](crate::Daemonizer::spawn)
/// and [`Daemonizer::detach`](crate::Daemonizer::detach).
#[derive(Debug, Error)]
pub enum Error {
    /// A fork failed; `code` is the errno, `description` its `strerror` text.
    /// For the second fork, `exit_status` is how the intermediate process
    /// exited (always non-zero).
    #[error("fork #{stage} failed: {code} ({description})")]
    ProcessCreation {
        stage: ForkStage,
        code: i32,
        description: String,
        exit_status: Option<i32>,
    },

    #[error("setsid failed: {0}")]
    Session(#[source] io::Error),

    /// Changing directory or redirecting stdio failed before the second fork.
    #[error("failed to prepare detached process: {0}")]
    Setup(#[source] io::Error),

    #[error("status pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to reap intermediate process: {0}")]
    Wait(#[source] io::Error),

    /// The intermediate process went away without saying what happened.
    #[error("intermediate process exited without a report (exit status: {status:?})")]
    Intermediate { status: Option<i32> },

    /// The worker was started but its pid never reached the caller. Unlike
    /// every other variant, the work may be running.
    #[error("worker started but its pid could not be reported")]
    Unreported,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn process_creation(stage: ForkStage, code: i32, exit_status: Option<i32>) -> Self {
        Self::ProcessCreation {
            stage,
            code,
            description: describe_errno(code),
            exit_status,
        }
    }

    /// The errno behind this error, if there is one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::ProcessCreation { code, .. } => Some(*code),
            Self::Session(e) | Self::Setup(e) | Self::Pipe(e) | Self::Wait(e) => e.raw_os_error(),
            Self::Intermediate { .. } | Self::Unreported => None,
        }
    }
}

/// Errors of the resource key file operations in [`KeyFile`](crate::KeyFile).
#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("could not open key file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// None of these keys were marked in use.
    #[error("key(s) not in use in the key file: {}", .0.join(" "))]
    NotFound(Vec<String>),

    #[error("no key became available within {0:?}")]
    TimedOut(Duration),

    #[error("key file I/O: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Detach(#[from] Error),
}

impl KeyFileError {
    /// Process exit status for this error, as the `mresource` binary reports
    /// it.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Open { .. } | Self::Io(_) | Self::Detach(_) => 1,
            Self::NotFound(_) => 2,
            Self::TimedOut(_) => 4,
        }
    }
}

/// Errno of a failed call; errors without one count as `EIO`.
pub(crate) fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
