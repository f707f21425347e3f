use std::io;

use crate::{getpgrp, getpid, getsid};

/// Who the current process is, in terms of job control.
///
/// After a successful double fork the worker is in a session of its own
/// but leads neither that session nor its process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: libc::pid_t,
    pub pgid: libc::pid_t,
    pub sid: libc::pid_t,
}

impl ProcessIdentity {
    /// # Errors
    /// Returns an [`io::Error`] if `getpgrp()` or `getsid()` fails.
    pub fn current() -> io::Result<Self> {
        Ok(Self {
            pid: getpid(),
            pgid: getpgrp()?,
            sid: getsid()?,
        })
    }

    #[must_use]
    pub const fn is_session_leader(&self) -> bool {
        self.pid == self.sid
    }

    #[must_use]
    pub const fn is_group_leader(&self) -> bool {
        self.pid == self.pgid
    }
}
