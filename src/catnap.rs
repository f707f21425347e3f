//! Sample work for a detached process: take a nap, then leave a note.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::info;

pub const NAP: Duration = Duration::from_secs(60);
/// Relative, so the note lands in the working directory of the worker.
pub const NOTE_PATH: &str = "hi";
pub const NOTE: &str = "B: Waking up after catnap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catnap {
    nap: Duration,
    path: PathBuf,
    note: String,
}

impl Default for Catnap {
    fn default() -> Self {
        Self {
            nap: NAP,
            path: PathBuf::from(NOTE_PATH),
            note: NOTE.to_string(),
        }
    }
}

impl Catnap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_nap(mut self, nap: Duration) -> Self {
        self.nap = nap;
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sleep, then create (or truncate) the note file and write the note as
    /// a single line.
    ///
    /// # Errors
    /// Returns an [`io::Error`] if the file cannot be created or written.
    pub fn run(&self) -> io::Result<()> {
        info!(nap = ?self.nap, "A: Going to sleep");
        thread::sleep(self.nap);
        info!(path = %self.path.display(), "{}", self.note);

        let mut file = File::create(&self.path)?;
        writeln!(file, "{}", self.note)?;
        Ok(())
    }
}
