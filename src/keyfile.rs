//! File-based resource key allocator.
//!
//! A key file holds one key per line. The first byte of a line marks the key
//! as in use (`!`) or free (` `). Every read-modify-write of the file happens
//! under a whole-file `fcntl` write lock, so any number of processes can
//! share it.
//!
//! ```text
//!  gpu0
//! !gpu1
//!  gpu2
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::daemon::{Daemonizer, Detached};
use crate::error::KeyFileError;

pub const IN_USE: u8 = b'!';
pub const FREE: u8 = b' ';
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

type Result<T> = std::result::Result<T, KeyFileError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a new key file with every key free, replacing any existing one.
    ///
    /// # Errors
    /// [`KeyFileError::Open`] if the file cannot be created, or
    /// [`KeyFileError::Io`] if writing fails.
    pub fn create<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        info!(path = %self.path.display(), count = keys.len(), "creating key file");
        let mut file = File::create(&self.path).map_err(|source| self.open_error(source))?;
        file.write_all(render(keys).as_bytes())?;
        Ok(())
    }

    /// Add free keys at the end of a key file that may be in use.
    ///
    /// # Errors
    /// [`KeyFileError::Open`] if the file cannot be opened, or
    /// [`KeyFileError::Io`] if locking or writing fails.
    pub fn append<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        info!(path = %self.path.display(), count = keys.len(), "appending keys");
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|source| self.open_error(source))?;
        let _lock = WriteLock::acquire(&file)?;
        (&file).write_all(render(keys).as_bytes())?;
        Ok(())
    }

    /// Take the first free key, marking it in use. While none is free, look
    /// again every `poll` until `timeout` has passed; `None` waits forever.
    ///
    /// # Errors
    /// [`KeyFileError::TimedOut`] if no key became free in time,
    /// [`KeyFileError::Open`] or [`KeyFileError::Io`] if the file cannot be
    /// used.
    pub fn obtain(&self, timeout: Option<Duration>, poll: Duration) -> Result<String> {
        info!(path = %self.path.display(), ?timeout, "obtaining a key");
        let started = Instant::now();
        loop {
            if let Some(key) = self.try_obtain()? {
                info!(path = %self.path.display(), key = %key, "key obtained");
                return Ok(key);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(KeyFileError::TimedOut(limit));
                }
            }
            debug!(?poll, "no free key");
            thread::sleep(poll);
        }
    }

    /// Mark `keys` free again. Keys that are not in use are skipped and
    /// reported together once the others are released.
    ///
    /// # Errors
    /// [`KeyFileError::NotFound`] with the skipped keys,
    /// [`KeyFileError::Open`] or [`KeyFileError::Io`] if the file cannot be
    /// used.
    pub fn release<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        let file = self.open()?;
        let _lock = WriteLock::acquire(&file)?;
        let mut content = String::new();
        (&file).read_to_string(&mut content)?;

        let mut released = Vec::new();
        let mut missing = Vec::new();
        for key in keys {
            let key: &str = key.as_ref();
            let found = entries(&content).find(|entry| {
                entry.marker == IN_USE && entry.key == key && !released.contains(&entry.offset)
            });
            match found {
                Some(entry) => {
                    file.write_all_at(&[FREE], entry.offset)?;
                    released.push(entry.offset);
                    info!(path = %self.path.display(), key, "key released");
                }
                None => missing.push(key.to_string()),
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(KeyFileError::NotFound(missing))
        }
    }

    /// Release `keys` once `delay` has passed. A zero delay releases them
    /// now; otherwise a detached process waits and releases them while the
    /// caller carries on, and its pid is returned.
    ///
    /// # Errors
    /// [`KeyFileError::Open`] if the file cannot be opened up front,
    /// [`KeyFileError::Detach`] if the releasing process could not be
    /// started, or any error of [`release`](Self::release) when there is no
    /// delay.
    pub fn release_after(&self, keys: Vec<String>, delay: Duration) -> Result<Option<Detached>> {
        // fail before detaching when the file is not usable at all
        drop(self.open()?);

        if delay.is_zero() {
            self.release(&keys)?;
            return Ok(None);
        }

        let file = self.clone();
        let detached = Daemonizer::new().spawn(move || {
            thread::sleep(delay);
            if let Err(e) = file.release(&keys) {
                error!(path = %file.path.display(), "delayed release failed: {e}");
            }
        })?;
        info!(pid = detached.pid, ?delay, "release scheduled");
        Ok(Some(detached))
    }

    fn try_obtain(&self) -> Result<Option<String>> {
        let file = self.open()?;
        let _lock = WriteLock::acquire(&file)?;
        let mut content = String::new();
        (&file).read_to_string(&mut content)?;

        match entries(&content).find(|entry| entry.marker != IN_USE) {
            Some(entry) => {
                file.write_all_at(&[IN_USE], entry.offset)?;
                Ok(Some(entry.key.to_string()))
            }
            None => Ok(None),
        }
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| self.open_error(source))
    }

    fn open_error(&self, source: io::Error) -> KeyFileError {
        KeyFileError::Open {
            path: self.path.clone(),
            source,
        }
    }
}

/// A key line and the byte offset of its marker.
#[derive(Debug, PartialEq, Eq)]
struct Entry<'a> {
    offset: u64,
    marker: u8,
    key: &'a str,
}

/// Key lines of `content`; blank lines carry no key and are skipped.
fn entries(content: &str) -> impl Iterator<Item = Entry<'_>> {
    let mut offset = 0u64;
    content.split_inclusive('\n').filter_map(move |line| {
        let start = offset;
        offset += line.len() as u64;
        let line = line.trim_end_matches('\n');
        let marker = *line.as_bytes().first()?;
        let key = line.get(1..)?;
        (!key.is_empty()).then_some(Entry {
            offset: start,
            marker,
            key,
        })
    })
}

fn render<S: AsRef<str>>(keys: &[S]) -> String {
    let mut lines = String::new();
    for key in keys {
        lines.push(char::from(FREE));
        lines.push_str(key.as_ref());
        lines.push('\n');
    }
    lines
}

/// Whole-file `fcntl` write lock, released on drop. Waits while another
/// process holds it.
struct WriteLock<'a> {
    file: &'a File,
}

impl<'a> WriteLock<'a> {
    fn acquire(file: &'a File) -> io::Result<Self> {
        set_lock(file, libc::F_WRLCK, libc::F_SETLKW)?;
        Ok(Self { file })
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        let _ = set_lock(self.file, libc::F_UNLCK, libc::F_SETLK);
    }
}

fn set_lock(file: &File, kind: libc::c_int, cmd: libc::c_int) -> io::Result<()> {
    let kind = libc::c_short::try_from(kind)
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let whence = libc::c_short::try_from(libc::SEEK_SET)
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

    // l_start and l_len of 0 cover the whole file, however long it grows
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind;
    lock.l_whence = whence;

    loop {
        let res = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &raw const lock) };
        if res != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
