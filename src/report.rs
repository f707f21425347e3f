//! One-message status channel from the intermediate process to the caller.
//!
//! A message is a tag byte followed by a native-endian `i32`, either the
//! worker pid or the errno of the step that failed. Both ends live on the
//! same host, so byte order never crosses machines.

use std::io::{self, Read, Write};

const LEN: usize = 5;

const SPAWNED: u8 = 0;
const SESSION_FAILED: u8 = 1;
const SETUP_FAILED: u8 = 2;
const FORK_FAILED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Report {
    Spawned(libc::pid_t),
    SessionFailed(i32),
    SetupFailed(i32),
    ForkFailed(i32),
}

impl Report {
    fn encode(self) -> [u8; LEN] {
        let (tag, value) = match self {
            Self::Spawned(pid) => (SPAWNED, pid),
            Self::SessionFailed(code) => (SESSION_FAILED, code),
            Self::SetupFailed(code) => (SETUP_FAILED, code),
            Self::ForkFailed(code) => (FORK_FAILED, code),
        };
        let [a, b, c, d] = value.to_ne_bytes();
        [tag, a, b, c, d]
    }

    fn decode(bytes: [u8; LEN]) -> io::Result<Self> {
        let [tag, a, b, c, d] = bytes;
        let value = i32::from_ne_bytes([a, b, c, d]);
        match tag {
            SPAWNED => Ok(Self::Spawned(value)),
            SESSION_FAILED => Ok(Self::SessionFailed(value)),
            SETUP_FAILED => Ok(Self::SetupFailed(value)),
            FORK_FAILED => Ok(Self::ForkFailed(value)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown report tag {other}"),
            )),
        }
    }

    pub(crate) fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())
    }

    /// Read exactly one report. `None` means the writer went away first.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; LEN];
        match reader.read_exact(&mut buf) {
            Ok(()) => Self::decode(buf).map(Some),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}
