//! Pseudo-terminal transport
//!
//! A transport owns the child process and the duplex byte channel attached to
//! its console. The session reads from it on a dedicated I/O thread and writes
//! to it from the UI thread, so every operation takes `&self`.
//!
//! Platform implementations:
//!
//! - **conpty**: Windows ConPTY over anonymous pipes
//! - **unix**: `openpty` via portable-pty, read side polled with a cancel pipe

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

#[cfg(windows)]
pub mod conpty;
#[cfg(unix)]
pub mod unix;

#[cfg(test)]
pub(crate) mod mock;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("Failed to create pipe: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("Failed to create pseudo console: {0}")]
    ConsoleCreation(#[source] io::Error),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(#[source] io::Error),

    #[error("Failed to resize pseudo console: {0}")]
    Resize(#[source] io::Error),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),
}

impl PtyError {
    /// Whether this error was raised while building the transport
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            PtyError::InvalidSize { .. }
                | PtyError::PipeCreation(_)
                | PtyError::ConsoleCreation(_)
                | PtyError::ProcessSpawn(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Duplex byte channel to a child process running on a pseudo terminal.
///
/// `read` is only ever called from the session's I/O thread. Every other
/// method may be called from any thread, including while `read` is blocked.
/// Dropping the transport releases the console, the process handle and any
/// handles still open, and must tolerate a read side that was already closed
/// by [`PtyTransport::close_read_side`].
pub trait PtyTransport: Send + Sync {
    /// Blocking read of child output.
    ///
    /// Returns `Ok(0)` at end of stream, which includes the child exiting,
    /// the read being cancelled, and the read side being closed.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Bytes that can be read without blocking. Returns 0 on any error.
    fn data_available(&self) -> usize;

    /// Write input for the child. Returns the number of bytes written.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Resize the pseudo console.
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Unblock a thread currently waiting in `read`.
    fn cancel_pending_read(&self);

    /// Close the read half of the channel. Idempotent.
    fn close_read_side(&self);

    /// Current (cols, rows)
    fn size(&self) -> (u16, u16);

    /// Exit code of the child, once it has exited
    fn exit_code(&self) -> Option<u32> {
        None
    }
}

/// Spawn `command` (or the platform default shell) on a new pseudo terminal.
pub fn spawn(
    cols: u16,
    rows: u16,
    command: Option<&str>,
    cwd: Option<&Path>,
) -> Result<Box<dyn PtyTransport>> {
    if cols == 0 || rows == 0 {
        return Err(PtyError::InvalidSize { cols, rows });
    }

    #[cfg(windows)]
    {
        Ok(Box::new(conpty::ConPty::spawn(cols, rows, command, cwd)?))
    }

    #[cfg(unix)]
    {
        Ok(Box::new(unix::UnixPty::spawn(cols, rows, command, cwd)?))
    }
}

/// Shell launched when no command is configured
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        "cmd.exe".to_string()
    }

    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Terminal size readable and writable through `&self`.
#[derive(Debug)]
pub(crate) struct SizeCell(AtomicU32);

impl SizeCell {
    pub(crate) fn new(cols: u16, rows: u16) -> Self {
        Self(AtomicU32::new(Self::pack(cols, rows)))
    }

    pub(crate) fn get(&self) -> (u16, u16) {
        let packed = self.0.load(Ordering::Acquire);
        ((packed >> 16) as u16, packed as u16)
    }

    pub(crate) fn set(&self, cols: u16, rows: u16) {
        self.0.store(Self::pack(cols, rows), Ordering::Release);
    }

    fn pack(cols: u16, rows: u16) -> u32 {
        (u32::from(cols) << 16) | u32::from(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_cell() {
        let size = SizeCell::new(80, 24);
        assert_eq!(size.get(), (80, 24));

        size.set(u16::MAX, 1);
        assert_eq!(size.get(), (u16::MAX, 1));
    }

    #[test]
    fn test_spawn_rejects_zero_size() {
        let err = spawn(0, 24, None, None).err().expect("zero cols must fail");
        assert!(matches!(err, PtyError::InvalidSize { cols: 0, rows: 24 }));
        assert!(err.is_spawn_failure());

        let err = spawn(80, 0, None, None).err().expect("zero rows must fail");
        assert!(matches!(err, PtyError::InvalidSize { cols: 80, rows: 0 }));
    }

    #[test]
    fn test_default_shell_not_empty() {
        assert!(!default_shell().is_empty());
    }
}
