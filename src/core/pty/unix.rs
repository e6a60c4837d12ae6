//! Unix pseudo-terminal transport
//!
//! portable-pty allocates the pty pair and spawns the child. Reads go through a
//! `dup` of the master descriptor owned here, so the read side can be closed
//! without touching the master used for writes and resizes. A blocked `read`
//! waits in `poll` on that descriptor plus a self-pipe; writing a byte to the
//! pipe is the cancellation. The pipe is never drained, so once cancelled every
//! later `read` returns immediately.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::{default_shell, PtyError, PtyTransport, Result, SizeCell};

/// Unix pty handle wrapper
pub struct UnixPty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    /// Read half; `None` once closed
    reader: RwLock<Option<OwnedFd>>,
    cancel: CancelPipe,
    size: SizeCell,
}

impl UnixPty {
    /// Open a pty pair and launch `command` (default: `$SHELL`) on the slave side.
    ///
    /// The command string is split with shell quoting rules into program and arguments.
    pub fn spawn(cols: u16, rows: u16, command: Option<&str>, cwd: Option<&Path>) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| PtyError::ConsoleCreation(other(e)))?;

        let master_fd = pair.master.as_raw_fd().ok_or_else(|| {
            PtyError::ConsoleCreation(io::Error::new(
                io::ErrorKind::Other,
                "pty master has no file descriptor",
            ))
        })?;
        let reader = dup_cloexec(master_fd).map_err(PtyError::PipeCreation)?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::PipeCreation(other(e)))?;
        let cancel = CancelPipe::new().map_err(PtyError::PipeCreation)?;

        let cmd = build_command(command, cwd)?;

        // Last fallible step, so nothing has to stop the child on error
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::ProcessSpawn(other(e)))?;

        // The child holds the slave now; keeping ours open would hide EOF
        drop(pair.slave);

        tracing::debug!(
            "pty spawned pid={:?} size={}x{} command={:?}",
            child.process_id(),
            cols,
            rows,
            command
        );

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            reader: RwLock::new(Some(reader)),
            cancel,
            size: SizeCell::new(cols, rows),
        })
    }

    fn child(&self) -> MutexGuard<'_, Box<dyn Child + Send + Sync>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PtyTransport for UnixPty {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        // Held for the whole wait; close_read_side cancels before taking the
        // write lock, so this guard is always released promptly.
        let guard = self.reader.read().unwrap_or_else(|e| e.into_inner());
        let Some(reader) = guard.as_ref() else {
            return Ok(0);
        };
        let fd = reader.as_raw_fd();

        loop {
            let mut fds = [
                libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.cancel.read.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(PtyError::Read(err));
            }

            if fds[1].revents != 0 || fds[0].revents & libc::POLLNVAL != 0 {
                return Ok(0);
            }
            if fds[0].revents == 0 {
                continue;
            }

            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                // Linux reports a hung-up master as EIO
                Some(libc::EIO) => return Ok(0),
                _ => return Err(PtyError::Read(err)),
            }
        }
    }

    fn data_available(&self) -> usize {
        let Ok(guard) = self.reader.try_read() else {
            return 0;
        };
        let Some(reader) = guard.as_ref() else {
            return 0;
        };

        let mut available: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(
                reader.as_raw_fd(),
                libc::FIONREAD,
                &mut available as *mut libc::c_int,
            )
        };
        if rc < 0 {
            0
        } else {
            available.max(0) as usize
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(data).map_err(PtyError::Write)?;
        writer.flush().map_err(PtyError::Write)?;
        Ok(data.len())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::Resize(other(e)))?;
        self.size.set(cols, rows);
        Ok(())
    }

    fn cancel_pending_read(&self) {
        self.cancel.signal();
    }

    fn close_read_side(&self) {
        // Make sure a blocked reader lets go of the lock first
        self.cancel.signal();
        let mut reader = self.reader.write().unwrap_or_else(|e| e.into_inner());
        if reader.take().is_some() {
            tracing::debug!("pty read side closed");
        }
    }

    fn size(&self) -> (u16, u16) {
        self.size.get()
    }

    fn exit_code(&self) -> Option<u32> {
        let status = self.child().try_wait().ok().flatten()?;
        Some(status.exit_code())
    }
}

impl Drop for UnixPty {
    fn drop(&mut self) {
        self.close_read_side();

        let mut child = self.child();
        if matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Self-pipe used to wake a reader blocked in `poll`
struct CancelPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl CancelPipe {
    fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: pipe() just returned these descriptors and nothing else owns them
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        set_fd_flag(read.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
        set_fd_flag(write.as_raw_fd(), libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
        set_fd_flag(write.as_raw_fd(), libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;

        Ok(Self { read, write })
    }

    fn signal(&self) {
        let byte = 1u8;
        // A full pipe already means "cancelled"
        let _ = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                (&byte as *const u8).cast::<libc::c_void>(),
                1,
            )
        };
    }
}

fn build_command(command: Option<&str>, cwd: Option<&Path>) -> Result<CommandBuilder> {
    let line = command.map(str::to_string).unwrap_or_else(default_shell);
    let parts = shell_words::split(&line).map_err(|e| {
        PtyError::ProcessSpawn(io::Error::new(io::ErrorKind::InvalidInput, e))
    })?;
    let (program, args) = parts.split_first().ok_or_else(|| {
        PtyError::ProcessSpawn(io::Error::new(io::ErrorKind::InvalidInput, "empty command"))
    })?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    cmd.env("TERM", "xterm-256color");
    Ok(cmd)
}

fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: fcntl returned a fresh descriptor owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn set_fd_flag(fd: RawFd, get: libc::c_int, set: libc::c_int, flag: libc::c_int) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, get) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, set, flags | flag) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn other(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn read_all(pty: &UnixPty) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match pty.read(&mut buf) {
                Ok(0) | Err(_) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[test]
    fn test_read_until_child_exits() {
        let pty = UnixPty::spawn(80, 24, Some("echo hello"), None).unwrap();
        let out = read_all(&pty);
        assert!(String::from_utf8_lossy(&out).contains("hello"));

        // End of stream is sticky
        let mut buf = [0u8; 16];
        assert_eq!(pty.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_exit_code_after_exit() {
        let pty = UnixPty::spawn(80, 24, Some("true"), None).unwrap();
        let _ = read_all(&pty);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut code = None;
        while code.is_none() && Instant::now() < deadline {
            code = pty.exit_code();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(code, Some(0));
    }

    #[test]
    fn test_cancel_unblocks_reader() {
        let pty = Arc::new(UnixPty::spawn(80, 24, Some("cat"), None).unwrap());
        let (tx, rx) = mpsc::channel();

        let reader = {
            let pty = pty.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                let result = pty.read(&mut buf).map_err(|e| e.to_string());
                let _ = tx.send(result);
            })
        };

        thread::sleep(Duration::from_millis(50));
        pty.cancel_pending_read();

        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reader stayed blocked after cancel");
        assert_eq!(result, Ok(0));
        reader.join().unwrap();
    }

    #[test]
    fn test_close_read_side_then_drop() {
        let pty = UnixPty::spawn(80, 24, Some("cat"), None).unwrap();
        pty.cancel_pending_read();
        pty.close_read_side();
        pty.close_read_side();

        let mut buf = [0u8; 16];
        assert_eq!(pty.read(&mut buf).unwrap(), 0);
        assert_eq!(pty.data_available(), 0);
        drop(pty);
    }

    #[test]
    fn test_write_reaches_child() {
        let pty = UnixPty::spawn(80, 24, Some("cat"), None).unwrap();
        assert_eq!(pty.write(b"ping\n").unwrap(), 5);

        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&seen).contains("ping") && Instant::now() < deadline {
            let n = pty.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        assert!(String::from_utf8_lossy(&seen).contains("ping"));
    }

    #[test]
    fn test_resize_updates_size() {
        let pty = UnixPty::spawn(80, 24, Some("cat"), None).unwrap();
        pty.resize(120, 40).unwrap();
        assert_eq!(pty.size(), (120, 40));
    }

    #[test]
    fn test_empty_command_is_spawn_failure() {
        let err = UnixPty::spawn(80, 24, Some("   "), None)
            .err()
            .expect("empty command must fail");
        assert!(err.is_spawn_failure());
    }

    #[test]
    fn test_quoted_arguments_reach_child() {
        let pty = UnixPty::spawn(80, 24, Some("sh -c 'echo quoted-ok'"), None).unwrap();
        let out = String::from_utf8_lossy(&read_all(&pty)).into_owned();
        assert!(out.contains("quoted-ok"), "unexpected output: {:?}", out);
        assert!(!out.contains("Unterminated"));
    }

    #[test]
    fn test_unbalanced_quote_is_spawn_failure() {
        let err = UnixPty::spawn(80, 24, Some("sh -c 'echo"), None)
            .err()
            .expect("unbalanced quote must fail");
        assert!(err.is_spawn_failure());
    }
}
