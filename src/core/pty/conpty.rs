//! ConPTY transport for Windows
//!
//! Wraps a pseudo console bound to two anonymous pipes. The output pipe is read
//! with blocking `ReadFile` on the session's I/O thread. `read` holds a shared
//! lock on the handle for the whole call, so the handle is only closed once no
//! `ReadFile` can still be using it. Closing keeps issuing `CancelIoEx` until
//! the exclusive lock is free, which also covers a read that had not started
//! yet when the first cancel went out.

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, TryLockError};
use std::thread;
use std::time::Duration;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_BROKEN_PIPE, ERROR_INVALID_HANDLE, ERROR_OPERATION_ABORTED, HANDLE,
};
use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::Pipes::{CreatePipe, PeekNamedPipe};
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, UpdateProcThreadAttribute, WaitForSingleObject,
    EXTENDED_STARTUPINFO_PRESENT, LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION,
    STARTUPINFOEXW,
};
use windows::Win32::System::IO::CancelIoEx;

use super::{default_shell, PtyError, PtyTransport, Result, SizeCell};

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

/// Pause between cancel attempts while a reader still holds the handle
const CANCEL_RETRY: Duration = Duration::from_millis(1);

/// ConPTY handle wrapper
pub struct ConPty {
    hpc: HPCON,
    input_write: HANDLE,
    /// `None` once the read side has been closed
    output_read: RwLock<Option<HandleGuard>>,
    /// Sticky; set by the first cancel
    cancelled: AtomicBool,
    process: PROCESS_INFORMATION,
    size: SizeCell,
}

// Safety: the raw handles are only used through Win32 calls that are safe to
// issue from any thread; the read handle is only closed under the write lock.
unsafe impl Send for ConPty {}
unsafe impl Sync for ConPty {}

impl ConPty {
    /// Create a pseudo console and launch `command` (default: cmd.exe) on it
    pub fn spawn(cols: u16, rows: u16, command: Option<&str>, cwd: Option<&Path>) -> Result<Self> {
        let command_line = command
            .map(str::to_string)
            .unwrap_or_else(default_shell);
        unsafe { Self::spawn_internal(cols, rows, &command_line, cwd) }
    }

    unsafe fn spawn_internal(
        cols: u16,
        rows: u16,
        command_line: &str,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        // Input pipe (we write, console reads)
        let (input_read, input_write) = create_pipe()?;
        // Output pipe (console writes, we read)
        let (output_read, output_write) = create_pipe()?;

        let hpc = CreatePseudoConsole(coord(cols, rows), input_read.0, output_write.0, 0)
            .map_err(|e| PtyError::ConsoleCreation(e.into()))?;
        let console = ConsoleGuard(Some(hpc));

        // The console duplicated these ends
        drop(input_read);
        drop(output_write);

        let mut attrs = AttributeList::new(hpc)?;

        let mut startup_info = STARTUPINFOEXW {
            StartupInfo: std::mem::zeroed(),
            lpAttributeList: attrs.as_raw(),
        };
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

        let mut cmd_wide: Vec<u16> = command_line
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let cwd_wide: Option<Vec<u16>> = cwd.map(|dir| {
            dir.as_os_str()
                .encode_wide()
                .chain(std::iter::once(0))
                .collect()
        });
        let cwd_ptr = cwd_wide
            .as_ref()
            .map(|w| PCWSTR(w.as_ptr()))
            .unwrap_or(PCWSTR::null());

        let mut process = PROCESS_INFORMATION::default();
        CreateProcessW(
            PCWSTR::null(),
            PWSTR(cmd_wide.as_mut_ptr()),
            None,
            None,
            false,
            EXTENDED_STARTUPINFO_PRESENT,
            None,
            cwd_ptr,
            &startup_info.StartupInfo,
            &mut process,
        )
        .map_err(|e| PtyError::ProcessSpawn(e.into()))?;

        drop(attrs);

        tracing::debug!(
            "ConPTY spawned pid={} size={}x{} command={:?}",
            process.dwProcessId,
            cols,
            rows,
            command_line
        );

        Ok(ConPty {
            hpc: console.release(),
            input_write: input_write.release(),
            output_read: RwLock::new(Some(output_read)),
            cancelled: AtomicBool::new(false),
            process,
            size: SizeCell::new(cols, rows),
        })
    }

    fn read_side(&self) -> RwLockReadGuard<'_, Option<HandleGuard>> {
        self.output_read.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl PtyTransport for ConPty {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        // Held across ReadFile; close_read_side waits for it to be released
        let guard = self.read_side();
        let Some(handle) = guard.as_ref() else {
            return Ok(0);
        };
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(0);
        }

        let mut read: u32 = 0;
        match unsafe { ReadFile(handle.0, Some(buf), Some(&mut read), None) } {
            Ok(()) => Ok(read as usize),
            Err(e) if is_end_of_stream(&e) => Ok(0),
            Err(e) => Err(PtyError::Read(e.into())),
        }
    }

    fn data_available(&self) -> usize {
        let guard = self.read_side();
        let Some(handle) = guard.as_ref() else {
            return 0;
        };

        let mut available: u32 = 0;
        let peeked = unsafe { PeekNamedPipe(handle.0, None, 0, None, Some(&mut available), None) };
        match peeked {
            Ok(()) => available as usize,
            Err(_) => 0,
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let mut total = 0;
        while total < data.len() {
            let mut written: u32 = 0;
            unsafe {
                WriteFile(self.input_write, Some(&data[total..]), Some(&mut written), None)
                    .map_err(|e| PtyError::Write(e.into()))?;
            }
            if written == 0 {
                break;
            }
            total += written as usize;
        }
        Ok(total)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        unsafe {
            ResizePseudoConsole(self.hpc, coord(cols, rows))
                .map_err(|e| PtyError::Resize(e.into()))?;
        }
        self.size.set(cols, rows);
        Ok(())
    }

    fn cancel_pending_read(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.read_side().as_ref() {
            unsafe {
                let _ = CancelIoEx(handle.0, None);
            }
        }
    }

    fn close_read_side(&self) {
        self.cancelled.store(true, Ordering::Release);
        loop {
            match self.output_read.try_write() {
                Ok(mut slot) => {
                    drop(slot.take());
                    return;
                }
                Err(TryLockError::Poisoned(e)) => {
                    drop(e.into_inner().take());
                    return;
                }
                Err(TryLockError::WouldBlock) => {
                    // A reader is in, or about to enter, ReadFile
                    self.cancel_pending_read();
                    thread::sleep(CANCEL_RETRY);
                }
            }
        }
    }

    fn size(&self) -> (u16, u16) {
        self.size.get()
    }

    fn exit_code(&self) -> Option<u32> {
        unsafe {
            // WAIT_OBJECT_0 = 0 means signaled (exited)
            if WaitForSingleObject(self.process.hProcess, 0).0 != 0 {
                return None;
            }
            let mut exit_code: u32 = 0;
            GetExitCodeProcess(self.process.hProcess, &mut exit_code).ok()?;
            Some(exit_code)
        }
    }
}

impl Drop for ConPty {
    fn drop(&mut self) {
        // Read side first: closing the console blocks while its output is unread
        self.close_read_side();

        unsafe {
            ClosePseudoConsole(self.hpc);
            let _ = CloseHandle(self.input_write);
            let _ = CloseHandle(self.process.hProcess);
            let _ = CloseHandle(self.process.hThread);
        }
    }
}

fn coord(cols: u16, rows: u16) -> COORD {
    COORD {
        X: cols.min(i16::MAX as u16) as i16,
        Y: rows.min(i16::MAX as u16) as i16,
    }
}

fn is_end_of_stream(err: &windows::core::Error) -> bool {
    [ERROR_BROKEN_PIPE, ERROR_OPERATION_ABORTED, ERROR_INVALID_HANDLE]
        .iter()
        .any(|code| err.code() == code.to_hresult())
}

unsafe fn create_pipe() -> Result<(HandleGuard, HandleGuard)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    CreatePipe(&mut read, &mut write, None, 0).map_err(|e| PtyError::PipeCreation(e.into()))?;
    Ok((HandleGuard(read), HandleGuard(write)))
}

/// Closes the handle on drop unless released
struct HandleGuard(HANDLE);

impl HandleGuard {
    fn release(mut self) -> HANDLE {
        std::mem::take(&mut self.0)
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.0 .0.is_null() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// Closes the pseudo console on drop unless released
struct ConsoleGuard(Option<HPCON>);

impl ConsoleGuard {
    fn release(mut self) -> HPCON {
        self.0.take().unwrap_or_default()
    }
}

impl Drop for ConsoleGuard {
    fn drop(&mut self) {
        if let Some(hpc) = self.0.take() {
            unsafe { ClosePseudoConsole(hpc) };
        }
    }
}

/// Process attribute list carrying the pseudo console
struct AttributeList {
    // usize storage keeps the list pointer-aligned
    buffer: Vec<usize>,
}

impl AttributeList {
    unsafe fn new(hpc: HPCON) -> Result<Self> {
        let mut size: usize = 0;
        // Size query; fails by design with ERROR_INSUFFICIENT_BUFFER
        let _ = InitializeProcThreadAttributeList(
            LPPROC_THREAD_ATTRIBUTE_LIST::default(),
            1,
            0,
            &mut size,
        );

        let word = std::mem::size_of::<usize>();
        let words = ((size + word - 1) / word).max(1);
        let mut list = Self {
            buffer: vec![0usize; words],
        };

        if let Err(e) = InitializeProcThreadAttributeList(list.as_raw(), 1, 0, &mut size) {
            // Nothing initialized yet, so skip DeleteProcThreadAttributeList
            list.buffer.clear();
            return Err(PtyError::ProcessSpawn(e.into()));
        }

        UpdateProcThreadAttribute(
            list.as_raw(),
            0,
            PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
            Some(hpc.0 as *const c_void),
            std::mem::size_of::<HPCON>(),
            None,
            None,
        )
        .map_err(|e| PtyError::ProcessSpawn(e.into()))?;

        Ok(list)
    }

    fn as_raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut c_void)
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            unsafe { DeleteProcThreadAttributeList(self.as_raw()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn read_to_end(pty: &ConPty) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match pty.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&out).contains("hello") {
                        break;
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_conpty_echo() {
        let pty = ConPty::spawn(80, 24, Some("cmd.exe /c echo hello"), None).unwrap();
        let out = read_to_end(&pty);
        assert!(String::from_utf8_lossy(&out).contains("hello"));
    }

    #[test]
    fn test_close_read_side_then_drop() {
        let pty = ConPty::spawn(80, 24, Some("cmd.exe"), None).unwrap();
        pty.cancel_pending_read();
        pty.close_read_side();
        pty.close_read_side();

        let mut buf = [0u8; 16];
        assert_eq!(pty.read(&mut buf).unwrap(), 0);
        assert_eq!(pty.data_available(), 0);
        drop(pty);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let pty = ConPty::spawn(80, 24, Some("cmd.exe"), None).unwrap();
        pty.cancel_pending_read();

        // Nothing was pending, yet the next read still returns at once
        let mut buf = [0u8; 16];
        assert_eq!(pty.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_close_read_side_waits_for_blocked_reader() {
        let pty = Arc::new(ConPty::spawn(80, 24, Some("cmd.exe"), None).unwrap());
        let (tx, rx) = mpsc::channel();

        let reader = {
            let pty = pty.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                // Drain the banner until the read is cancelled
                loop {
                    match pty.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                let _ = tx.send(());
            })
        };

        thread::sleep(Duration::from_millis(200));
        pty.close_read_side();

        rx.recv_timeout(Duration::from_secs(5))
            .expect("reader stayed blocked after close");
        reader.join().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(pty.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_resize_updates_size() {
        let pty = ConPty::spawn(80, 24, Some("cmd.exe"), None).unwrap();
        pty.resize(100, 40).unwrap();
        assert_eq!(pty.size(), (100, 40));
    }
}
