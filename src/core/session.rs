//! Session management
//!
//! A session owns one pseudo terminal, the terminal engine fed from it, and the
//! I/O thread that moves bytes between the two. The UI thread drives the
//! lifecycle and reads title/bell/dirty state without ever blocking on the
//! I/O thread.
//!
//! # Shutdown
//!
//! ```text
//! close()
//! ├── exited flag set          (pump loop refuses to read again)
//! ├── cancel_pending_read()    (unblocks a read in progress)
//! ├── close_read_side()        (covers reads cancellation cannot reach)
//! ├── join I/O thread
//! └── drop transport + engine  (last Arc goes away)
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::pty::{self, PtyError, PtyTransport};
use super::pump;
use super::term::{CursorStyle, Engine};
use super::title::{default_title_for, TitleScanner, TitleSnapshot};

const BELL_FLASH: Duration = Duration::from_millis(150);
const SCROLLBAR_HOLD: Duration = Duration::from_secs(1);
const SCROLLBAR_FADE: Duration = Duration::from_millis(300);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Spawn(#[from] PtyError),

    #[error("Invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("Failed to spawn I/O thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("Session is not running")]
    NotRunning,

    #[error("Failed to write to session: {0}")]
    Write(#[source] PtyError),
}

/// Parameters for [`Session::open`]
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub cols: u16,
    pub rows: u16,
    /// Program and arguments; `None` launches the platform default shell
    pub command: Option<String>,
    pub scrollback_limit: usize,
    pub cursor_style: CursorStyle,
    pub cursor_blink: bool,
    pub cwd: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            command: None,
            scrollback_limit: 10_000,
            cursor_style: CursorStyle::Block,
            cursor_blink: true,
            cwd: None,
        }
    }
}

/// Session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Running,
            2 => SessionState::StopRequested,
            _ => SessionState::Stopped,
        }
    }
}

/// Flags written by the I/O thread and consumed by the UI and render threads
#[derive(Debug, Default)]
pub struct SessionSignals {
    dirty: AtomicBool,
    bell: AtomicBool,
    exited: AtomicBool,
}

impl SessionSignals {
    /// New output since the last call
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Bell rang since the last call
    pub fn take_bell(&self) -> bool {
        self.bell.swap(false, Ordering::AcqRel)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn ring_bell(&self) {
        self.bell.store(true, Ordering::Release);
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }
}

/// State shared between the session and its I/O thread
pub(crate) struct SessionShared {
    pub(crate) transport: Box<dyn PtyTransport>,
    engine: Mutex<Engine>,
    title: RwLock<TitleSnapshot>,
    pub(crate) signals: Arc<SessionSignals>,
    state: AtomicU8,
}

impl SessionShared {
    pub(crate) fn new(
        transport: Box<dyn PtyTransport>,
        engine: Engine,
        title: TitleSnapshot,
    ) -> Self {
        Self {
            transport,
            engine: Mutex::new(engine),
            title: RwLock::new(title),
            signals: Arc::default(),
            state: AtomicU8::new(SessionState::Created as u8),
        }
    }

    pub(crate) fn lock_engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn title_snapshot(&self) -> RwLockReadGuard<'_, TitleSnapshot> {
        self.title.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn title_mut(&self) -> RwLockWriteGuard<'_, TitleSnapshot> {
        self.title.write().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A cell position in viewport coordinates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellPos {
    pub row: u16,
    pub col: u16,
}

impl CellPos {
    pub fn new(row: u16, col: u16) -> Self {
        Self { row, col }
    }
}

/// Selection coordinates. The session only stores them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub start: CellPos,
    pub end: CellPos,
    /// Mouse button still held
    pub active: bool,
}

impl Selection {
    /// (first, last) in reading order
    pub fn normalized(&self) -> (CellPos, CellPos) {
        if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        }
    }
}

/// A shell session
pub struct Session {
    shared: Arc<SessionShared>,
    io_thread: Option<JoinHandle<()>>,
    selection: Option<Selection>,
    bell_at: Option<Instant>,
    scrolled_at: Option<Instant>,
}

impl Session {
    /// Spawn the configured command on a new pseudo terminal
    pub fn open(options: SessionOptions) -> Result<Self, SessionError> {
        check_size(options.cols, options.rows)?;
        let engine = new_engine(&options);
        let transport = pty::spawn(
            options.cols,
            options.rows,
            options.command.as_deref(),
            options.cwd.as_deref(),
        )?;
        Self::start(transport, engine, &options)
    }

    /// Run a session over an existing transport
    pub fn with_transport(
        transport: Box<dyn PtyTransport>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        check_size(options.cols, options.rows)?;
        let engine = new_engine(&options);
        Self::start(transport, engine, &options)
    }

    fn start(
        transport: Box<dyn PtyTransport>,
        engine: Engine,
        options: &SessionOptions,
    ) -> Result<Self, SessionError> {
        let default_title = match options.command.as_deref() {
            Some(command) => default_title_for(command),
            None => default_title_for(&pty::default_shell()),
        };
        let scanner = TitleScanner::new(default_title);
        let shared = Arc::new(SessionShared::new(transport, engine, scanner.snapshot()));

        // The thread starts reading at once, so it goes last
        let pump_shared = shared.clone();
        let io_thread = thread::Builder::new()
            .name("ptyhost-io".to_string())
            .spawn(move || pump::run(pump_shared, scanner))
            .map_err(|e| {
                tracing::error!("Failed to spawn I/O thread: {}", e);
                SessionError::ThreadSpawn(e)
            })?;

        shared.set_state(SessionState::Running);
        tracing::info!(
            "Session started ({}x{}, {:?})",
            options.cols,
            options.rows,
            options.command
        );

        Ok(Self {
            shared,
            io_thread: Some(io_thread),
            selection: None,
            bell_at: None,
            scrolled_at: None,
        })
    }

    /// Stop the I/O thread and release the transport and engine
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(io_thread) = self.io_thread.take() else {
            return;
        };

        self.shared.set_state(SessionState::StopRequested);
        self.shared.signals.mark_exited();
        self.shared.transport.cancel_pending_read();
        self.shared.transport.close_read_side();

        if io_thread.join().is_err() {
            tracing::error!("I/O thread panicked");
        }

        self.shared.set_state(SessionState::Stopped);
        tracing::info!("Session closed");
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Shared flags, for threads that outlive a borrow of the session
    pub fn signals(&self) -> Arc<SessionSignals> {
        self.shared.signals.clone()
    }

    /// Send input to the child
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.has_exited() {
            return Err(SessionError::NotRunning);
        }
        self.shared.transport.write(data).map_err(|e| {
            tracing::warn!("Write to PTY failed: {}", e);
            SessionError::Write(e)
        })?;
        Ok(())
    }

    /// Send pasted text, bracketed if the application asked for it
    pub fn paste(&self, text: &str) -> Result<(), SessionError> {
        let bracketed = self.shared.lock_engine().bracketed_paste();
        let body = text.replace("\r\n", "\r").replace('\n', "\r");

        let mut data = Vec::with_capacity(body.len() + 12);
        if bracketed {
            data.extend_from_slice(b"\x1b[200~");
        }
        data.extend_from_slice(body.as_bytes());
        if bracketed {
            data.extend_from_slice(b"\x1b[201~");
        }
        self.write(&data)
    }

    /// Resize engine and pseudo terminal. Transport failures are logged only.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            tracing::warn!("Ignoring resize to {}x{}", cols, rows);
            return;
        }

        self.shared.lock_engine().resize(cols, rows);
        if let Err(e) = self.shared.transport.resize(cols, rows) {
            tracing::warn!("PTY resize failed: {}", e);
        }
    }

    /// (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        self.shared.lock_engine().size()
    }

    pub fn title(&self) -> String {
        self.shared.title_snapshot().title.clone()
    }

    /// Raw path from the last OSC 7
    pub fn cwd(&self) -> Option<String> {
        self.shared.title_snapshot().cwd.clone()
    }

    /// New output since the last call
    pub fn is_dirty(&self) -> bool {
        self.shared.signals.take_dirty()
    }

    /// Bell rang since the last call. Starts the flash fade.
    pub fn is_bell_pending(&mut self) -> bool {
        if self.shared.signals.take_bell() {
            self.bell_at = Some(Instant::now());
            true
        } else {
            false
        }
    }

    pub fn has_exited(&self) -> bool {
        self.shared.signals.has_exited()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.shared.transport.exit_code()
    }

    /// Read access to the terminal engine
    pub fn with_engine<R>(&self, f: impl FnOnce(&Engine) -> R) -> R {
        f(&self.shared.lock_engine())
    }

    pub fn start_selection(&mut self, pos: CellPos) {
        self.selection = Some(Selection {
            start: pos,
            end: pos,
            active: true,
        });
    }

    pub fn update_selection(&mut self, pos: CellPos) {
        if let Some(selection) = self.selection.as_mut().filter(|s| s.active) {
            selection.end = pos;
        }
    }

    pub fn end_selection(&mut self) {
        if let Some(selection) = self.selection.as_mut() {
            selection.active = false;
        }
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    /// Text under the selection, or `None` when nothing is selected
    pub fn selected_text(&self) -> Option<String> {
        let (start, end) = self.selection?.normalized();
        let text = self
            .shared
            .lock_engine()
            .text_between((start.row, start.col), (end.row, end.col));
        Some(text)
    }

    /// Positive scrolls up into history
    pub fn scroll_viewport(&mut self, delta: isize) {
        self.shared.lock_engine().scroll_viewport(delta);
        self.scrolled_at = Some(Instant::now());
    }

    pub fn scroll_to_bottom(&mut self) {
        self.shared.lock_engine().scroll_to_bottom();
        self.scrolled_at = Some(Instant::now());
    }

    pub fn viewport_offset(&self) -> usize {
        self.shared.lock_engine().viewport_offset()
    }

    /// Bell flash opacity at `now`, fading from 1 to 0
    pub fn bell_flash_alpha(&self, now: Instant) -> f32 {
        let Some(at) = self.bell_at else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(at);
        if elapsed >= BELL_FLASH {
            0.0
        } else {
            1.0 - elapsed.as_secs_f32() / BELL_FLASH.as_secs_f32()
        }
    }

    /// Scrollbar opacity at `now`: held after a scroll, then faded out
    pub fn scrollbar_alpha(&self, now: Instant) -> f32 {
        let Some(at) = self.scrolled_at else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(at);
        if elapsed < SCROLLBAR_HOLD {
            1.0
        } else if elapsed < SCROLLBAR_HOLD + SCROLLBAR_FADE {
            let fading = elapsed - SCROLLBAR_HOLD;
            1.0 - fading.as_secs_f32() / SCROLLBAR_FADE.as_secs_f32()
        } else {
            0.0
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_size(cols: u16, rows: u16) -> Result<(), SessionError> {
    if cols == 0 || rows == 0 {
        return Err(SessionError::InvalidSize { cols, rows });
    }
    Ok(())
}

fn new_engine(options: &SessionOptions) -> Engine {
    Engine::new(
        options.cols,
        options.rows,
        options.scrollback_limit,
        options.cursor_style,
        options.cursor_blink,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pty::mock::{MockRead, MockState, MockTransport};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    const WAIT: Duration = Duration::from_secs(5);

    fn options() -> SessionOptions {
        SessionOptions {
            command: Some("test-shell".to_string()),
            ..SessionOptions::default()
        }
    }

    fn mock_session() -> (Session, Arc<MockState>) {
        let (transport, state) = MockTransport::new(80, 24);
        let session = Session::with_transport(Box::new(transport), options()).unwrap();
        (session, state)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_close_before_any_output() {
        let (session, state) = mock_session();
        let shared = session.shared.clone();
        assert_eq!(session.state(), SessionState::Running);

        session.close();

        assert_eq!(shared.state(), SessionState::Stopped);
        assert!(shared.signals.has_exited());
        assert!(state.was_cancelled());
        assert_eq!(state.close_count(), 1);
        assert!(state.reads.load(Ordering::SeqCst) <= 1);
        assert!(!state.is_dropped());

        drop(shared);
        assert!(state.is_dropped());
        assert_eq!(state.close_count(), 1);
    }

    #[test]
    fn test_drop_runs_shutdown() {
        let (session, state) = mock_session();
        drop(session);
        assert!(state.was_cancelled());
        assert!(state.is_dropped());
    }

    #[test]
    fn test_eof_marks_exited() {
        let (session, state) = mock_session();
        state.push(MockRead::Eof);

        assert!(wait_for(|| session.has_exited()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(state.reads.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Running);

        assert!(matches!(session.write(b"x"), Err(SessionError::NotRunning)));
        session.close();
    }

    #[test]
    fn test_read_error_marks_exited() {
        let (session, state) = mock_session();
        state.push(MockRead::Error);
        assert!(wait_for(|| session.has_exited()));
        session.close();
    }

    #[test]
    fn test_output_sets_dirty() {
        let (session, state) = mock_session();
        assert!(!session.is_dirty());

        state.push_data(b"hello");
        assert!(wait_for(|| session.is_dirty()));
        assert!(!session.is_dirty());
        assert_eq!(session.with_engine(|e| e.text_between((0, 0), (0, 4))), "hello");
        session.close();
    }

    #[test]
    fn test_bell_pending_and_flash() {
        let (mut session, state) = mock_session();
        assert_eq!(session.bell_flash_alpha(Instant::now()), 0.0);

        state.push_data(b"\x07");
        assert!(wait_for(|| session.is_bell_pending()));
        assert!(!session.is_bell_pending());

        let rang = session.bell_at.unwrap();
        assert_eq!(session.bell_flash_alpha(rang), 1.0);
        let half = session.bell_flash_alpha(rang + Duration::from_millis(75));
        assert!(half > 0.4 && half < 0.6);
        assert_eq!(session.bell_flash_alpha(rang + Duration::from_millis(200)), 0.0);
        session.close();
    }

    #[test]
    fn test_default_title() {
        let (session, _state) = mock_session();
        assert_eq!(session.title(), "test-shell");
        assert_eq!(session.cwd(), None);
        session.close();

        let (transport, _state) = MockTransport::new(80, 24);
        let options = SessionOptions {
            command: Some("C:/Program Files/PowerShell/7/pwsh.exe -NoLogo".to_string()),
            ..SessionOptions::default()
        };
        let session = Session::with_transport(Box::new(transport), options).unwrap();
        assert_eq!(session.title(), "PowerShell");
        session.close();
    }

    #[test]
    fn test_title_batches() {
        let (session, state) = mock_session();

        state.push_data(b"\x1b]7;file://box/home/alice/projects\x07\x1b]0;alice@box\x07");
        assert!(wait_for(|| session.title() == "~/projects"));
        assert_eq!(session.cwd().as_deref(), Some("/home/alice/projects"));

        state.push_data(b"\x1b]0;vim notes.txt\x07");
        assert!(wait_for(|| session.title() == "vim notes.txt"));
        assert_eq!(session.cwd().as_deref(), Some("/home/alice/projects"));
        session.close();
    }

    #[test]
    fn test_title_split_across_reads() {
        let (session, state) = mock_session();
        state.push_data(b"\x1b]2;sp");
        state.push_data(b"lit\x07");
        assert!(wait_for(|| session.title() == "split"));
        session.close();
    }

    #[test]
    fn test_write_and_paste() {
        let (session, state) = mock_session();
        session.write(b"ls\r").unwrap();
        session.paste("a\nb").unwrap();
        assert_eq!(state.written(), b"ls\ra\rb".to_vec());

        state.push_data(b"\x1b[?2004h");
        assert!(wait_for(|| session.with_engine(|e| e.bracketed_paste())));
        session.paste("x").unwrap();
        assert!(state.written().ends_with(b"\x1b[200~x\x1b[201~"));
        session.close();
    }

    #[test]
    fn test_write_failure_is_reported() {
        let (session, state) = mock_session();
        state.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(session.write(b"x"), Err(SessionError::Write(_))));
        assert!(!session.has_exited());
        session.close();
    }

    #[test]
    fn test_resize() {
        let (session, state) = mock_session();
        session.resize(120, 40);
        assert_eq!(session.size(), (120, 40));
        assert_eq!(state.resizes(), vec![(120, 40)]);

        session.resize(0, 10);
        assert_eq!(session.size(), (120, 40));

        state.fail_resize.store(true, Ordering::SeqCst);
        session.resize(100, 30);
        assert_eq!(session.size(), (100, 30));
        assert!(!session.has_exited());
        session.close();
    }

    #[test]
    fn test_cursor_report_written_back() {
        let (session, state) = mock_session();
        state.push_data(b"\x1b[3;7H\x1b[6n");
        assert!(wait_for(|| !state.written().is_empty()));
        assert_eq!(state.written(), b"\x1b[3;7R".to_vec());
        session.close();
    }

    #[test]
    fn test_selection() {
        let (mut session, state) = mock_session();
        assert_eq!(session.selected_text(), None);

        state.push_data(b"first line\r\nsecond");
        assert!(state.wait_drained(WAIT));
        assert!(wait_for(|| session.is_dirty()));

        session.start_selection(CellPos::new(1, 5));
        session.update_selection(CellPos::new(0, 6));
        session.end_selection();
        session.update_selection(CellPos::new(1, 0));

        let selection = session.selection().unwrap();
        assert!(!selection.active);
        assert_eq!(
            selection.normalized(),
            (CellPos::new(0, 6), CellPos::new(1, 5))
        );
        assert_eq!(session.selected_text().as_deref(), Some("line\nsecond"));

        session.clear_selection();
        assert_eq!(session.selection(), None);
        session.close();
    }

    #[test]
    fn test_scrollback_and_scrollbar_fade() {
        let (transport, state) = MockTransport::new(20, 3);
        let options = SessionOptions {
            cols: 20,
            rows: 3,
            ..options()
        };
        let mut session = Session::with_transport(Box::new(transport), options).unwrap();
        assert_eq!(session.scrollbar_alpha(Instant::now()), 0.0);

        state.push_data(b"1\r\n2\r\n3\r\n4\r\n5\r\n6");
        assert!(state.wait_drained(WAIT));
        assert!(wait_for(|| session.is_dirty()));

        session.scroll_viewport(2);
        assert_eq!(session.viewport_offset(), 2);
        let at = session.scrolled_at.unwrap();
        assert_eq!(session.scrollbar_alpha(at + Duration::from_millis(500)), 1.0);
        let fading = session.scrollbar_alpha(at + Duration::from_millis(1150));
        assert!(fading > 0.4 && fading < 0.6);
        assert_eq!(session.scrollbar_alpha(at + Duration::from_millis(1400)), 0.0);

        session.scroll_to_bottom();
        assert_eq!(session.viewport_offset(), 0);
        session.close();
    }

    #[test]
    fn test_invalid_size_rejected() {
        let (transport, _state) = MockTransport::new(80, 24);
        let options = SessionOptions {
            cols: 0,
            ..options()
        };
        let err = Session::with_transport(Box::new(transport), options).err().unwrap();
        assert!(matches!(err, SessionError::InvalidSize { cols: 0, rows: 24 }));
    }

    #[cfg(unix)]
    #[test]
    fn test_real_pty_child_exit() {
        let session = Session::open(SessionOptions {
            command: Some("echo hello".to_string()),
            ..SessionOptions::default()
        })
        .unwrap();

        assert!(wait_for(|| session.has_exited()));
        let screen = session.with_engine(|e| e.text_between((0, 0), (0, 79)));
        assert!(screen.contains("hello"), "screen: {:?}", screen);
        session.close();
    }

    #[cfg(unix)]
    #[test]
    fn test_real_pty_close_while_blocked() {
        let session = Session::open(SessionOptions {
            command: Some("cat".to_string()),
            ..SessionOptions::default()
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(!session.has_exited());

        let started = Instant::now();
        session.close();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
