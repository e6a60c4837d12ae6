//! Host terminal surface
//!
//! Draws a session into the terminal ptyhost itself runs in. The engine's
//! formatted contents are replayed as-is, then the selection, scroll indicator
//! and cursor are drawn over them.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossterm::{
    cursor::{Hide, MoveTo, SetCursorStyle, Show},
    event::{
        DisableBracketedPaste, DisableMouseCapture, EnableBracketedPaste, EnableMouseCapture,
    },
    execute, queue,
    style::{Attribute, Print, ResetColor, SetAttribute},
    terminal::{self, EnterAlternateScreen, LeaveAlternateScreen, SetTitle},
};

use crate::core::render_timer::RenderTarget;
use crate::core::session::{Selection, Session};
use crate::core::term::CursorStyle;

/// Redraw requests coming from the render timer
#[derive(Debug)]
pub struct HostTarget {
    redraw: AtomicBool,
    cursor_visible: AtomicBool,
}

impl HostTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            redraw: AtomicBool::new(true),
            cursor_visible: AtomicBool::new(true),
        })
    }

    /// A redraw was requested since the last call
    pub fn take_redraw(&self) -> bool {
        self.redraw.swap(false, Ordering::AcqRel)
    }

    /// Blink phase
    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible.load(Ordering::Acquire)
    }
}

impl RenderTarget for HostTarget {
    fn request_redraw(&self) {
        self.redraw.store(true, Ordering::Release);
    }

    fn set_cursor_visible(&self, visible: bool) {
        self.cursor_visible.store(visible, Ordering::Release);
    }
}

/// Terminal host
pub struct Host {
    initialized: bool,
    last_title: String,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        Self {
            initialized: false,
            last_title: String::new(),
        }
    }

    /// Host terminal size (cols, rows)
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }

    /// Enter raw mode and the alternate screen
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        execute!(
            io::stdout(),
            EnterAlternateScreen,
            EnableMouseCapture,
            EnableBracketedPaste
        )?;
        self.initialized = true;
        tracing::debug!("Host terminal initialized");
        Ok(())
    }

    /// Restore the host terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            SetCursorStyle::DefaultUserShape,
            Show,
            DisableBracketedPaste,
            DisableMouseCapture,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();
        terminal::disable_raw_mode()
    }

    /// Draw the session. `blink_on` is the render timer's cursor phase.
    pub fn render(&mut self, session: &mut Session, blink_on: bool) -> io::Result<()> {
        let mut stdout = io::stdout().lock();

        let title = session.title();
        if title != self.last_title {
            queue!(stdout, SetTitle(&title))?;
            self.last_title = title;
        }

        if session.is_bell_pending() {
            stdout.write_all(b"\x07")?;
        }

        let (contents, cursor, offset, cols) = session.with_engine(|engine| {
            (
                engine.contents_formatted(),
                engine.cursor(),
                engine.viewport_offset(),
                engine.size().0,
            )
        });

        // Synchronized update
        stdout.write_all(b"\x1b[?2026h")?;
        queue!(stdout, Hide)?;
        stdout.write_all(&contents)?;

        if let Some(selection) = session.selection() {
            for (row, start, end) in selection_spans(&selection, cols) {
                let text = session.with_engine(|engine| engine.text_between((row, start), (row, end)));
                let width = usize::from(end - start) + 1;
                queue!(
                    stdout,
                    MoveTo(start, row),
                    SetAttribute(Attribute::Reverse),
                    Print(format!("{:<width$}", text, width = width)),
                    SetAttribute(Attribute::Reset)
                )?;
            }
        }

        if offset > 0 && session.scrollbar_alpha(Instant::now()) > 0.0 {
            let label = format!("[{}]", offset);
            let col = cols.saturating_sub(label.len() as u16);
            queue!(
                stdout,
                MoveTo(col, 0),
                SetAttribute(Attribute::Reverse),
                Print(label),
                SetAttribute(Attribute::Reset)
            )?;
        }

        queue!(stdout, MoveTo(cursor.col, cursor.row))?;
        let blink_hidden = cursor.blink && !blink_on;
        if cursor.visible && offset == 0 && !blink_hidden {
            queue!(stdout, cursor_shape(cursor.style), Show)?;
        }

        stdout.write_all(b"\x1b[?2026l")?;
        stdout.flush()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Steady shape; blinking is driven by the render timer
fn cursor_shape(style: CursorStyle) -> SetCursorStyle {
    match style {
        CursorStyle::Block => SetCursorStyle::SteadyBlock,
        CursorStyle::Underline => SetCursorStyle::SteadyUnderScore,
        CursorStyle::Bar => SetCursorStyle::SteadyBar,
    }
}

/// Per-row (row, first col, last col) ranges covered by a selection
pub fn selection_spans(selection: &Selection, cols: u16) -> Vec<(u16, u16, u16)> {
    let (start, end) = selection.normalized();
    let last_col = cols.saturating_sub(1);

    (start.row..=end.row)
        .map(|row| {
            let first = if row == start.row { start.col } else { 0 };
            let last = if row == end.row { end.col } else { last_col };
            (row, first.min(last_col), last.min(last_col))
        })
        .filter(|(_, first, last)| first <= last)
        .collect()
}

/// Put `text` on the system clipboard
pub fn copy_to_clipboard(text: &str) {
    match arboard::Clipboard::new() {
        Ok(mut clipboard) => {
            if let Err(e) = clipboard.set_text(text.to_string()) {
                tracing::warn!("Failed to copy selection: {}", e);
            }
        }
        Err(e) => tracing::warn!("Clipboard unavailable: {}", e),
    }
}

/// Text on the system clipboard, if any
pub fn clipboard_text() -> Option<String> {
    let mut clipboard = arboard::Clipboard::new()
        .map_err(|e| tracing::warn!("Clipboard unavailable: {}", e))
        .ok()?;
    clipboard.get_text().ok()
}
