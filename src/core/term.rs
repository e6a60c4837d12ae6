//! Terminal engine adapter
//!
//! The grid, cursor and scrollback live in `vt100`. This wrapper adds what the
//! session needs on top: answers to the host queries a pty child expects
//! (cursor position and device attribute reports), DECSCUSR cursor style
//! tracking, and the configured cursor defaults.

use serde::{Deserialize, Serialize};
use vt100::Parser;

const ESC: u8 = 0x1B;

/// CSI parameters kept per sequence; extras are ignored
const MAX_PARAMS: usize = 16;

/// Cursor shape
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorStyle {
    #[default]
    Block,
    Underline,
    Bar,
}

impl CursorStyle {
    /// Decode a DECSCUSR parameter into (style, blinking).
    ///
    /// 0 means "terminal default" and is resolved by the caller.
    pub fn from_decscusr(n: u16) -> Option<(Self, bool)> {
        match n {
            1 => Some((CursorStyle::Block, true)),
            2 => Some((CursorStyle::Block, false)),
            3 => Some((CursorStyle::Underline, true)),
            4 => Some((CursorStyle::Underline, false)),
            5 => Some((CursorStyle::Bar, true)),
            6 => Some((CursorStyle::Bar, false)),
            _ => None,
        }
    }

    /// DECSCUSR parameter for this style
    pub fn to_decscusr(self, blink: bool) -> u8 {
        let steady = match self {
            CursorStyle::Block => 2,
            CursorStyle::Underline => 4,
            CursorStyle::Bar => 6,
        };
        if blink {
            steady - 1
        } else {
            steady
        }
    }
}

/// Response that needs to be sent back to the PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Device status: ESC [ 0 n
    StatusOk,
    /// Cursor position report: ESC [ row ; col R (1-based)
    CursorPosition(u16, u16),
    /// Primary device attributes
    DeviceAttributes,
    /// Secondary device attributes
    SecondaryDeviceAttributes,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::StatusOk => b"\x1b[0n".to_vec(),
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            // VT220
            Response::DeviceAttributes => b"\x1b[?62;c".to_vec(),
            Response::SecondaryDeviceAttributes => b"\x1b[>1;10;0c".to_vec(),
        }
    }
}

/// Cursor state as seen by a renderer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorInfo {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
    pub style: CursorStyle,
    pub blink: bool,
}

/// Mouse events the child asked to receive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MouseMode {
    Off,
    Press,
    PressRelease,
    ButtonMotion,
    AnyMotion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Query {
    Status,
    CursorPosition,
    DeviceAttributes,
    SecondaryDeviceAttributes,
    CursorStyle(u16),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum QueryState {
    #[default]
    Ground,
    Escape,
    Csi,
}

/// Spots the CSI sequences the engine must answer. Resumable across chunks.
#[derive(Debug, Default)]
struct QueryScanner {
    state: QueryState,
    params: Vec<u16>,
    current: Option<u16>,
    prefix: Option<u8>,
    intermediate: Option<u8>,
}

impl QueryScanner {
    fn advance(&mut self, byte: u8) -> Option<Query> {
        match self.state {
            QueryState::Ground => {
                if byte == ESC {
                    self.state = QueryState::Escape;
                }
                None
            }
            QueryState::Escape => {
                match byte {
                    b'[' => {
                        self.params.clear();
                        self.current = None;
                        self.prefix = None;
                        self.intermediate = None;
                        self.state = QueryState::Csi;
                    }
                    ESC => {}
                    _ => self.state = QueryState::Ground,
                }
                None
            }
            QueryState::Csi => match byte {
                b'0'..=b'9' => {
                    let digit = u16::from(byte - b'0');
                    self.current = Some(
                        self.current
                            .unwrap_or(0)
                            .saturating_mul(10)
                            .saturating_add(digit),
                    );
                    None
                }
                b';' => {
                    let param = self.current.take().unwrap_or(0);
                    self.push_param(param);
                    None
                }
                b'?' | b'>' | b'=' | b'<' => {
                    if self.params.is_empty() && self.current.is_none() {
                        self.prefix = Some(byte);
                    }
                    None
                }
                0x20..=0x2F => {
                    self.intermediate = Some(byte);
                    None
                }
                0x40..=0x7E => {
                    if let Some(p) = self.current.take() {
                        self.push_param(p);
                    }
                    self.state = QueryState::Ground;
                    self.classify(byte)
                }
                ESC => {
                    self.state = QueryState::Escape;
                    None
                }
                // C0 controls execute inside CSI without ending it
                0x00..=0x1F => None,
                _ => {
                    self.state = QueryState::Ground;
                    None
                }
            },
        }
    }

    fn push_param(&mut self, param: u16) {
        if self.params.len() < MAX_PARAMS {
            self.params.push(param);
        }
    }

    fn classify(&self, final_byte: u8) -> Option<Query> {
        let first = self.params.first().copied();
        match (self.prefix, self.intermediate, final_byte) {
            (None, None, b'n') => match first {
                Some(5) => Some(Query::Status),
                Some(6) => Some(Query::CursorPosition),
                _ => None,
            },
            (None, None, b'c') if first.unwrap_or(0) == 0 => Some(Query::DeviceAttributes),
            (Some(b'>'), None, b'c') if first.unwrap_or(0) == 0 => {
                Some(Query::SecondaryDeviceAttributes)
            }
            (None, Some(b' '), b'q') => Some(Query::CursorStyle(first.unwrap_or(0))),
            _ => None,
        }
    }
}

/// Terminal engine: vt100 screen plus query handling
pub struct Engine {
    parser: Parser,
    queries: QueryScanner,
    default_style: CursorStyle,
    default_blink: bool,
    cursor_style: CursorStyle,
    cursor_blink: bool,
}

impl Engine {
    pub fn new(
        cols: u16,
        rows: u16,
        scrollback_limit: usize,
        cursor_style: CursorStyle,
        cursor_blink: bool,
    ) -> Self {
        Self {
            parser: Parser::new(rows, cols, scrollback_limit),
            queries: QueryScanner::default(),
            default_style: cursor_style,
            default_blink: cursor_blink,
            cursor_style,
            cursor_blink,
        }
    }

    /// Advance the terminal state. Returns replies owed to the child.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();
        let mut start = 0;

        for (i, &byte) in bytes.iter().enumerate() {
            let Some(query) = self.queries.advance(byte) else {
                continue;
            };

            // Replies must reflect everything up to and including the query
            self.parser.process(&bytes[start..=i]);
            start = i + 1;

            match query {
                Query::Status => responses.push(Response::StatusOk),
                Query::CursorPosition => {
                    let (row, col) = self.parser.screen().cursor_position();
                    responses.push(Response::CursorPosition(row + 1, col + 1));
                }
                Query::DeviceAttributes => responses.push(Response::DeviceAttributes),
                Query::SecondaryDeviceAttributes => {
                    responses.push(Response::SecondaryDeviceAttributes)
                }
                Query::CursorStyle(0) => {
                    self.cursor_style = self.default_style;
                    self.cursor_blink = self.default_blink;
                }
                Query::CursorStyle(n) => {
                    if let Some((style, blink)) = CursorStyle::from_decscusr(n) {
                        self.cursor_style = style;
                        self.cursor_blink = blink;
                    } else {
                        tracing::debug!("Ignoring DECSCUSR {}", n);
                    }
                }
            }
        }

        self.parser.process(&bytes[start..]);
        responses
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows, cols);
    }

    /// (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    pub fn cursor(&self) -> CursorInfo {
        let screen = self.parser.screen();
        let (row, col) = screen.cursor_position();
        CursorInfo {
            row,
            col,
            visible: !screen.hide_cursor(),
            style: self.cursor_style,
            blink: self.cursor_blink,
        }
    }

    pub fn application_cursor(&self) -> bool {
        self.parser.screen().application_cursor()
    }

    pub fn bracketed_paste(&self) -> bool {
        self.parser.screen().bracketed_paste()
    }

    pub fn alternate_screen(&self) -> bool {
        self.parser.screen().alternate_screen()
    }

    pub fn mouse_mode(&self) -> MouseMode {
        match self.parser.screen().mouse_protocol_mode() {
            vt100::MouseProtocolMode::None => MouseMode::Off,
            vt100::MouseProtocolMode::Press => MouseMode::Press,
            vt100::MouseProtocolMode::PressRelease => MouseMode::PressRelease,
            vt100::MouseProtocolMode::ButtonMotion => MouseMode::ButtonMotion,
            vt100::MouseProtocolMode::AnyMotion => MouseMode::AnyMotion,
        }
    }

    /// SGR (1006) mouse encoding requested
    pub fn mouse_sgr(&self) -> bool {
        self.parser.screen().mouse_protocol_encoding() == vt100::MouseProtocolEncoding::Sgr
    }

    /// Lines scrolled back from the live screen (0 = bottom)
    pub fn viewport_offset(&self) -> usize {
        self.parser.screen().scrollback()
    }

    /// Scroll the viewport; positive moves up into history
    pub fn scroll_viewport(&mut self, delta: isize) {
        let current = self.viewport_offset();
        let target = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        self.parser.set_scrollback(target);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.parser.set_scrollback(0);
    }

    /// Escape sequence stream that redraws the visible screen
    pub fn contents_formatted(&self) -> Vec<u8> {
        self.parser.screen().contents_formatted()
    }

    /// Text between two (row, col) cells of the viewport, both inclusive
    pub fn text_between(&self, start: (u16, u16), end: (u16, u16)) -> String {
        self.parser
            .screen()
            .contents_between(start.0, start.1, end.0, end.1.saturating_add(1))
    }
}
