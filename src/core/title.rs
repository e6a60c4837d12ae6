//! Window title and working-directory tracking
//!
//! Extracts OSC 0/1/2 (window title) and OSC 7 (current directory) payloads
//! from raw pty output. The scanner runs on every byte the I/O thread reads,
//! independently of the terminal engine, and keeps its state between calls so
//! a sequence split across two reads resolves exactly like one read whole.
//!
//! ```text
//! Ground --ESC--> Escape --]--> OscNumber --digit--> OscSemicolon --;--> OscBody
//!   ^                                                                     |
//!   +------------------------------ BEL / ESC ----------------------------+
//! ```
//!
//! Shells usually emit OSC 7 and OSC 0 in the same prompt redraw. Within one
//! read batch OSC 7 wins; an OSC 0/1/2 from a later batch replaces it.

/// Maximum OSC payload kept; further bytes are dropped
pub const MAX_TITLE_LEN: usize = 256;

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

/// Known shell executables and their display names, checked in order
const SHELL_NAMES: &[(&str, &str)] = &[
    ("pwsh", "PowerShell"),
    ("powershell", "Windows PowerShell"),
    ("cmd.exe", "Command Prompt"),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ScanState {
    #[default]
    Ground,
    Escape,
    OscNumber,
    OscSemicolon,
    OscBody,
}

/// Title/cwd values published to other threads
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TitleSnapshot {
    pub title: String,
    pub cwd: Option<String>,
}

/// Byte-at-a-time OSC title scanner plus the resolved title state
#[derive(Debug)]
pub struct TitleScanner {
    state: ScanState,
    /// First digit of the OSC number
    osc_number: u8,
    /// OSC 0/1/2/7 with a single-digit number
    is_title: bool,
    buffer: Vec<u8>,
    /// OSC 7 already applied in the current read batch
    saw_osc7: bool,

    default_title: String,
    window_title: String,
    cwd_title: Option<String>,
    cwd: Option<String>,
    changed: bool,
}

impl TitleScanner {
    /// Create a scanner whose title falls back to `default_title`
    pub fn new(default_title: impl Into<String>) -> Self {
        Self {
            state: ScanState::Ground,
            osc_number: 0,
            is_title: false,
            buffer: Vec::with_capacity(MAX_TITLE_LEN),
            saw_osc7: false,
            default_title: default_title.into(),
            window_title: String::new(),
            cwd_title: None,
            cwd: None,
            changed: false,
        }
    }

    /// Start a new read batch. Call once per read result, before `feed`.
    pub fn reset_batch(&mut self) {
        self.saw_osc7 = false;
    }

    /// Run `bytes` through the state machine.
    ///
    /// Returns true if a BEL outside of any OSC sequence was seen.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        let mut bell = false;

        for &byte in bytes {
            match self.state {
                ScanState::Ground => match byte {
                    ESC => self.state = ScanState::Escape,
                    BEL => bell = true,
                    _ => {}
                },
                ScanState::Escape => match byte {
                    b']' => self.state = ScanState::OscNumber,
                    ESC => {}
                    BEL => {
                        bell = true;
                        self.state = ScanState::Ground;
                    }
                    _ => self.state = ScanState::Ground,
                },
                ScanState::OscNumber => match byte {
                    b'0'..=b'9' => {
                        self.osc_number = byte - b'0';
                        self.is_title = matches!(self.osc_number, 0 | 1 | 2 | 7);
                        self.state = ScanState::OscSemicolon;
                    }
                    _ => self.abort(byte),
                },
                ScanState::OscSemicolon => match byte {
                    b';' => {
                        self.buffer.clear();
                        self.state = ScanState::OscBody;
                    }
                    // Title OSCs are single-digit; OSC 10, 11, 133... are not ours
                    b'0'..=b'9' => self.is_title = false,
                    _ => self.abort(byte),
                },
                ScanState::OscBody => match byte {
                    BEL | ESC => {
                        if self.is_title {
                            let payload = std::mem::take(&mut self.buffer);
                            self.update_title(&payload, self.osc_number);
                            self.buffer = payload;
                        }
                        self.buffer.clear();
                        self.state = ScanState::Ground;
                    }
                    _ => {
                        if self.is_title && self.buffer.len() < MAX_TITLE_LEN {
                            self.buffer.push(byte);
                        }
                    }
                },
            }
        }

        bell
    }

    /// Malformed OSC introducer
    fn abort(&mut self, byte: u8) {
        self.state = if byte == ESC {
            ScanState::Escape
        } else {
            ScanState::Ground
        };
    }

    /// Apply a completed OSC payload.
    ///
    /// Empty and non-UTF-8 payloads are ignored: binary output can look like
    /// OSC framing by accident.
    pub fn update_title(&mut self, payload: &[u8], osc_number: u8) {
        if payload.is_empty() {
            return;
        }
        let Ok(text) = std::str::from_utf8(payload) else {
            tracing::debug!("Dropping non-UTF-8 OSC {} payload ({} bytes)", osc_number, payload.len());
            return;
        };

        match osc_number {
            7 => {
                let Some(path) = parse_file_uri(text) else {
                    tracing::debug!("Ignoring OSC 7 payload without file URI: {:?}", text);
                    return;
                };
                self.cwd_title = Some(shorten_home(path));
                self.cwd = Some(path.to_string());
                self.saw_osc7 = true;
                self.changed = true;
            }
            0 | 1 | 2 => {
                if self.saw_osc7 {
                    return;
                }
                self.window_title = normalize_shell_name(text);
                self.cwd_title = None;
                self.changed = true;
            }
            _ => {}
        }
    }

    /// Title to display: OSC 7 directory, else OSC 0/1/2 title, else default
    pub fn title(&self) -> &str {
        if let Some(ref cwd_title) = self.cwd_title {
            cwd_title
        } else if !self.window_title.is_empty() {
            &self.window_title
        } else {
            &self.default_title
        }
    }

    /// Raw path from the last OSC 7
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Whether title or cwd changed since the last call
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn snapshot(&self) -> TitleSnapshot {
        TitleSnapshot {
            title: self.title().to_string(),
            cwd: self.cwd.clone(),
        }
    }
}

/// Path component of a `file://host/path` URI
fn parse_file_uri(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("file://")?;
    let slash = rest.find('/')?;
    Some(&rest[slash..])
}

/// `/home/<user>/rest` -> `~/rest`
fn shorten_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/home/") {
        let (user, tail) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if !user.is_empty() {
            return format!("~{}", tail);
        }
    }
    path.to_string()
}

/// Map shell executable names to friendly display strings
pub fn normalize_shell_name(title: &str) -> String {
    let lower = title.to_lowercase();
    SHELL_NAMES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, display)| display.to_string())
        .unwrap_or_else(|| title.to_string())
}

/// Title shown before the shell sets one: the launch program's name.
///
/// An unquoted Windows path with spaces splits into pieces, so when the
/// program token is not a known shell the whole line is matched instead.
pub fn default_title_for(command: &str) -> String {
    let program = shell_words::split(command)
        .ok()
        .and_then(|parts| parts.into_iter().next())
        .unwrap_or_else(|| command.trim().to_string());
    let name = program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(&program)
        .to_string();

    let normalized = normalize_shell_name(&name);
    if normalized != name {
        return normalized;
    }
    let whole = normalize_shell_name(command);
    if whole != command {
        return whole;
    }
    name
}
