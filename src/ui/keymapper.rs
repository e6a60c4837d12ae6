//! Host input to PTY bytes
//!
//! Turns crossterm key and mouse events into the byte sequences an xterm-like
//! terminal would send to its child.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};

use crate::core::term::MouseMode;

const ESC: u8 = 0x1B;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        result.set(Modifiers::SHIFT, mods.contains(KeyModifiers::SHIFT));
        result.set(Modifiers::ALT, mods.contains(KeyModifiers::ALT));
        result.set(Modifiers::CTRL, mods.contains(KeyModifiers::CONTROL));
        result
    }
}

impl Modifiers {
    /// xterm modifier parameter (1 + bitmask)
    fn param(self) -> u8 {
        1 + self.bits()
    }
}

/// Key/mouse event encoder
pub struct KeyMapper;

impl KeyMapper {
    /// Bytes for a key press, `None` for keys the terminal does not send
    pub fn map(event: &KeyEvent, application_cursor: bool) -> Option<Vec<u8>> {
        let mods = Modifiers::from(event.modifiers);

        let bytes = match event.code {
            KeyCode::Char(ch) => Self::char_key(ch, mods),
            KeyCode::Enter => Self::with_alt(b"\r", mods),
            KeyCode::Backspace => Self::with_alt(&[0x7F], mods),
            KeyCode::Tab if mods.contains(Modifiers::SHIFT) => b"\x1b[Z".to_vec(),
            KeyCode::BackTab => b"\x1b[Z".to_vec(),
            KeyCode::Tab => Self::with_alt(b"\t", mods),
            KeyCode::Esc => vec![ESC],

            KeyCode::Up => Self::cursor_key(b'A', mods, application_cursor),
            KeyCode::Down => Self::cursor_key(b'B', mods, application_cursor),
            KeyCode::Right => Self::cursor_key(b'C', mods, application_cursor),
            KeyCode::Left => Self::cursor_key(b'D', mods, application_cursor),
            KeyCode::Home => Self::cursor_key(b'H', mods, application_cursor),
            KeyCode::End => Self::cursor_key(b'F', mods, application_cursor),

            KeyCode::Insert => Self::tilde_key(2, mods),
            KeyCode::Delete => Self::tilde_key(3, mods),
            KeyCode::PageUp => Self::tilde_key(5, mods),
            KeyCode::PageDown => Self::tilde_key(6, mods),

            KeyCode::F(n @ 1..=4) => Self::ss3_key(b"PQRS"[usize::from(n - 1)], mods),
            KeyCode::F(n @ 5..=12) => {
                const CODES: [u8; 8] = [15, 17, 18, 19, 20, 21, 23, 24];
                Self::tilde_key(CODES[usize::from(n - 5)], mods)
            }

            _ => return None,
        };
        Some(bytes)
    }

    fn char_key(ch: char, mods: Modifiers) -> Vec<u8> {
        if mods.contains(Modifiers::CTRL) {
            if let Some(code) = Self::control_code(ch) {
                return Self::with_alt(&[code], mods);
            }
        }

        let mut buf = [0u8; 4];
        Self::with_alt(ch.encode_utf8(&mut buf).as_bytes(), mods)
    }

    /// C0 code for Ctrl+`ch`
    fn control_code(ch: char) -> Option<u8> {
        match ch {
            'a'..='z' => Some(ch as u8 - b'a' + 1),
            'A'..='Z' => Some(ch as u8 - b'A' + 1),
            '@' | '`' | ' ' | '2' => Some(0x00),
            '[' | '3' => Some(0x1B),
            '\\' | '4' => Some(0x1C),
            ']' | '5' => Some(0x1D),
            '^' | '~' | '6' => Some(0x1E),
            '_' | '?' | '7' => Some(0x1F),
            _ => None,
        }
    }

    /// Alt sends an ESC prefix
    fn with_alt(bytes: &[u8], mods: Modifiers) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + 1);
        if mods.contains(Modifiers::ALT) {
            out.push(ESC);
        }
        out.extend_from_slice(bytes);
        out
    }

    fn cursor_key(key: u8, mods: Modifiers, application_cursor: bool) -> Vec<u8> {
        if !mods.is_empty() {
            format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
        } else if application_cursor {
            vec![ESC, b'O', key]
        } else {
            vec![ESC, b'[', key]
        }
    }

    fn ss3_key(key: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            vec![ESC, b'O', key]
        } else {
            format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
        }
    }

    fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            format!("\x1b[{}~", code).into_bytes()
        } else {
            format!("\x1b[{};{}~", code, mods.param()).into_bytes()
        }
    }

    /// Encode a mouse event for a child that enabled mouse reporting.
    ///
    /// Returns `None` when `mode` does not report this kind of event, or when
    /// the position cannot be expressed in the legacy encoding.
    pub fn encode_mouse(event: &MouseEvent, mode: MouseMode, sgr: bool) -> Option<Vec<u8>> {
        let (button, pressed) = match event.kind {
            MouseEventKind::Down(button) => (Self::button_code(button), true),
            MouseEventKind::Up(button) => {
                if mode == MouseMode::Press {
                    return None;
                }
                // Legacy encoding cannot say which button was released
                (if sgr { Self::button_code(button) } else { 3 }, false)
            }
            MouseEventKind::Drag(button) => {
                if !matches!(mode, MouseMode::ButtonMotion | MouseMode::AnyMotion) {
                    return None;
                }
                (Self::button_code(button) + 32, true)
            }
            MouseEventKind::Moved => {
                if mode != MouseMode::AnyMotion {
                    return None;
                }
                (35, true)
            }
            MouseEventKind::ScrollUp => (64, true),
            MouseEventKind::ScrollDown => (65, true),
            MouseEventKind::ScrollLeft => (66, true),
            MouseEventKind::ScrollRight => (67, true),
        };
        if mode == MouseMode::Off {
            return None;
        }

        let mods = Modifiers::from(event.modifiers);
        let mut cb = button;
        if mods.contains(Modifiers::SHIFT) {
            cb += 4;
        }
        if mods.contains(Modifiers::ALT) {
            cb += 8;
        }
        if mods.contains(Modifiers::CTRL) {
            cb += 16;
        }

        let x = u32::from(event.column) + 1;
        let y = u32::from(event.row) + 1;

        if sgr {
            let suffix = if pressed { 'M' } else { 'm' };
            Some(format!("\x1b[<{};{};{}{}", cb, x, y, suffix).into_bytes())
        } else if x <= 223 && y <= 223 {
            Some(vec![ESC, b'[', b'M', cb + 32, x as u8 + 32, y as u8 + 32])
        } else {
            None
        }
    }

    fn button_code(button: MouseButton) -> u8 {
        match button {
            MouseButton::Left => 0,
            MouseButton::Middle => 1,
            MouseButton::Right => 2,
        }
    }
}
