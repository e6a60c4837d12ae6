//! Terminal session core.
//!
//! - **pty**: Pseudo-terminal transports (ConPTY on Windows, openpty elsewhere)
//! - **title**: OSC title / working-directory scanner
//! - **term**: Terminal engine adapter over `vt100`
//! - **pump**: Body of the session's I/O thread
//! - **session**: Session lifecycle, shared flags and UI-facing queries
//! - **render_timer**: Cursor blink and redraw scheduling thread
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── PtyTransport  (child process + duplex byte channel)
//! ├── Engine        (vt100 screen, behind a mutex)
//! ├── SessionSignals (dirty / bell / exited atomics)
//! └── I/O thread ── pump::run
//!                   ├── TitleScanner
//!                   └── Engine::feed
//!
//! RenderTimer ── observes SessionSignals ── RenderTarget::request_redraw
//! ```

pub mod pty;
pub(crate) mod pump;
pub mod render_timer;
pub mod session;
pub mod term;
pub mod title;
