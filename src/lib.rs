//! ptyhost - terminal session core
//!
//! Runs a shell on a pseudo terminal, feeds its output to a terminal engine,
//! tracks the window title and bell out of band, and schedules redraws from a
//! dedicated timer thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptyhost::{RenderTimer, RenderTimerConfig, Session, SessionOptions};
//! use ptyhost::ui::HostTarget;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::open(SessionOptions::default())?;
//! let target = HostTarget::new();
//! let mut timer = RenderTimer::start(&session, target.clone(), RenderTimerConfig::default())?;
//!
//! session.write(b"echo hi\r")?;
//! if target.take_redraw() {
//!     println!("{}", session.title());
//! }
//!
//! timer.stop();
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod ui;

pub use crate::config::{Config, ConfigError};
pub use crate::core::pty::{PtyError, PtyTransport};
pub use crate::core::render_timer::{RenderTarget, RenderTimer, RenderTimerConfig};
pub use crate::core::session::{
    CellPos, Selection, Session, SessionError, SessionOptions, SessionSignals, SessionState,
};
pub use crate::core::term::{CursorInfo, CursorStyle, Engine, MouseMode};
pub use crate::core::title::{TitleScanner, TitleSnapshot};
