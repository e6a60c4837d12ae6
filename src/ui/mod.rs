//! Host-side user interface.
//!
//! - **keymapper**: Keyboard and mouse input to PTY byte sequence mapping
//! - **host**: Draws a session into the hosting terminal and owns clipboard access

pub mod host;
pub mod keymapper;

pub use host::{Host, HostTarget};
pub use keymapper::{KeyMapper, Modifiers};
