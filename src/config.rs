//! Configuration for ptyhost.
//!
//! Settings are read from `~/.ptyhost/config.toml`. Every field is optional:
//!
//! ```toml
//! # Command to launch (default: $SHELL, or cmd.exe on Windows)
//! shell = "pwsh.exe -NoLogo"
//!
//! # Starting directory for the shell
//! cwd = "C:/src"
//!
//! # Lines kept above the visible screen
//! scrollback_limit = 10000
//!
//! # Log filter used when RUST_LOG is not set
//! log_level = "info"
//!
//! [cursor]
//! style = "bar"            # block, underline, bar
//! blink = true
//! blink_interval_ms = 530
//!
//! [render]
//! tick_ms = 16
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::render_timer::RenderTimerConfig;
use crate::core::session::SessionOptions;
use crate::core::term::CursorStyle;

const CONFIG_DIR: &str = ".ptyhost";
const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not determine home directory")]
    NoHome,
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command to launch instead of the default shell
    pub shell: Option<String>,
    /// Starting directory
    pub cwd: Option<PathBuf>,
    pub scrollback_limit: usize,
    pub log_level: String,
    pub cursor: CursorConfig,
    pub render: RenderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            scrollback_limit: 10_000,
            log_level: "info".to_string(),
            cursor: CursorConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

/// Cursor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub style: CursorStyle,
    pub blink: bool,
    pub blink_interval_ms: u64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            style: CursorStyle::Block,
            blink: true,
            blink_interval_ms: 530,
        }
    }
}

/// Render timer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub tick_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { tick_ms: 16 }
    }
}

impl Config {
    /// Load the user's config, falling back to defaults on any problem
    pub fn load() -> Self {
        Self::try_load().unwrap_or_else(|e| {
            tracing::warn!("Using default config: {}", e);
            Self::default()
        })
    }

    /// Like `load`, but a broken config file is returned as an error.
    /// A missing file or home directory still yields the defaults.
    pub fn try_load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) => Self::load_or_default(&path),
            None => Ok(Self::default()),
        }
    }

    /// Defaults when `path` does not exist, otherwise `load_from`
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to the user's config file
    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = Self::data_dir().ok_or(ConfigError::NoHome)?;
        fs::create_dir_all(&dir).map_err(|source| ConfigError::Write {
            path: dir.clone(),
            source,
        })?;
        self.save_to(&dir.join(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.ptyhost`, also home of the log file
    pub fn data_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(CONFIG_DIR))
    }

    fn config_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Session parameters for a terminal of `cols` x `rows`
    pub fn session_options(&self, cols: u16, rows: u16) -> SessionOptions {
        SessionOptions {
            cols,
            rows,
            command: self.shell.clone(),
            scrollback_limit: self.scrollback_limit,
            cursor_style: self.cursor.style,
            cursor_blink: self.cursor.blink,
            cwd: self.cwd.clone(),
        }
    }

    pub fn render_timer_config(&self) -> RenderTimerConfig {
        RenderTimerConfig {
            tick: Duration::from_millis(self.render.tick_ms.max(1)),
            blink_interval: self
                .cursor
                .blink
                .then(|| Duration::from_millis(self.cursor.blink_interval_ms.max(1))),
        }
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
