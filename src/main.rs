//! ptyhost - run a shell inside the current terminal through a pseudo terminal
//!
//! # Quick Start
//!
//! ```text
//! ptyhost                   # Default shell ($SHELL, or cmd.exe on Windows)
//! ptyhost -s "pwsh -NoLogo" # Custom command
//! ptyhost -d ~/src          # Start in a directory
//! ```
//!
//! # Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | Shift+PageUp/PageDown | Scroll back / forward |
//! | Ctrl+Shift+V | Paste from clipboard |
//! | Mouse drag | Select and copy |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEvent,
    MouseEventKind,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptyhost::core::term::MouseMode;
use ptyhost::ui::host::{clipboard_text, copy_to_clipboard};
use ptyhost::ui::{Host, HostTarget, KeyMapper};
use ptyhost::{CellPos, Config, RenderTarget, RenderTimer, Session};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lines moved per wheel notch
const WHEEL_LINES: isize = 3;

/// Command line options
#[derive(Debug, Default)]
struct Options {
    shell: Option<String>,
    cwd: Option<PathBuf>,
    no_blink: bool,
}

fn print_version() {
    eprintln!("ptyhost {}", VERSION);
}

fn print_help() {
    eprintln!("ptyhost {} - run a shell through a pseudo terminal", VERSION);
    eprintln!();
    eprintln!("Usage: ptyhost [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Command to run (default: config, then platform shell)");
    eprintln!("  -d, --cwd <DIR>       Starting directory");
    eprintln!("      --no-blink        Solid cursor");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keys:");
    eprintln!("  Shift+PageUp/PageDown Scroll back / forward");
    eprintln!("  Ctrl+Shift+V          Paste from clipboard");
    eprintln!("  Mouse drag            Select text (copied on release)");
    eprintln!();
    eprintln!("Configuration: ~/.ptyhost/config.toml");
    eprintln!("Log file:      ~/.ptyhost/ptyhost.log (RUST_LOG overrides log_level)");
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                let shell = args.get(i).ok_or("Missing shell argument")?;
                options.shell = Some(shell.clone());
            }
            "-d" | "--cwd" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing directory argument")?;
                options.cwd = Some(PathBuf::from(dir));
            }
            "--no-blink" => {
                options.no_blink = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Log to `~/.ptyhost/ptyhost.log`; the screen belongs to the child
fn init_logging(config: &Config) {
    let log_path = Config::data_dir()
        .map(|dir| dir.join("ptyhost.log"))
        .unwrap_or_else(|| PathBuf::from("ptyhost.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let options = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    // Command line overrides the config file. A broken file is reported once
    // logging is up.
    let (mut config, config_error) = match Config::try_load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    if options.shell.is_some() {
        config.shell = options.shell;
    }
    if options.cwd.is_some() {
        config.cwd = options.cwd;
    }
    if options.no_blink {
        config.cursor.blink = false;
    }

    init_logging(&config);
    info!("ptyhost {} starting", VERSION);
    if let Some(e) = config_error {
        warn!("Using default config: {}", e);
    }

    run(&config)
}

fn run(config: &Config) -> anyhow::Result<()> {
    let (cols, rows) = Host::size().context("Failed to query terminal size")?;
    info!("Terminal size: {}x{}", cols, rows);

    let mut session = Session::open(config.session_options(cols, rows)).map_err(|e| {
        error!("Failed to start shell: {}", e);
        e
    })?;

    let target = HostTarget::new();
    let mut timer = RenderTimer::start(&session, target.clone(), config.render_timer_config())
        .context("Failed to start render timer")?;

    let mut host = Host::new();
    let result = host
        .init()
        .context("Failed to initialize terminal")
        .and_then(|()| event_loop(&mut host, &mut session, &target, &timer));

    timer.stop();
    let exit_code = session.exit_code();
    session.close();
    host.cleanup().context("Failed to restore terminal")?;

    match exit_code {
        Some(code) => info!("Shell exited with code {}", code),
        None => info!("Session closed"),
    }
    result
}

fn event_loop(
    host: &mut Host,
    session: &mut Session,
    target: &HostTarget,
    timer: &RenderTimer,
) -> anyhow::Result<()> {
    loop {
        if target.take_redraw() {
            host.render(session, target.cursor_visible())?;
        }
        if session.has_exited() {
            return Ok(());
        }

        if !event::poll(Duration::from_millis(10))? {
            continue;
        }

        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                handle_key(session, target, &key);
                timer.reset_blink();
            }
            Event::Mouse(mouse) => handle_mouse(session, target, &mouse),
            Event::Paste(text) => {
                if let Err(e) = session.paste(&text) {
                    warn!("Paste failed: {}", e);
                }
            }
            Event::Resize(cols, rows) => {
                info!("Terminal resized to {}x{}", cols, rows);
                session.resize(cols, rows);
                target.request_redraw();
            }
            _ => {}
        }
    }
}

fn handle_key(session: &mut Session, target: &HostTarget, key: &KeyEvent) {
    let page = (i32::from(session.size().1 / 2) as isize).max(1);
    let ctrl_shift = KeyModifiers::CONTROL | KeyModifiers::SHIFT;

    match (key.code, key.modifiers) {
        (KeyCode::PageUp, KeyModifiers::SHIFT) => {
            session.scroll_viewport(page);
            target.request_redraw();
            return;
        }
        (KeyCode::PageDown, KeyModifiers::SHIFT) => {
            session.scroll_viewport(-page);
            target.request_redraw();
            return;
        }
        (KeyCode::Char('v') | KeyCode::Char('V'), mods) if mods == ctrl_shift => {
            if let Some(text) = clipboard_text() {
                if let Err(e) = session.paste(&text) {
                    warn!("Paste failed: {}", e);
                }
            }
            return;
        }
        _ => {}
    }

    let application_cursor = session.with_engine(|engine| engine.application_cursor());
    let Some(bytes) = KeyMapper::map(key, application_cursor) else {
        return;
    };

    if session.viewport_offset() > 0 {
        session.scroll_to_bottom();
        target.request_redraw();
    }
    if session.selection().is_some() {
        session.clear_selection();
        target.request_redraw();
    }
    if let Err(e) = session.write(&bytes) {
        warn!("Key input dropped: {}", e);
    }
}

fn handle_mouse(session: &mut Session, target: &HostTarget, mouse: &MouseEvent) {
    let (mode, sgr) = session.with_engine(|engine| (engine.mouse_mode(), engine.mouse_sgr()));

    // Shift bypasses mouse reporting so text can still be selected
    if mode != MouseMode::Off && !mouse.modifiers.contains(KeyModifiers::SHIFT) {
        if let Some(bytes) = KeyMapper::encode_mouse(mouse, mode, sgr) {
            if let Err(e) = session.write(&bytes) {
                warn!("Mouse input dropped: {}", e);
            }
        }
        return;
    }

    let pos = CellPos::new(mouse.row, mouse.column);
    match mouse.kind {
        MouseEventKind::Down(MouseButton::Left) => session.start_selection(pos),
        MouseEventKind::Drag(MouseButton::Left) => session.update_selection(pos),
        MouseEventKind::Up(MouseButton::Left) => {
            session.end_selection();
            match session.selection() {
                Some(selection) if selection.start != selection.end => {
                    if let Some(text) = session.selected_text() {
                        copy_to_clipboard(&text);
                    }
                }
                _ => session.clear_selection(),
            }
        }
        MouseEventKind::ScrollUp => session.scroll_viewport(WHEEL_LINES),
        MouseEventKind::ScrollDown => session.scroll_viewport(-WHEEL_LINES),
        _ => return,
    }
    target.request_redraw();
}
