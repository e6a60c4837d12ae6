//! Render timer thread
//!
//! Wakes every tick, or at once when woken, to advance the cursor blink phase
//! and turn the session's dirty flag into a redraw request. Runs on its own
//! thread so a busy UI thread cannot make it miss blink deadlines.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::session::{Session, SessionSignals};

/// Surface the timer asks to repaint
pub trait RenderTarget: Send + Sync {
    /// Schedule a repaint. Must not block.
    fn request_redraw(&self);

    /// Cursor blink phase changed
    fn set_cursor_visible(&self, visible: bool);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTimerConfig {
    pub tick: Duration,
    /// `None` keeps the cursor solid
    pub blink_interval: Option<Duration>,
}

impl Default for RenderTimerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(16),
            blink_interval: Some(Duration::from_millis(530)),
        }
    }
}

#[derive(Debug, Default)]
struct WakeState {
    woken: bool,
    reset_blink: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    wake: Mutex<WakeState>,
    cv: Condvar,
    cursor_visible: AtomicBool,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, WakeState> {
        self.wake.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn signal(&self, f: impl FnOnce(&mut WakeState)) {
        let mut wake = self.lock();
        f(&mut wake);
        wake.woken = true;
        self.cv.notify_one();
    }
}

pub struct RenderTimer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl RenderTimer {
    /// Start a timer observing `session`
    pub fn start(
        session: &Session,
        target: Arc<dyn RenderTarget>,
        config: RenderTimerConfig,
    ) -> io::Result<Self> {
        Self::with_signals(session.signals(), target, config)
    }

    /// Start a timer observing a session's flags directly
    pub fn with_signals(
        signals: Arc<SessionSignals>,
        target: Arc<dyn RenderTarget>,
        config: RenderTimerConfig,
    ) -> io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        shared.cursor_visible.store(true, Ordering::Release);

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("ptyhost-render".to_string())
            .spawn(move || run(&thread_shared, &signals, target.as_ref(), config))?;

        tracing::debug!("Render timer started ({:?})", config);
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Run a cycle now instead of at the next tick
    pub fn wake(&self) {
        self.shared.signal(|_| {});
    }

    /// Show the cursor and restart the blink phase, e.g. after a keypress
    pub fn reset_blink(&self) {
        self.shared.signal(|wake| wake.reset_blink = true);
    }

    pub fn cursor_visible(&self) -> bool {
        self.shared.cursor_visible.load(Ordering::Acquire)
    }

    /// Stop and join the timer thread. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.shared.signal(|wake| wake.stop = true);
        if thread.join().is_err() {
            tracing::error!("Render timer thread panicked");
        }
        tracing::debug!("Render timer stopped");
    }
}

impl Drop for RenderTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    shared: &TimerShared,
    signals: &SessionSignals,
    target: &dyn RenderTarget,
    config: RenderTimerConfig,
) {
    let mut last_blink = Instant::now();
    let mut exit_reported = false;
    target.set_cursor_visible(true);

    loop {
        let reset_blink = {
            let mut wake = shared.lock();
            if !wake.woken {
                wake = shared
                    .cv
                    .wait_timeout(wake, config.tick)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            if wake.stop {
                break;
            }
            wake.woken = false;
            std::mem::take(&mut wake.reset_blink)
        };

        let now = Instant::now();
        let mut redraw = false;

        if reset_blink {
            last_blink = now;
            if !shared.cursor_visible.swap(true, Ordering::AcqRel) {
                target.set_cursor_visible(true);
                redraw = true;
            }
        } else if let Some(interval) = config.blink_interval {
            if now.duration_since(last_blink) >= interval {
                last_blink = now;
                let visible = !shared.cursor_visible.load(Ordering::Acquire);
                shared.cursor_visible.store(visible, Ordering::Release);
                target.set_cursor_visible(visible);
                redraw = true;
            }
        }

        if signals.take_dirty() {
            redraw = true;
        }

        // One last frame so the UI loop sees the exit
        if !exit_reported && signals.has_exited() {
            exit_reported = true;
            redraw = true;
        }

        if redraw {
            target.request_redraw();
        }
    }
}
