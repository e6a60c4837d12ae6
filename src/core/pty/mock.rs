//! Scripted transport for unit tests

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{PtyError, PtyTransport, Result, SizeCell};

pub(crate) enum MockRead {
    Data(Vec<u8>),
    Eof,
    Error,
}

/// State shared between a test and the transport it handed to a session
#[derive(Default)]
pub(crate) struct MockState {
    script: Mutex<VecDeque<MockRead>>,
    cv: Condvar,
    cancelled: AtomicBool,
    read_closed: AtomicBool,
    close_count: AtomicUsize,
    dropped: AtomicBool,
    pub(crate) reads: AtomicUsize,
    pub(crate) fail_writes: AtomicBool,
    pub(crate) fail_resize: AtomicBool,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
}

impl MockState {
    fn script(&self) -> MutexGuard<'_, VecDeque<MockRead>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, item: MockRead) {
        self.script().push_back(item);
        self.cv.notify_all();
    }

    pub(crate) fn push_data(&self, data: &[u8]) {
        self.push(MockRead::Data(data.to_vec()));
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Block until the script has been fully consumed
    pub(crate) fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.script().is_empty() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

/// Transport whose reads come from a script. An exhausted script blocks the
/// reader until more is pushed or the read is cancelled, like an idle shell.
pub(crate) struct MockTransport {
    state: Arc<MockState>,
    size: SizeCell,
}

impl MockTransport {
    pub(crate) fn new(cols: u16, rows: u16) -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let transport = Self {
            state: state.clone(),
            size: SizeCell::new(cols, rows),
        };
        (transport, state)
    }
}

impl PtyTransport for MockTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        let mut script = self.state.script();
        loop {
            if self.state.cancelled.load(Ordering::SeqCst)
                || self.state.read_closed.load(Ordering::SeqCst)
            {
                return Ok(0);
            }

            match script.pop_front() {
                Some(MockRead::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        script.push_front(MockRead::Data(data.split_off(n)));
                    }
                    return Ok(n);
                }
                Some(MockRead::Eof) => return Ok(0),
                Some(MockRead::Error) => {
                    return Err(PtyError::Read(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "scripted failure",
                    )))
                }
                None => {
                    script = self.state.cv.wait(script).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    fn data_available(&self) -> usize {
        match self.state.script().front() {
            Some(MockRead::Data(data)) => data.len(),
            _ => 0,
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(PtyError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted failure",
            )));
        }
        self.state
            .written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.state.fail_resize.load(Ordering::SeqCst) {
            return Err(PtyError::Resize(io::Error::new(
                io::ErrorKind::Other,
                "scripted failure",
            )));
        }
        self.state
            .resizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((cols, rows));
        self.size.set(cols, rows);
        Ok(())
    }

    fn cancel_pending_read(&self) {
        let _script = self.state.script();
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.cv.notify_all();
    }

    fn close_read_side(&self) {
        let _script = self.state.script();
        if !self.state.read_closed.swap(true, Ordering::SeqCst) {
            self.state.close_count.fetch_add(1, Ordering::SeqCst);
        }
        self.state.cv.notify_all();
    }

    fn size(&self) -> (u16, u16) {
        self.size.get()
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.close_read_side();
        self.state.dropped.store(true, Ordering::SeqCst);
    }
}
