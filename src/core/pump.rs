//! Session I/O thread body
//!
//! Drains the transport until end of stream or until the session asks it to
//! stop. Every read result is one batch: it goes through the title scanner and
//! the terminal engine, replies owed to the child are written back, and the
//! dirty flag is raised.

use std::sync::Arc;

use super::session::SessionShared;
use super::title::TitleScanner;

const READ_BUFFER_SIZE: usize = 4096;

/// Run until the transport reports end of stream or an error, or until the
/// exited flag is observed. Always leaves the exited flag set.
pub(crate) fn run(shared: Arc<SessionShared>, mut scanner: TitleScanner) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    tracing::debug!("I/O thread started");

    while !shared.signals.has_exited() {
        let n = match shared.transport.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!("PTY reached end of stream");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("PTY read failed, ending session: {}", e);
                break;
            }
        };

        process_batch(&shared, &mut scanner, &buffer[..n]);
    }

    shared.signals.mark_exited();
    tracing::debug!("I/O thread finished");
}

fn process_batch(shared: &SessionShared, scanner: &mut TitleScanner, bytes: &[u8]) {
    scanner.reset_batch();
    if scanner.feed(bytes) {
        shared.signals.ring_bell();
    }

    let responses = shared.lock_engine().feed(bytes);
    for response in responses {
        tracing::debug!("Answering terminal query: {:?}", response);
        if let Err(e) = shared.transport.write(&response.to_bytes()) {
            tracing::warn!("Failed to send terminal response: {}", e);
        }
    }

    if scanner.take_changed() {
        let snapshot = scanner.snapshot();
        tracing::debug!("Title changed: {:?}", snapshot.title);
        *shared.title_mut() = snapshot;
    }

    shared.signals.mark_dirty();
}
