// src/io/serial/reader.rs
//
// Blocking serial read loop.
// Runs on a blocking thread and forwards raw chunks to the session's drain
// loop through a bounded channel. A full channel stalls the loop, leaving
// unread bytes in the OS buffer.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::io::{IncomingSender, TransportError};

/// Port read timeout. Bounds how long `close` waits for the loop to notice cancellation.
pub(super) const READ_POLL_TIMEOUT: Duration = Duration::from_millis(50);

const READ_BUFFER_SIZE: usize = 256;

/// Why the read loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ReaderExit {
    /// `close` was requested
    Cancelled,
    /// The session stopped listening
    ReceiverGone,
    /// EOF from the port (device unplugged)
    Disconnected,
    Failed(String),
}

/// Spawn the read loop for an open port on a blocking thread
pub(super) fn spawn_reader<R>(
    path: String,
    port: R,
    cancel_flag: Arc<AtomicBool>,
    tx: IncomingSender,
) -> JoinHandle<ReaderExit>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let exit = run_reader_blocking(port, &cancel_flag, &tx);
        debug!("[serial:{}] reader stopped: {:?}", path, exit);
        exit
    })
}

/// Read until cancelled, disconnected, failed, or nobody is listening.
/// EOF and read errors are forwarded as an `Err` chunk before returning.
pub(super) fn run_reader_blocking<R: Read>(
    mut port: R,
    cancel_flag: &AtomicBool,
    tx: &IncomingSender,
) -> ReaderExit {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            return ReaderExit::Cancelled;
        }

        match port.read(&mut buf) {
            Ok(0) => {
                // EOF - port closed/disconnected
                let _ = tx.blocking_send(Err(TransportError::IoError(
                    "device disconnected".to_string(),
                )));
                return ReaderExit::Disconnected;
            }
            Ok(n) => {
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    return ReaderExit::ReceiverGone;
                }
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                // Timeout is expected for serial reads
            }
            Err(e) => {
                let reason = format!("read error: {}", e);
                warn!("[serial] {}", reason);
                let _ = tx.blocking_send(Err(TransportError::IoError(reason.clone())));
                return ReaderExit::Failed(reason);
            }
        }
    }
}
