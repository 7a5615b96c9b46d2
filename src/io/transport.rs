// src/io/transport.rs
//
// Lifecycle wrapper around one transport: idempotent open/close, write
// termination, flush.

use tracing::{debug, info, warn};

use super::{IncomingStream, Transport, TransportError};

/// Owns one physical connection
pub struct TransportHandle {
    transport: Box<dyn Transport>,
    write_termination: Vec<u8>,
}

impl TransportHandle {
    pub fn new(transport: Box<dyn Transport>, write_termination: &str) -> Self {
        Self {
            transport,
            write_termination: write_termination.as_bytes().to_vec(),
        }
    }

    pub fn path(&self) -> &str {
        self.transport.path()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Open the device. No-op if already open.
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.transport.is_open() {
            return Ok(());
        }
        match self.transport.open().await {
            Ok(()) => {
                info!("[transport:{}] opened", self.path());
                Ok(())
            }
            Err(e) => {
                warn!("[transport:{}] open failed: {}", self.path(), e);
                Err(e)
            }
        }
    }

    /// Close the device. No-op if already closed.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if !self.transport.is_open() {
            return Ok(());
        }
        match self.transport.close().await {
            Ok(()) => {
                info!("[transport:{}] closed", self.path());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[transport:{}] close failed (still open: {}): {}",
                    self.path(),
                    self.transport.is_open(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Transmit `bytes` followed by the write termination
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.transport.is_open() {
            return Err(TransportError::NotOpen);
        }

        let mut frame = Vec::with_capacity(bytes.len() + self.write_termination.len());
        frame.extend_from_slice(bytes);
        frame.extend_from_slice(&self.write_termination);

        debug!("[transport:{}] write {} bytes", self.path(), frame.len());
        self.transport.write_raw(&frame).await
    }

    /// Drain the OS write buffer. No-op if not open.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        if !self.transport.is_open() {
            return Ok(());
        }
        self.transport.flush().await
    }

    pub fn take_incoming(&mut self) -> Option<IncomingStream> {
        self.transport.take_incoming()
    }
}
