// src/io/testing.rs
//
// Scripted in-memory transport for session and registry tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    incoming_channel, ConnectionConfig, IncomingSender, IncomingStream, Transport,
    TransportError, TransportFactory,
};

/// Shared view into a mock transport: counters, captured writes, and the
/// sending side of its incoming stream.
#[derive(Default)]
pub(crate) struct MockProbe {
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    flush_calls: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
    fail_open: Mutex<Option<String>>,
    fail_close: Mutex<Option<String>>,
    fail_write: Mutex<Option<String>>,
    sender: Mutex<Option<IncomingSender>>,
    banner: Mutex<Option<String>>,
}

impl MockProbe {
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn fail_next_open(&self, reason: &str) {
        *self.fail_open.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_next_close(&self, reason: &str) {
        *self.fail_close.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_next_write(&self, reason: &str) {
        *self.fail_write.lock().unwrap() = Some(reason.to_string());
    }

    /// Bytes the device sends as soon as it is opened
    pub fn send_on_open(&self, data: &str) {
        *self.banner.lock().unwrap() = Some(data.to_string());
    }

    /// Deliver bytes as if they arrived from the device
    pub async fn push(&self, data: &str) {
        let tx = self.sender.lock().unwrap().clone();
        tx.expect("mock transport is not open")
            .send(Ok(data.as_bytes().to_vec()))
            .await
            .expect("incoming stream dropped");
    }

    /// Fail the incoming stream with an IO error
    pub async fn inject_error(&self, reason: &str) {
        let tx = self.sender.lock().unwrap().clone();
        tx.expect("mock transport is not open")
            .send(Err(TransportError::IoError(reason.to_string())))
            .await
            .expect("incoming stream dropped");
    }

    /// End the incoming stream as if the device vanished
    pub fn end_stream(&self) {
        self.sender.lock().unwrap().take();
    }
}

pub(crate) struct MockTransport {
    path: String,
    open: bool,
    probe: Arc<MockProbe>,
    incoming: Option<IncomingStream>,
}

impl MockTransport {
    pub fn new(path: &str) -> (Self, Arc<MockProbe>) {
        let probe = Arc::new(MockProbe::default());
        (Self::with_probe(path, probe.clone()), probe)
    }

    pub fn with_probe(path: &str, probe: Arc<MockProbe>) -> Self {
        Self {
            path: path.to_string(),
            open: false,
            probe,
            incoming: None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn path(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        self.probe.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.probe.fail_open.lock().unwrap().take() {
            return Err(TransportError::OpenFailed(reason));
        }
        let (tx, rx) = incoming_channel();
        if let Some(banner) = self.probe.banner.lock().unwrap().take() {
            let _ = tx.try_send(Ok(banner.into_bytes()));
        }
        *self.probe.sender.lock().unwrap() = Some(tx);
        self.incoming = Some(rx);
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        // Like a real port, the handle is dropped even when release fails
        self.open = false;
        self.incoming = None;
        self.probe.sender.lock().unwrap().take();
        match self.probe.fail_close.lock().unwrap().take() {
            Some(reason) => Err(TransportError::CloseFailed(reason)),
            None => Ok(()),
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if let Some(reason) = self.probe.fail_write.lock().unwrap().take() {
            return Err(TransportError::IoError(reason));
        }
        self.probe.written.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.probe.flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_incoming(&mut self) -> Option<IncomingStream> {
        self.incoming.take()
    }
}

/// Factory handing out mock transports that share one probe per path
#[derive(Default)]
pub(crate) struct MockFactory {
    probes: Mutex<HashMap<String, Arc<MockProbe>>>,
}

impl MockFactory {
    pub fn probe(&self, path: &str) -> Arc<MockProbe> {
        self.probes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport> {
        Box::new(MockTransport::with_probe(&config.path, self.probe(&config.path)))
    }
}
