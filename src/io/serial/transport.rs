// src/io/serial/transport.rs
//
// serialport-backed Transport.
// The port is opened once and cloned: the clone feeds the blocking reader
// thread, the first handle serves writes and flushes.

use async_trait::async_trait;
use serialport::SerialPort;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::reader::{spawn_reader, ReaderExit, READ_POLL_TIMEOUT};
use super::utils::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity,
    to_serialport_stop_bits,
};
use crate::io::{
    incoming_channel, ConnectionConfig, IncomingStream, Transport, TransportError,
    TransportFactory,
};

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Serial port transport for one device
pub struct SerialTransport {
    config: ConnectionConfig,
    writer: Option<SharedPort>,
    cancel_flag: Arc<AtomicBool>,
    reader: Option<JoinHandle<ReaderExit>>,
    incoming: Option<IncomingStream>,
}

impl SerialTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            reader: None,
            incoming: None,
        }
    }

    fn shared_port(&self) -> Result<SharedPort, TransportError> {
        self.writer.clone().ok_or(TransportError::NotOpen)
    }
}

/// Open the port and clone it for the reader. Blocks; call from `spawn_blocking`.
fn open_port(
    config: &ConnectionConfig,
) -> Result<(Box<dyn SerialPort>, Box<dyn SerialPort>), TransportError> {
    let port = serialport::new(&config.path, config.baud_rate)
        .data_bits(to_serialport_data_bits(config.data_bits))
        .stop_bits(to_serialport_stop_bits(config.stop_bits))
        .parity(to_serialport_parity(config.parity))
        .flow_control(to_serialport_flow_control(config.flow_control))
        .timeout(READ_POLL_TIMEOUT)
        .open()
        .map_err(|e| TransportError::OpenFailed(format!("{}: {}", config.path, e)))?;
    let reader_port = port.try_clone().map_err(|e| {
        TransportError::OpenFailed(format!("{}: cannot clone port handle: {}", config.path, e))
    })?;
    Ok((port, reader_port))
}

/// Run blocking port IO off the async runtime
async fn run_blocking<F>(f: F) -> Result<(), TransportError>
where
    F: FnOnce() -> Result<(), TransportError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::IoError(format!("serial task failed: {}", e)))?
}

fn lock_port(
    port: &Mutex<Box<dyn SerialPort>>,
) -> Result<std::sync::MutexGuard<'_, Box<dyn SerialPort>>, TransportError> {
    port.lock()
        .map_err(|e| TransportError::IoError(format!("Port mutex poisoned: {}", e)))
}

#[async_trait]
impl Transport for SerialTransport {
    fn path(&self) -> &str {
        &self.config.path
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let config = self.config.clone();
        let (port, reader_port) = tokio::task::spawn_blocking(move || open_port(&config))
            .await
            .map_err(|e| TransportError::OpenFailed(format!("open task failed: {}", e)))??;

        // Fresh flag per open so a cancelled reader is never revived
        self.cancel_flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = incoming_channel();
        self.reader = Some(spawn_reader(
            self.config.path.clone(),
            reader_port,
            self.cancel_flag.clone(),
            tx,
        ));
        self.writer = Some(Arc::new(Mutex::new(port)));
        self.incoming = Some(rx);

        info!(
            "[serial:{}] opened at {} (flow control: {:?})",
            self.config.path,
            self.config.line_summary(),
            self.config.flow_control
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.cancel_flag.store(true, Ordering::Relaxed);
        // Dropping our handles releases the device once the reader exits
        self.writer = None;
        self.incoming = None;

        if let Some(reader) = self.reader.take() {
            let exit = reader
                .await
                .map_err(|e| TransportError::CloseFailed(format!("reader thread failed: {}", e)))?;
            debug!("[serial:{}] reader joined: {:?}", self.config.path, exit);
        }
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.shared_port()?;
        let data = bytes.to_vec();
        run_blocking(move || {
            let mut port = lock_port(&port)?;
            port.write_all(&data)
                .and_then(|_| port.flush())
                .map_err(|e| TransportError::IoError(format!("Serial write error: {}", e)))
        })
        .await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let port = self.shared_port()?;
        run_blocking(move || {
            lock_port(&port)?
                .flush()
                .map_err(|e| TransportError::IoError(format!("Serial flush error: {}", e)))
        })
        .await
    }

    fn take_incoming(&mut self) -> Option<IncomingStream> {
        self.incoming.take()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }
}

/// Creates a [`SerialTransport`] per connect request
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialTransportFactory;

impl TransportFactory for SerialTransportFactory {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport> {
        Box::new(SerialTransport::new(config.clone()))
    }
}
