// src/io/mod.rs
//
// Device IO abstraction for serial line sessions.
// Provides the transport seam consumed by sessions, the device discovery seam,
// and the session types built on top of them.

// Core modules
mod error;
pub mod feed; // Broadcast fan-out used by framers and registries
mod session;
mod transport;
pub mod types;

// OS serial driver (desktop only)
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub mod serial;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{RegistryError, SessionError, TransportError};
pub use feed::{FeedEvent, MessageFeed, Subscription, SUBSCRIBER_QUEUE_CAPACITY};
pub use session::{MessageStream, PendingRead, Session, SubscriptionHandle};
pub use transport::TransportHandle;
pub use types::{ConnectionConfig, DeviceDescriptor, FlowControl, Parity, SessionState};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of the channel between a transport's reader and its session.
/// The session stops draining while a subscriber's queue is full; the channel
/// then fills and stalls the reader, which leaves bytes in the OS buffer.
pub const INCOMING_CHANNEL_CAPACITY: usize = 64;

/// Raw incoming byte chunks from an open transport.
/// Ends when the transport is closed; an `Err` item means the stream faulted.
pub type IncomingStream = mpsc::Receiver<Result<Vec<u8>, TransportError>>;

/// Sending half paired with [`IncomingStream`]
pub type IncomingSender = mpsc::Sender<Result<Vec<u8>, TransportError>>;

/// Create a bounded incoming channel for a transport
pub fn incoming_channel() -> (IncomingSender, IncomingStream) {
    mpsc::channel(INCOMING_CHANNEL_CAPACITY)
}

// ============================================================================
// Transport Seam
// ============================================================================

/// A byte-stream connection to one named device.
///
/// Implementations are constructed with their [`ConnectionConfig`] and are
/// driven exclusively by one [`TransportHandle`].
#[async_trait]
pub trait Transport: Send {
    /// Device identifier this transport addresses
    fn path(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Acquire the device
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Release the device. After this returns (even with an error)
    /// `is_open` must report the state the device was left in.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Transmit bytes as-is
    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drain any OS-level write buffer
    async fn flush(&mut self) -> Result<(), TransportError>;

    /// Take the incoming stream for the current open. Each open yields
    /// exactly one stream; later calls return None.
    fn take_incoming(&mut self) -> Option<IncomingStream>;
}

/// Builds transports for the registry, one per connect request
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ConnectionConfig) -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport> {
        self(config)
    }
}

// ============================================================================
// Discovery Seam
// ============================================================================

/// Lists devices available for connection
pub trait DeviceDiscovery {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;
}
