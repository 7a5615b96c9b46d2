// src/io/error.rs
//
// Error taxonomy for the transport, session and registry layers.
// Transport errors are wrapped by the session; registry errors are final.

use thiserror::Error;

/// Failures raised by a physical (or virtual) byte-stream transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The OS or driver refused to open the device (busy, missing, permission denied)
    #[error("failed to open device: {0}")]
    OpenFailed(String),
    /// The device could not be released cleanly
    #[error("failed to close device: {0}")]
    CloseFailed(String),
    #[error("device is not open")]
    NotOpen,
    /// Read or write failure on an open device
    #[error("device I/O error: {0}")]
    IoError(String),
}

/// Failures surfaced by a [`Session`](super::Session).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is not open")]
    NotOpen,
    #[error("timed out waiting for a message")]
    ReadTimeout,
    /// The drain loop hit an unrecoverable transport error. Sticky until the
    /// session is discarded.
    #[error("transport faulted: {0}")]
    TransportFaulted(String),
    /// The session was disconnected while a one-shot read was waiting
    #[error("session closed while waiting for a message")]
    Closed,
    /// The session is logically closed, but the device may still be engaged
    /// because releasing it failed.
    #[error("session closed but device release is uncertain: {0}")]
    ReleaseUncertain(String),
    /// A single-use session was disconnected and may not reconnect
    #[error("session has been retired and cannot reconnect")]
    Retired,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures surfaced by the [`SessionRegistry`](crate::sessions::SessionRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("device {0} already has a live session")]
    AlreadyConnected(String),
    #[error("no session for device {0}")]
    NotFound(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}
