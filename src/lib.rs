// src/lib.rs
//
// serialtap: serial line sessions.
// Byte streams from serial devices are framed into messages, fanned out to
// subscribers, and written back with configurable terminations. Sessions are
// owned by a SessionRegistry that allows one live connection per device.

pub mod framing;
pub mod io;
pub mod logging;
pub mod sessions;
pub mod settings;

pub use framing::{parse_delimiter, LineFramer};
pub use io::{
    ConnectionConfig, DeviceDescriptor, RegistryError, Session, SessionError, SessionState,
    TransportError,
};
pub use sessions::{DeviceMessage, SessionRegistry};
