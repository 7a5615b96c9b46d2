// src/io/serial/mod.rs
//
// OS serial port driver for sessions, built on the serialport crate.
//
// Features:
// - Transport implementation (open/close/write/flush + incoming byte chunks)
// - Blocking reader thread feeding the session's drain loop
// - Port discovery (list available devices)

mod discovery;
mod reader;
mod transport;
pub(crate) mod utils;

pub use discovery::{list_serial_ports, SerialDiscovery};
pub use transport::{SerialTransport, SerialTransportFactory};
