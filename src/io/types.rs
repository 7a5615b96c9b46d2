// src/io/types.rs
//
// Shared value types for sessions and transports.

use serde::{Deserialize, Serialize};

/// Read termination used when none (or an empty one) is configured
pub const DEFAULT_READ_TERMINATION: &str = "\n";

// ============================================================================
// Line Settings
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Flow control setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

// ============================================================================
// Connection Configuration
// ============================================================================

/// Immutable parameters for one connection. Built once at connect time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Device identifier (e.g. "/dev/ttyUSB0", "COM3")
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Open the device as soon as the session is established
    #[serde(default)]
    pub open_on_create: bool,
    /// Appended to every outgoing message
    #[serde(default)]
    pub write_termination: String,
    /// Delimiter separating incoming messages
    #[serde(default = "default_read_termination")]
    pub read_termination: String,
    /// Emit a buffered fragment once it reaches this many bytes, even without a delimiter
    #[serde(default)]
    pub max_line_length: Option<usize>,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_read_termination() -> String {
    DEFAULT_READ_TERMINATION.to_string()
}

impl ConnectionConfig {
    /// Configuration for `path` with 9600 8-N-1 and default terminations
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            flow_control: FlowControl::None,
            open_on_create: false,
            write_termination: String::new(),
            read_termination: default_read_termination(),
            max_line_length: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_write_termination(mut self, termination: impl Into<String>) -> Self {
        self.write_termination = termination.into();
        self
    }

    pub fn with_read_termination(mut self, termination: impl Into<String>) -> Self {
        self.read_termination = termination.into();
        self
    }

    pub fn with_open_on_create(mut self, open: bool) -> Self {
        self.open_on_create = open;
        self
    }

    pub fn with_max_line_length(mut self, max: Option<usize>) -> Self {
        self.max_line_length = max;
        self
    }

    /// The delimiter actually used for framing. Empty falls back to "\n".
    pub fn effective_read_termination(&self) -> &str {
        if self.read_termination.is_empty() {
            DEFAULT_READ_TERMINATION
        } else {
            &self.read_termination
        }
    }

    /// Short line-settings summary, e.g. "115200 8-N-1"
    pub fn line_summary(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        format!(
            "{} {}-{}-{}",
            self.baud_rate, self.data_bits, parity, self.stop_bits
        )
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
    /// Terminal. Carries the transport failure that caused it.
    Faulted(String),
}

impl SessionState {
    /// Open or Opening: the device is (or is about to be) engaged
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Opening)
    }
}

// ============================================================================
// Device Discovery
// ============================================================================

/// One device reported by a discovery service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub identifier: String,
    /// "usb", "bluetooth", "pci" or "unknown"
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub location_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.write_termination, "");
        assert_eq!(config.read_termination, "\n");
        assert!(!config.open_on_create);
        assert_eq!(config.line_summary(), "9600 8-N-1");
    }

    #[test]
    fn test_empty_read_termination_falls_back() {
        let config = ConnectionConfig::new("COM3").with_read_termination("");
        assert_eq!(config.effective_read_termination(), "\n");

        let config = ConnectionConfig::new("COM3").with_read_termination("\r\n");
        assert_eq!(config.effective_read_termination(), "\r\n");
    }

    #[test]
    fn test_config_deserialize_with_defaults() {
        let json = r#"{"path": "/dev/ttyACM0", "baud_rate": 115200, "parity": "even"}"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.path, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, 1);
        assert_eq!(config.read_termination, "\n");
        assert_eq!(config.max_line_length, None);
    }

    #[test]
    fn test_state_liveness() {
        assert!(SessionState::Open.is_live());
        assert!(SessionState::Opening.is_live());
        assert!(!SessionState::Closing.is_live());
        assert!(!SessionState::Closed.is_live());
        assert!(!SessionState::Faulted("gone".to_string()).is_live());
    }
}
