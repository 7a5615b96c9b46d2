// src/io/serial/discovery.rs
//
// Serial port enumeration.

use serialport::{SerialPortInfo, SerialPortType};

use crate::io::{DeviceDescriptor, DeviceDiscovery, TransportError};

/// Discovery backed by the OS serial port list
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialDiscovery;

impl DeviceDiscovery for SerialDiscovery {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        list_serial_ports()
    }
}

/// List available serial ports
pub fn list_serial_ports() -> Result<Vec<DeviceDescriptor>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::IoError(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|p| is_listed(&p.port_name))
        .map(describe_port)
        .collect())
}

/// On macOS only /dev/cu.* (calling unit) devices are listed; /dev/tty.* block on open
fn is_listed(_port_name: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        !_port_name.starts_with("/dev/tty.")
    }
    #[cfg(not(target_os = "macos"))]
    {
        true
    }
}

fn describe_port(port: SerialPortInfo) -> DeviceDescriptor {
    let mut descriptor = DeviceDescriptor {
        identifier: port.port_name,
        port_type: String::new(),
        manufacturer: None,
        product: None,
        serial_number: None,
        vendor_id: None,
        product_id: None,
        location_id: None,
    };

    descriptor.port_type = match port.port_type {
        SerialPortType::UsbPort(info) => {
            descriptor.manufacturer = info.manufacturer;
            descriptor.product = info.product;
            descriptor.serial_number = info.serial_number;
            descriptor.vendor_id = Some(info.vid);
            descriptor.product_id = Some(info.pid);
            "usb"
        }
        SerialPortType::BluetoothPort => "bluetooth",
        SerialPortType::PciPort => "pci",
        SerialPortType::Unknown => "unknown",
    }
    .to_string();

    descriptor
}
