//! Serial backends: port enumeration and opening.

use anyhow::Result;
use std::io::{Read, Write};
use std::time::Duration;

/// A bidirectional byte stream to a device.
pub trait SerialIo: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialIo for T {}

/// A serial-capable hardware interface as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS port name, e.g. `/dev/ttyACM0` or `COM3`.
    pub identifier: String,
    /// USB vendor id, when the port is USB.
    pub vid: Option<u16>,
    /// USB product id, when the port is USB.
    pub pid: Option<u16>,
    /// USB serial number string.
    pub serial_number: Option<String>,
    /// Human-readable product name.
    pub description: Option<String>,
}

impl PortInfo {
    /// A port without USB metadata.
    pub fn plain(identifier: impl Into<String>) -> Self {
        Self { identifier: identifier.into(), vid: None, pid: None, serial_number: None, description: None }
    }

    /// A USB port with the given vendor and product id.
    pub fn usb(identifier: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self { vid: Some(vid), pid: Some(pid), ..Self::plain(identifier) }
    }

    /// Human-readable name for menus.
    pub fn name(&self) -> String {
        match (self.vid, self.pid, &self.description) {
            (Some(vid), Some(pid), Some(desc)) => format!("{} - {} ({:04X}:{:04X})", self.identifier, desc, vid, pid),
            (Some(vid), Some(pid), None) => format!("{} ({:04X}:{:04X})", self.identifier, vid, pid),
            _ => self.identifier.clone(),
        }
    }
}

/// Seam between the device manager and the operating system.
pub trait SerialBackend: Send + Sync {
    /// Currently attached serial-capable interfaces.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open a port. Reads on the returned stream time out after
    /// `read_timeout` with `ErrorKind::TimedOut`.
    fn open(&self, identifier: &str, baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn SerialIo>>;
}

#[cfg(feature = "hardware")]
pub use native::NativeBackend;

#[cfg(feature = "hardware")]
mod native {
    use super::{PortInfo, SerialBackend, SerialIo};
    use anyhow::{Context as _, Result};
    use serialport::{SerialPortInfo, SerialPortType};
    use std::time::Duration;

    /// Backend over the operating system's serial ports.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NativeBackend;

    impl NativeBackend {
        /// The OS backend.
        pub fn new() -> Self {
            Self
        }
    }

    impl From<SerialPortInfo> for PortInfo {
        fn from(info: SerialPortInfo) -> Self {
            match info.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    identifier: info.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    serial_number: usb.serial_number,
                    description: usb.product,
                },
                _ => PortInfo::plain(info.port_name),
            }
        }
    }

    impl SerialBackend for NativeBackend {
        fn list_ports(&self) -> Result<Vec<PortInfo>> {
            let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
            Ok(ports.into_iter().map(PortInfo::from).collect())
        }

        fn open(&self, identifier: &str, baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn SerialIo>> {
            let port = serialport::new(identifier, baud_rate)
                .timeout(read_timeout)
                .open()
                .with_context(|| format!("Failed to open {} at {} baud", identifier, baud_rate))?;
            Ok(Box::new(port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_names() {
        let mut info = PortInfo::usb("/dev/ttyACM0", 0x2886, 0x802D);
        assert_eq!(info.name(), "/dev/ttyACM0 (2886:802D)");
        info.description = Some("Wio Terminal".to_string());
        assert_eq!(info.name(), "/dev/ttyACM0 - Wio Terminal (2886:802D)");
        assert_eq!(PortInfo::plain("COM3").name(), "COM3");
    }

    #[cfg(feature = "hardware")]
    #[test]
    fn test_native_listing_does_not_panic() {
        // Without hardware this is usually empty, possibly an error in sandboxes.
        let _ = NativeBackend::new().list_ports();
    }
}
