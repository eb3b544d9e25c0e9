//! Serial endpoint naming: the platform scan list, by-id resolution, OS enumeration.
//!
//! Device nodes such as `/dev/ttyUSB0` get renumbered across reboots and replugs.
//! Discovery copes with that by scanning a fixed list; callers who want a stable
//! name can pass a udev by-id link instead, which is resolved here first.
//!
//! # Linux `/dev/serial/by-id/` Format
//!
//! ```text
//! usb-{VENDOR}_{MODEL}_{SERIAL}-if{INTERFACE}-port{PORT}
//! ```

use std::path::{Path, PathBuf};

const BY_ID_DIR: &str = "/dev/serial/by-id";

/// Endpoint tried first when the caller names none.
pub fn default_port() -> &'static str {
    if cfg!(windows) {
        "COM7"
    } else {
        "/dev/ttyUSB0"
    }
}

/// The platform's candidate endpoints, in scan order.
///
/// Windows: `COM1`..`COM32`. Elsewhere: `/dev/ttyUSB0-9`, then `/dev/ttyS0-31`,
/// then `/dev/tty0-63`.
pub fn candidate_ports() -> Vec<String> {
    if cfg!(windows) {
        (1..=32).map(|i| format!("COM{i}")).collect()
    } else {
        let ranges: [(&str, u32); 3] = [("/dev/ttyUSB", 10), ("/dev/ttyS", 32), ("/dev/tty", 64)];
        ranges
            .iter()
            .flat_map(|(prefix, count)| (0..*count).map(move |i| format!("{prefix}{i}")))
            .collect()
    }
}

/// The by-id link a name refers to, if it is a by-id name at all.
///
/// Accepts both the short form (`usb-FTDI_...-if00-port0`) and the full path.
pub fn by_id_path(name: &str) -> Option<PathBuf> {
    if name.starts_with(BY_ID_DIR) {
        Some(PathBuf::from(name))
    } else if name.starts_with("usb-") {
        Some(Path::new(BY_ID_DIR).join(name))
    } else {
        None
    }
}

/// Map a by-id name to its device node. Any other name is returned unchanged.
///
/// A by-id link that does not exist is also returned unchanged; opening it will
/// fail and discovery falls through to scanning.
pub fn resolve_endpoint(name: &str) -> String {
    let Some(link) = by_id_path(name) else {
        return name.to_string();
    };

    match std::fs::canonicalize(&link) {
        Ok(device) => {
            let device = device.to_string_lossy().into_owned();
            tracing::debug!(by_id = name, device = %device, "Resolved by-id endpoint");
            device
        }
        Err(e) => {
            tracing::debug!(by_id = name, error = %e, "By-id endpoint did not resolve");
            name.to_string()
        }
    }
}

/// A serial port reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path or COM name
    pub device_path: String,
    /// `usb`, `pci`, `bluetooth` or `unknown`
    pub kind: &'static str,
    /// USB manufacturer string (if available)
    pub vendor: Option<String>,
    /// USB product string (if available)
    pub model: Option<String>,
    /// USB serial number (if available)
    pub serial: Option<String>,
}

/// List the serial ports the OS knows about, sorted by device path.
#[cfg(feature = "serial")]
pub fn available_ports() -> act_core::ActResult<Vec<PortInfo>> {
    use serialport::SerialPortType;

    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .map_err(|e| act_core::ActError::Io(std::io::Error::other(e.to_string())))?
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                device_path: p.port_name,
                kind: "usb",
                vendor: usb.manufacturer,
                model: usb.product,
                serial: usb.serial_number,
            },
            SerialPortType::PciPort => PortInfo {
                device_path: p.port_name,
                kind: "pci",
                vendor: None,
                model: None,
                serial: None,
            },
            SerialPortType::BluetoothPort => PortInfo {
                device_path: p.port_name,
                kind: "bluetooth",
                vendor: None,
                model: None,
                serial: None,
            },
            SerialPortType::Unknown => PortInfo {
                device_path: p.port_name,
                kind: "unknown",
                vendor: None,
                model: None,
                serial: None,
            },
        })
        .collect();

    ports.sort_by(|a, b| a.device_path.cmp(&b.device_path));
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(windows))]
    fn unix_scan_order() {
        let ports = candidate_ports();
        assert_eq!(ports.len(), 10 + 32 + 64);
        assert_eq!(ports[0], "/dev/ttyUSB0");
        assert_eq!(ports[9], "/dev/ttyUSB9");
        assert_eq!(ports[10], "/dev/ttyS0");
        assert_eq!(ports[41], "/dev/ttyS31");
        assert_eq!(ports[42], "/dev/tty0");
        assert_eq!(ports.last().map(String::as_str), Some("/dev/tty63"));
        assert_eq!(default_port(), "/dev/ttyUSB0");
    }

    #[test]
    #[cfg(windows)]
    fn windows_scan_order() {
        let ports = candidate_ports();
        assert_eq!(ports.len(), 32);
        assert_eq!(ports[0], "COM1");
        assert_eq!(ports[31], "COM32");
        assert_eq!(default_port(), "COM7");
    }

    #[test]
    fn by_id_names_are_recognized() {
        assert_eq!(
            by_id_path("usb-FTDI_FT230X_Basic_UART_DJ00XXXX-if00-port0"),
            Some(PathBuf::from(
                "/dev/serial/by-id/usb-FTDI_FT230X_Basic_UART_DJ00XXXX-if00-port0"
            ))
        );
        assert_eq!(
            by_id_path("/dev/serial/by-id/usb-X-if00-port0"),
            Some(PathBuf::from("/dev/serial/by-id/usb-X-if00-port0"))
        );
        assert_eq!(by_id_path("/dev/ttyUSB0"), None);
        assert_eq!(by_id_path("COM3"), None);
    }

    #[test]
    fn plain_and_missing_names_pass_through() {
        assert_eq!(resolve_endpoint("/dev/ttyUSB3"), "/dev/ttyUSB3");
        assert_eq!(
            resolve_endpoint("usb-Nobody_Nothing_0000-if00-port0"),
            "usb-Nobody_Nothing_0000-if00-port0"
        );
    }
}
