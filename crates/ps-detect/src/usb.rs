//! Serial port discovery
//!
//! PS02 sensors enumerate as USB CDC devices. Ports are matched on the
//! `VID:PID=` field of their hardware ID, rendered the same way on every
//! platform so that matching and serial-number preference stay textual.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};
use tracing::{debug, info};

use crate::error::DetectError;

/// Default PS02 USB identifier
pub const DEFAULT_VIDPID: VidPid = VidPid {
    vid: 0x1915,
    pid: 0x521A,
};

/// USB vendor/product identifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VidPid {
    pub vid: u16,
    pub pid: u16,
}

impl VidPid {
    /// Hardware-ID fragment this identifier matches, e.g. `VID:PID=1915:521A`
    pub fn needle(&self) -> String {
        format!("VID:PID={}", self)
    }
}

impl fmt::Display for VidPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

impl FromStr for VidPid {
    type Err = DetectError;

    /// Accepts `1915:521A` and `VID:PID=1915:521A`, any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let body = upper.strip_prefix("VID:PID=").unwrap_or(&upper);
        let (vid, pid) = body
            .split_once(':')
            .ok_or_else(|| DetectError::InvalidVidPid(s.to_string()))?;
        let parse = |v: &str| {
            u16::from_str_radix(v, 16).map_err(|_| DetectError::InvalidVidPid(s.to_string()))
        };
        Ok(Self {
            vid: parse(vid)?,
            pid: parse(pid)?,
        })
    }
}

impl TryFrom<String> for VidPid {
    type Error = DetectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VidPid> for String {
    fn from(v: VidPid) -> Self {
        v.to_string()
    }
}

impl Default for VidPid {
    fn default() -> Self {
        DEFAULT_VIDPID
    }
}

/// Information about a serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbPortInfo {
    /// Port name (e.g., /dev/ttyACM0, COM3)
    pub port: String,
    /// USB Vendor ID (if USB)
    pub vid: Option<u16>,
    /// USB Product ID (if USB)
    pub pid: Option<u16>,
    /// USB serial number (if available)
    pub serial_number: Option<String>,
    /// USB product string
    pub product: Option<String>,
}

impl UsbPortInfo {
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                port: name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number.clone(),
                product: usb.product.clone(),
            },
            _ => Self {
                port: name,
                vid: None,
                pid: None,
                serial_number: None,
                product: None,
            },
        }
    }

    /// Hardware ID string, e.g. `USB VID:PID=1915:521A SER=ABC123`
    ///
    /// Non-USB ports render as `n/a`.
    pub fn hardware_id(&self) -> String {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => {
                let mut hwid = format!("USB {}", VidPid { vid, pid }.needle());
                if let Some(ser) = &self.serial_number {
                    hwid.push_str(" SER=");
                    hwid.push_str(ser);
                }
                hwid
            }
            _ => "n/a".to_string(),
        }
    }

    /// Whether this port's hardware ID carries `vidpid`
    pub fn matches(&self, vidpid: &VidPid) -> bool {
        self.hardware_id()
            .to_uppercase()
            .contains(&vidpid.needle())
    }
}

/// Serial port scanner
#[derive(Debug, Default)]
pub struct PortScanner;

impl PortScanner {
    pub fn new() -> Self {
        Self
    }

    /// Enumerate all available serial ports
    pub fn enumerate_ports(&self) -> Result<Vec<UsbPortInfo>, DetectError> {
        let ports = available_ports()?;
        let result: Vec<_> = ports
            .into_iter()
            .map(|p| UsbPortInfo::from_serialport(p.port_name, &p.port_type))
            .collect();

        debug!("Found {} serial port(s)", result.len());
        for port in &result {
            debug!("  {} - {}", port.port, port.hardware_id());
        }
        Ok(result)
    }

    /// Enumerate ports whose hardware ID carries `vidpid`, in enumeration order
    pub fn find_ports(&self, vidpid: &VidPid) -> Result<Vec<UsbPortInfo>, DetectError> {
        Ok(find_ports(self.enumerate_ports()?, vidpid))
    }
}

/// Keep only the ports matching `vidpid`
pub fn find_ports(ports: Vec<UsbPortInfo>, vidpid: &VidPid) -> Vec<UsbPortInfo> {
    ports.into_iter().filter(|p| p.matches(vidpid)).collect()
}

/// Choose one port among candidates
///
/// With a preferred serial number, the first port whose hardware ID contains
/// `SER=<serial>` wins. Otherwise (or if none carries it) the first candidate
/// is taken.
pub fn select_port(ports: &[UsbPortInfo], prefer_serial: Option<&str>) -> Result<String, DetectError> {
    let first = ports
        .first()
        .ok_or_else(|| DetectError::DeviceNotFound("no matching USB ports found".to_string()))?;

    if let Some(ser) = prefer_serial.filter(|s| !s.is_empty()) {
        let needle = format!("SER={}", ser.to_uppercase());
        if let Some(port) = ports
            .iter()
            .find(|p| p.hardware_id().to_uppercase().contains(&needle))
        {
            info!("Selected {} by serial number {}", port.port, ser);
            return Ok(port.port.clone());
        }
        debug!("No port carries serial {}, falling back to first match", ser);
    }

    info!("Selected {}", first.port);
    Ok(first.port.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo as SpUsbPortInfo;

    fn port(name: &str, vid: u16, pid: u16, ser: Option<&str>) -> UsbPortInfo {
        UsbPortInfo {
            port: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            serial_number: ser.map(str::to_string),
            product: None,
        }
    }

    #[test]
    fn test_vidpid_parse() {
        let v: VidPid = "1915:521a".parse().unwrap();
        assert_eq!(v, DEFAULT_VIDPID);
        assert_eq!(v.to_string(), "1915:521A");

        let v: VidPid = "vid:pid=1915:521A".parse().unwrap();
        assert_eq!(v, DEFAULT_VIDPID);

        assert!("1915".parse::<VidPid>().is_err());
        assert!("zz:521A".parse::<VidPid>().is_err());
    }

    #[test]
    fn test_hardware_id() {
        let p = port("/dev/ttyACM0", 0x1915, 0x521A, Some("abc123"));
        assert_eq!(p.hardware_id(), "USB VID:PID=1915:521A SER=abc123");

        let p = UsbPortInfo::from_serialport("/dev/ttyS0".to_string(), &SerialPortType::Unknown);
        assert_eq!(p.hardware_id(), "n/a");
        assert!(!p.matches(&DEFAULT_VIDPID));
    }

    #[test]
    fn test_from_serialport_usb() {
        let usb = SerialPortType::UsbPort(SpUsbPortInfo {
            vid: 0x1915,
            pid: 0x521A,
            serial_number: Some("X1".to_string()),
            manufacturer: None,
            product: Some("PS02".to_string()),
        });
        let p = UsbPortInfo::from_serialport("COM3".to_string(), &usb);
        assert!(p.matches(&DEFAULT_VIDPID));
        assert_eq!(p.product.as_deref(), Some("PS02"));
    }

    #[test]
    fn test_find_ports_filters_in_order() {
        let ports = vec![
            port("/dev/ttyUSB0", 0x0403, 0x6001, None),
            port("/dev/ttyACM0", 0x1915, 0x521A, Some("A")),
            port("/dev/ttyACM1", 0x1915, 0x521A, Some("B")),
        ];
        let found = find_ports(ports, &DEFAULT_VIDPID);
        let names: Vec<_> = found.iter().map(|p| p.port.as_str()).collect();
        assert_eq!(names, ["/dev/ttyACM0", "/dev/ttyACM1"]);
    }

    #[test]
    fn test_select_port_prefers_serial() {
        let ports = vec![
            port("/dev/ttyACM0", 0x1915, 0x521A, Some("AAA")),
            port("/dev/ttyACM1", 0x1915, 0x521A, Some("BBB")),
        ];
        assert_eq!(select_port(&ports, Some("bbb")).unwrap(), "/dev/ttyACM1");
        assert_eq!(select_port(&ports, Some("zzz")).unwrap(), "/dev/ttyACM0");
        assert_eq!(select_port(&ports, None).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn test_select_port_empty() {
        assert!(matches!(
            select_port(&[], None),
            Err(DetectError::DeviceNotFound(_))
        ));
    }
}
