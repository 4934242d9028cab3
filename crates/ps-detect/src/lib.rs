//! PS02 Sensor Discovery Library
//!
//! This crate finds PS02 sensors on both transports:
//!
//! - **USB**: serial ports are enumerated and matched on their `VID:PID=`
//!   hardware ID, optionally preferring a serial number
//! - **BLE**: a timed scan is deduplicated per address, filtered to devices
//!   advertising the UART service under the configured name prefix, and one
//!   candidate is picked by preferred address or signal strength
//!
//! Selection logic is pure and works on plain data, so it is tested without
//! hardware; only [`PortScanner`] and [`BleScanner`] touch the OS.
//!
//! # Example
//!
//! ```rust,no_run
//! use ps_detect::{select_port, PortScanner, DEFAULT_VIDPID};
//!
//! let ports = PortScanner::new().find_ports(&DEFAULT_VIDPID).unwrap();
//! let port = select_port(&ports, None).unwrap();
//! println!("PS02 on {}", port);
//! ```

pub mod ble;
pub mod error;
pub mod usb;

pub use ble::{
    filter_candidates, list_devices, select_candidate, Advertisement, AdvertisementTable,
    BleDeviceSummary, BleScanner, DEFAULT_NAME_PREFIX,
};
pub use error::DetectError;
pub use usb::{find_ports, select_port, PortScanner, UsbPortInfo, VidPid, DEFAULT_VIDPID};
