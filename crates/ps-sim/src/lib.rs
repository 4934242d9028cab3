//! PS02 Sensor Simulation Library
//!
//! This crate provides virtual PS02 sensors for testing the session engine
//! without hardware. It includes:
//!
//! - **VirtualSensor**: speaks the real USB line or BLE notification format
//!   over in-memory transports and logs every device call
//! - **SimConnector**: a [`DeviceConnector`](ps_session::DeviceConnector)
//!   handing out virtual sensors, with failure injection
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ps_protocol::Transport;
//! use ps_session::{SessionConfig, SessionEngine, TimingSettings};
//! use ps_sim::SimConnector;
//!
//! let connector = Arc::new(SimConnector::default());
//! let config = SessionConfig {
//!     timing: TimingSettings::fast(),
//!     ..SessionConfig::default()
//! };
//! let engine = SessionEngine::new(config, connector.clone());
//!
//! engine.start(Transport::Usb).unwrap();
//! let frame = engine.pop_frame(Duration::from_secs(1)).unwrap();
//! assert!(frame.samples.iter().all(|&s| s == 15));
//! engine.stop().unwrap();
//! ```

pub mod connector;
pub mod sensor;

pub use connector::{Fault, SimConnector};
pub use sensor::{EventLog, PipeReader, SimEvent, VirtualSensor, VirtualSensorConfig};
