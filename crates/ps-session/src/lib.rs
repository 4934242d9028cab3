//! PS02 Acquisition Session Engine
//!
//! This crate drives one PS02 sensor at a time, over USB serial or BLE, and
//! fans its frames out to live consumers and an optional CSV recording.
//!
//! # Architecture
//!
//! Both drivers implement [`SensorDevice`], so the engine is written once.
//! What differs is how frames arrive:
//!
//! - **USB**: blocking serial reads, consumed on a dedicated reader thread
//! - **BLE**: GATT notifications, consumed by a task on the session runtime
//!
//! A session moves through
//! `Idle -> Connecting -> Streaming -> (Reconfiguring -> Streaming)* -> Stopping -> Idle`.
//! Gain changes and stops are [`Command`]s handled strictly in order by the
//! session worker; a gain change quiesces the reader before the device sees
//! the new setting, so frames from the two configurations never interleave.
//!
//! Frames land in a drop-oldest [`BoundedQueue`] (latest wins) and, while
//! recording is enabled, in a batched [`RecordingBuffer`] exported on stop.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ps_protocol::Transport;
//! use ps_session::{SessionConfig, SessionEngine};
//!
//! let engine = SessionEngine::with_hardware(SessionConfig::default());
//! engine.start(Transport::Usb).unwrap();
//!
//! if let Some(frame) = engine.pop_frame(Duration::from_secs(1)) {
//!     println!("seq {} first sample {}", frame.seq, frame.samples[0]);
//! }
//! engine.set_gain(8).unwrap();
//! engine.stop().unwrap();
//! ```

pub mod ble;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod queue;
pub mod reader;
pub mod recording;
pub mod state;
pub mod usb;

pub use config::{BleSettings, QueueSettings, SessionConfig, TimingSettings, UsbSettings};
pub use device::{cleanup, DeviceConnector, FrameRead, FrameSource, SensorDevice};
pub use engine::{
    BleScanReport, Command, GainOutcome, HardwareConnector, SessionEngine, StartOutcome,
    StopOutcome,
};
pub use error::{ReadError, SessionError, SessionResult};
pub use queue::{BoundedQueue, QueueMetrics};
pub use reader::{ReaderActivity, ReaderSink, ReaderStats};
pub use recording::{RecordingBatch, RecordingBuffer, RecordingConfig};
pub use state::{Phase, SessionState, SessionStatus, StateSnapshot};
