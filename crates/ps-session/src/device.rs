//! Device capability set shared by the USB and BLE drivers
//!
//! The engine is written once against [`SensorDevice`]. The two drivers
//! differ in how frames arrive, which [`FrameSource`] makes explicit: USB
//! yields a blocking iterator that must run on its own thread, BLE yields a
//! stream driven by the session's task scheduler.

use async_trait::async_trait;
use futures::stream::BoxStream;
use ps_detect::BleDeviceSummary;
use ps_protocol::{Frame, Gain, Transport};
use tracing::{info, warn};

use crate::config::{BleSettings, SessionConfig, TimingSettings};
use crate::error::{ReadError, SessionResult};

/// One pull from a frame sequence
pub type FrameRead = Result<Frame, ReadError>;

/// Lazy, non-restartable sequence of decoded frames
pub enum FrameSource {
    /// Blocking reads; consumed on a dedicated thread
    Blocking(Box<dyn Iterator<Item = FrameRead> + Send>),
    /// Event-driven notifications; consumed by a task
    Async(BoxStream<'static, FrameRead>),
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSource::Blocking(_) => f.write_str("FrameSource::Blocking"),
            FrameSource::Async(_) => f.write_str("FrameSource::Async"),
        }
    }
}

/// A connected (or connectable) PS02 sensor
#[async_trait]
pub trait SensorDevice: Send {
    /// Transport this device speaks
    fn transport(&self) -> Transport;

    /// Human-readable identity, e.g. `USB /dev/ttyACM0`
    fn describe(&self) -> String;

    /// Open the transport
    async fn connect(&mut self) -> SessionResult<()>;

    /// Begin streaming frames
    async fn start(&mut self) -> SessionResult<()>;

    /// Stop streaming frames
    async fn stop(&mut self) -> SessionResult<()>;

    /// Write a new gain setting
    async fn set_gain(&mut self, gain: Gain) -> SessionResult<()>;

    /// Produce the frame sequence for the current connection
    fn frames(&mut self) -> SessionResult<FrameSource>;

    /// Release the transport
    async fn close(&mut self) -> SessionResult<()>;
}

/// Discovers and connects devices for the engine
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Run discovery for `transport` and return a connected device
    async fn open(
        &self,
        transport: Transport,
        config: &SessionConfig,
    ) -> SessionResult<Box<dyn SensorDevice>>;

    /// Unfiltered listing of nearby BLE devices
    async fn list_ble_devices(&self, settings: &BleSettings) -> SessionResult<Vec<BleDeviceSummary>>;
}

/// Tear a device down: stop, settle, close, settle
///
/// Every step runs even if an earlier one failed. The delays give the OS or
/// radio stack time to release the handle before the next connect.
pub async fn cleanup(device: &mut dyn SensorDevice, timing: &TimingSettings) {
    info!("Cleaning up {}", device.describe());

    if let Err(e) = device.stop().await {
        warn!("Stop during cleanup failed (continuing): {}", e);
    }
    tokio::time::sleep(timing.cleanup_settle()).await;

    if let Err(e) = device.close().await {
        warn!("Close during cleanup failed (continuing): {}", e);
    }
    tokio::time::sleep(timing.cleanup_settle()).await;
    tokio::time::sleep(timing.release_settle()).await;

    info!("Device cleanup complete");
}
