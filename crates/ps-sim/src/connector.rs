//! Device connector backed by virtual sensors

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ps_detect::BleDeviceSummary;
use ps_protocol::{Gain, Transport};
use ps_session::{
    BleSettings, DeviceConnector, FrameRead, FrameSource, SensorDevice, SessionConfig,
    SessionError, SessionResult,
};
use tracing::info;

use crate::sensor::{EventLog, SimEvent, VirtualSensor, VirtualSensorConfig};

/// Failure to inject into the next open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Discovery finds no sensor
    NotFound,
    /// The sensor is found but refuses the connection
    ConnectRefused,
    /// The sensor connects but `start` fails
    StartFails,
    /// Every gain write takes this long
    SlowGain(Duration),
    /// The frame source blocks without yielding until the sensor is closed
    WedgedReader,
    /// Closing the sensor takes this long
    SlowClose(Duration),
}

/// Blocking frame source that yields nothing until its sender is dropped
struct Wedged {
    release: mpsc::Receiver<()>,
}

impl Iterator for Wedged {
    type Item = FrameRead;

    fn next(&mut self) -> Option<FrameRead> {
        // Returns once the owning sensor drops the sender
        let _ = self.release.recv();
        None
    }
}

/// Working sensor with one injected misbehaviour
struct Faulty {
    inner: VirtualSensor,
    fault: Fault,
    wedge: Option<mpsc::Sender<()>>,
}

impl Faulty {
    fn new(inner: VirtualSensor, fault: Fault) -> Self {
        Self {
            inner,
            fault,
            wedge: None,
        }
    }
}

#[async_trait]
impl SensorDevice for Faulty {
    fn transport(&self) -> Transport {
        self.inner.transport()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn connect(&mut self) -> SessionResult<()> {
        self.inner.connect().await
    }

    async fn start(&mut self) -> SessionResult<()> {
        if self.fault != Fault::StartFails {
            return self.inner.start().await;
        }
        self.inner.events().record(SimEvent::Start);
        Err(SessionError::Connection(format!(
            "{} did not stream after start",
            self.inner.id()
        )))
    }

    async fn stop(&mut self) -> SessionResult<()> {
        self.inner.stop().await
    }

    async fn set_gain(&mut self, gain: Gain) -> SessionResult<()> {
        if let Fault::SlowGain(delay) = self.fault {
            tokio::time::sleep(delay).await;
        }
        self.inner.set_gain(gain).await
    }

    fn frames(&mut self) -> SessionResult<FrameSource> {
        if self.fault != Fault::WedgedReader {
            return self.inner.frames();
        }
        let (tx, rx) = mpsc::channel();
        self.wedge = Some(tx);
        Ok(FrameSource::Blocking(Box::new(Wedged { release: rx })))
    }

    async fn close(&mut self) -> SessionResult<()> {
        if let Fault::SlowClose(delay) = self.fault {
            tokio::time::sleep(delay).await;
        }
        self.wedge = None;
        self.inner.close().await
    }
}

/// Hands out connected [`VirtualSensor`]s to the session engine
pub struct SimConnector {
    sensor: VirtualSensorConfig,
    events: Arc<EventLog>,
    faults: Mutex<VecDeque<Fault>>,
    open_delay: Mutex<Duration>,
    opens: AtomicUsize,
    nearby: Mutex<Vec<BleDeviceSummary>>,
}

impl SimConnector {
    pub fn new(sensor: VirtualSensorConfig) -> Self {
        Self {
            sensor,
            events: Arc::default(),
            faults: Mutex::new(VecDeque::new()),
            open_delay: Mutex::new(Duration::ZERO),
            opens: AtomicUsize::new(0),
            nearby: Mutex::new(Vec::new()),
        }
    }

    /// Device calls made on every sensor this connector opened
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    /// Fail the next open with `fault`; queued faults apply in order
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Make every open take `delay` before it succeeds or fails
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Opens attempted, including failed ones
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Devices reported by BLE listing
    pub fn set_nearby(&self, devices: Vec<BleDeviceSummary>) {
        *self.nearby.lock() = devices;
    }
}

impl Default for SimConnector {
    fn default() -> Self {
        Self::new(VirtualSensorConfig::default())
    }
}

#[async_trait]
impl DeviceConnector for SimConnector {
    async fn open(
        &self,
        transport: Transport,
        _config: &SessionConfig,
    ) -> SessionResult<Box<dyn SensorDevice>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let fault = self.faults.lock().pop_front();
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if fault == Some(Fault::NotFound) {
            return Err(SessionError::DeviceNotFound(format!(
                "no virtual {} sensor",
                transport
            )));
        }

        let mut sensor = VirtualSensor::new(transport, self.sensor.clone(), self.events());
        if fault == Some(Fault::ConnectRefused) {
            self.events.record(SimEvent::Connect);
            return Err(SessionError::Connection(format!(
                "{} refused the connection",
                sensor.id()
            )));
        }
        sensor.connect().await?;
        info!("Opened {}", sensor.describe());

        match fault {
            Some(fault) => Ok(Box::new(Faulty::new(sensor, fault))),
            None => Ok(Box::new(sensor)),
        }
    }

    async fn list_ble_devices(&self, _settings: &BleSettings) -> SessionResult<Vec<BleDeviceSummary>> {
        Ok(self.nearby.lock().clone())
    }
}
