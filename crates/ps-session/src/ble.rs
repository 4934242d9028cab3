//! BLE (Nordic UART) driver
//!
//! Notifications arrive on a btleplug stream. A forwarding task copies each
//! RX value into a bounded raw queue that drops the oldest packet when full,
//! so the radio side never waits on the consumer. The frame sequence pulls
//! from that queue and decodes on the way out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::{self, BoxStream, StreamExt};
use ps_detect::{select_candidate, BleScanner};
use ps_protocol::ble::{
    parse_notification, BleCommand, UART_RX_CHAR_UUID, UART_SERVICE_UUID, UART_TX_CHAR_UUID,
};
use ps_protocol::{Decoded, DeviceCommand, EncodeCommand, Gain, Transport};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::BleSettings;
use crate::device::{FrameRead, FrameSource, SensorDevice};
use crate::error::{ReadError, SessionError, SessionResult};
use crate::queue::BoundedQueue;

/// Decode frames out of a raw notification queue
///
/// Yields [`ReadError::Timeout`] when nothing arrives within `read_timeout`
/// and ends once the queue is closed and drained.
pub fn notification_frames(
    queue: Arc<BoundedQueue<Vec<u8>>>,
    read_timeout: Duration,
) -> BoxStream<'static, FrameRead> {
    stream::unfold(queue, move |queue| async move {
        loop {
            match queue.pop_timeout_async(read_timeout).await {
                Some(packet) => match parse_notification(&packet) {
                    Decoded::Frame(frame) => return Some((Ok(frame), queue)),
                    Decoded::Skip => continue,
                    Decoded::Fatal(e) => return Some((Err(ReadError::Protocol(e)), queue)),
                },
                None if queue.is_closed() => return None,
                None => return Some((Err(ReadError::Timeout), queue)),
            }
        }
    })
    .boxed()
}

/// PS02 sensor reached over BLE
pub struct BleSensor {
    peripheral: Peripheral,
    settings: BleSettings,
    address: String,
    rx: Option<Characteristic>,
    tx: Option<Characteristic>,
    raw: Arc<BoundedQueue<Vec<u8>>>,
    notify_task: Option<JoinHandle<()>>,
}

impl BleSensor {
    pub fn new(peripheral: Peripheral, settings: BleSettings) -> Self {
        let address = peripheral.address().to_string().to_uppercase();
        let raw = Arc::new(BoundedQueue::new(settings.notification_capacity));
        Self {
            peripheral,
            settings,
            address,
            rx: None,
            tx: None,
            raw,
            notify_task: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Service UUIDs discovered on the connected device
    pub fn services(&self) -> Vec<Uuid> {
        self.peripheral.services().iter().map(|s| s.uuid).collect()
    }

    pub fn has_uart_service(&self) -> bool {
        self.services().contains(&UART_SERVICE_UUID)
    }

    /// Raw notifications dropped because the consumer fell behind
    pub fn dropped_notifications(&self) -> u64 {
        self.raw.metrics().total_dropped
    }

    fn characteristic(&self, uuid: Uuid) -> SessionResult<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                SessionError::Connection(format!("{} has no characteristic {}", self.address, uuid))
            })
    }

    async fn send(&self, cmd: DeviceCommand) -> SessionResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SessionError::Connection(format!("{} is not connected", self.address)))?;
        let bytes = BleCommand::from(cmd).encode();
        debug!("BLE -> {:02X?}", bytes);
        self.peripheral
            .write(tx, &bytes, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn open_link(&mut self) -> SessionResult<()> {
        info!("Connecting to {}", self.address);
        match tokio::time::timeout(self.settings.connect_timeout(), self.peripheral.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SessionError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.address,
                    self.settings.connect_timeout()
                )))
            }
        }
        if !self.peripheral.is_connected().await? {
            return Err(SessionError::Connection(format!(
                "{} dropped the connection",
                self.address
            )));
        }

        self.peripheral.discover_services().await?;
        let rx = self.characteristic(UART_RX_CHAR_UUID)?;
        let tx = self.characteristic(UART_TX_CHAR_UUID)?;

        let mut notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&rx).await?;

        self.raw.reopen();
        self.raw.clear();
        let raw = Arc::clone(&self.raw);
        self.notify_task = Some(tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                if n.uuid != UART_RX_CHAR_UUID {
                    continue;
                }
                if raw.push(n.value).is_some() {
                    trace!("Raw notification queue full, dropped oldest");
                }
            }
            debug!("Notification stream ended");
        }));

        self.rx = Some(rx);
        self.tx = Some(tx);
        tokio::time::sleep(self.settings.subscribe_settle()).await;
        info!("Connected to {} and subscribed", self.address);
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(rx) = self.rx.take() {
            if let Err(e) = self.peripheral.unsubscribe(&rx).await {
                debug!("Unsubscribe from {} failed: {}", self.address, e);
            }
        }
        self.tx = None;
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.raw.close();
        if let Err(e) = self.peripheral.disconnect().await {
            debug!("Disconnect from {} failed: {}", self.address, e);
        }
    }
}

#[async_trait]
impl SensorDevice for BleSensor {
    fn transport(&self) -> Transport {
        Transport::Ble
    }

    fn describe(&self) -> String {
        format!("BLE {}", self.address)
    }

    async fn connect(&mut self) -> SessionResult<()> {
        if let Err(e) = self.open_link().await {
            self.release().await;
            return Err(e);
        }
        Ok(())
    }

    /// Send start until the first notification shows up
    ///
    /// Packets queued before an attempt are stale and are discarded first.
    async fn start(&mut self) -> SessionResult<()> {
        let attempts = self.settings.start_retries.max(1);
        for attempt in 1..=attempts {
            self.raw.clear();
            self.send(DeviceCommand::Start).await?;
            if self
                .raw
                .wait_nonempty(self.settings.first_packet_timeout())
                .await
            {
                info!("{} streaming after {} attempt(s)", self.address, attempt);
                return Ok(());
            }
            warn!(
                "No data from {} after start (attempt {}/{})",
                self.address, attempt, attempts
            );
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_backoff()).await;
            }
        }
        Err(SessionError::Connection(format!(
            "{} did not stream after {} start attempts",
            self.address, attempts
        )))
    }

    async fn stop(&mut self) -> SessionResult<()> {
        self.send(DeviceCommand::Stop).await
    }

    async fn set_gain(&mut self, gain: Gain) -> SessionResult<()> {
        self.send(DeviceCommand::SetGain(gain)).await
    }

    fn frames(&mut self) -> SessionResult<FrameSource> {
        if self.rx.is_none() {
            return Err(SessionError::Connection(format!(
                "{} is not connected",
                self.address
            )));
        }
        Ok(FrameSource::Async(notification_frames(
            Arc::clone(&self.raw),
            self.settings.read_timeout(),
        )))
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.release().await;
        info!("Closed {}", self.address);
        Ok(())
    }
}

/// Scan, pick a sensor and connect to it
///
/// The chosen device must actually expose the UART service once connected;
/// an advertisement alone is not trusted.
pub async fn auto_connect(settings: &BleSettings) -> SessionResult<BleSensor> {
    let scanner = BleScanner::new().await?;
    let candidates = scanner
        .find_sensors(
            &settings.name_prefix,
            &UART_SERVICE_UUID,
            settings.scan_duration(),
        )
        .await?;
    let (peripheral, adv) = select_candidate(candidates, settings.prefer_address.as_deref())?;
    info!(
        "Selected {} ({}) rssi {:?}",
        adv.address,
        adv.local_name.as_deref().unwrap_or("Unknown"),
        adv.rssi
    );

    let mut sensor = BleSensor::new(peripheral, settings.clone());
    sensor.connect().await?;
    if !sensor.has_uart_service() {
        sensor.release().await;
        return Err(SessionError::Connection(format!(
            "{} does not expose the UART service",
            sensor.address
        )));
    }
    Ok(sensor)
}
