//! Virtual PS02 sensor
//!
//! A generator thread emits frames in the real wire format while the sensor
//! is streaming. Every sample of a frame carries the gain the sensor was
//! configured with when the frame was produced, so tests can tell frames
//! from different configurations apart.
//!
//! USB output goes through an in-memory byte pipe read by the real line
//! decoder; BLE output goes through a notification queue read by the real
//! notification decoder.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ps_protocol::{ble, usb, Frame, Gain, Transport, SAMPLES_PER_FRAME};
use ps_session::ble::notification_frames;
use ps_session::usb::UsbFrames;
use ps_session::{BoundedQueue, FrameSource, SensorDevice, SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Device call observed by a virtual sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Connect,
    Start,
    Stop,
    SetGain(Gain),
    Close,
}

/// Shared, ordered record of device calls
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SimEvent>>,
}

impl EventLog {
    pub fn record(&self, event: SimEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: SimEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Configuration for creating a virtual sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualSensorConfig {
    /// Display identifier (port name or address)
    pub id: String,
    /// Delay between generated frames
    pub frame_interval_ms: u64,
    /// Read timeout of the frame sequence
    pub read_timeout_ms: u64,
    /// Buffered wire units before the oldest is lost
    pub buffer_capacity: usize,
}

impl Default for VirtualSensorConfig {
    fn default() -> Self {
        Self {
            id: "virtual-ps02".to_string(),
            frame_interval_ms: 2,
            read_timeout_ms: 20,
            buffer_capacity: 256,
        }
    }
}

struct Generator {
    streaming: bool,
    gain: Gain,
    seq: u8,
}

/// State shared between the sensor and its generator thread
struct Link {
    generator: Mutex<Generator>,
    output: Arc<BoundedQueue<Vec<u8>>>,
    shutdown: AtomicBool,
}

impl Link {
    /// Emit one frame if streaming
    ///
    /// Encoding and pushing happen under the generator lock, so a frame can
    /// never straddle a stop/start boundary.
    fn tick(&self, transport: Transport) {
        let mut state = self.generator.lock();
        if !state.streaming {
            return;
        }
        let value = i16::from(state.gain.value());
        let frame = Frame::new(state.seq, [value; SAMPLES_PER_FRAME]);
        state.seq = state.seq.wrapping_add(1) & transport.sequence_mask();

        let wire = match transport {
            Transport::Usb => usb::encode_line(&frame),
            Transport::Ble => ble::encode_notification(&frame),
        };
        self.output.push(wire);
    }
}

/// Blocking byte reader over the USB pipe
///
/// An empty pipe reports `TimedOut` after the read timeout, like a serial
/// port; a closed and drained pipe reports end of file.
pub struct PipeReader {
    queue: Arc<BoundedQueue<Vec<u8>>>,
    pending: Vec<u8>,
    timeout: Duration,
}

impl PipeReader {
    pub fn new(queue: Arc<BoundedQueue<Vec<u8>>>, timeout: Duration) -> Self {
        Self {
            queue,
            pending: Vec::new(),
            timeout,
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.queue.pop_timeout(self.timeout) {
                Some(chunk) => self.pending = chunk,
                None if self.queue.is_closed() => return Ok(0),
                None => return Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// A simulated PS02 sensor on either transport
pub struct VirtualSensor {
    config: VirtualSensorConfig,
    transport: Transport,
    link: Arc<Link>,
    events: Arc<EventLog>,
    generator: Option<JoinHandle<()>>,
}

impl VirtualSensor {
    pub fn new(transport: Transport, config: VirtualSensorConfig, events: Arc<EventLog>) -> Self {
        let output = Arc::new(BoundedQueue::new(config.buffer_capacity));
        Self {
            transport,
            link: Arc::new(Link {
                generator: Mutex::new(Generator {
                    streaming: false,
                    gain: Gain::MAX,
                    seq: 0,
                }),
                output,
                shutdown: AtomicBool::new(false),
            }),
            config,
            events,
            generator: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn gain(&self) -> Gain {
        self.link.generator.lock().gain
    }

    pub fn is_streaming(&self) -> bool {
        self.link.generator.lock().streaming
    }

    pub fn is_connected(&self) -> bool {
        self.generator.is_some()
    }

    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    fn ensure_connected(&self) -> SessionResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::Connection(format!("{} is not connected", self.config.id)))
        }
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms)
    }

    fn halt(&mut self) {
        self.link.shutdown.store(true, Ordering::Release);
        self.link.generator.lock().streaming = false;
        self.link.output.close();
        if let Some(handle) = self.generator.take() {
            let _ = handle.join();
        }
    }
}

#[async_trait]
impl SensorDevice for VirtualSensor {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn describe(&self) -> String {
        format!("{} {}", self.transport, self.config.id)
    }

    async fn connect(&mut self) -> SessionResult<()> {
        self.events.record(SimEvent::Connect);
        if self.is_connected() {
            return Ok(());
        }
        self.link.shutdown.store(false, Ordering::Release);
        self.link.output.reopen();
        self.link.output.clear();

        let link = Arc::clone(&self.link);
        let transport = self.transport;
        let interval = Duration::from_millis(self.config.frame_interval_ms.max(1));
        let handle = std::thread::Builder::new()
            .name(format!("ps-sim-{}", self.config.id))
            .spawn(move || {
                while !link.shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    link.tick(transport);
                }
            })
            .map_err(|e| SessionError::Runtime(e.to_string()))?;
        self.generator = Some(handle);
        info!("Virtual sensor {} connected", self.describe());
        Ok(())
    }

    async fn start(&mut self) -> SessionResult<()> {
        self.events.record(SimEvent::Start);
        self.ensure_connected()?;
        let mut state = self.link.generator.lock();
        // Anything still buffered was produced before this start
        self.link.output.clear();
        state.streaming = true;
        Ok(())
    }

    async fn stop(&mut self) -> SessionResult<()> {
        self.events.record(SimEvent::Stop);
        self.ensure_connected()?;
        self.link.generator.lock().streaming = false;
        Ok(())
    }

    async fn set_gain(&mut self, gain: Gain) -> SessionResult<()> {
        self.events.record(SimEvent::SetGain(gain));
        self.ensure_connected()?;
        debug!("Virtual sensor {} gain {}", self.config.id, gain);
        self.link.generator.lock().gain = gain;
        Ok(())
    }

    fn frames(&mut self) -> SessionResult<FrameSource> {
        self.ensure_connected()?;
        let output = Arc::clone(&self.link.output);
        Ok(match self.transport {
            Transport::Usb => FrameSource::Blocking(Box::new(UsbFrames::new(PipeReader::new(
                output,
                self.read_timeout(),
            )))),
            Transport::Ble => FrameSource::Async(notification_frames(output, self.read_timeout())),
        })
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.events.record(SimEvent::Close);
        self.halt();
        info!("Virtual sensor {} closed", self.config.id);
        Ok(())
    }
}

impl Drop for VirtualSensor {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(transport: Transport) -> VirtualSensor {
        VirtualSensor::new(transport, VirtualSensorConfig::default(), Arc::default())
    }

    #[test]
    fn test_tick_only_while_streaming() {
        let sim = sensor(Transport::Usb);
        sim.link.tick(Transport::Usb);
        assert!(sim.link.output.is_empty());

        sim.link.generator.lock().streaming = true;
        sim.link.tick(Transport::Usb);
        let line = sim.link.output.pop().unwrap();
        let frame = usb::parse_line(&line).into_frame().unwrap();
        assert_eq!(frame.seq, 0);
        assert!(frame.samples.iter().all(|&s| s == 15));
    }

    #[test]
    fn test_ble_sequence_wraps_at_nibble() {
        let sim = sensor(Transport::Ble);
        sim.link.generator.lock().streaming = true;
        for _ in 0..17 {
            sim.link.tick(Transport::Ble);
        }
        let seqs: Vec<u8> = std::iter::from_fn(|| sim.link.output.pop())
            .filter_map(|p| ble::parse_notification(&p).into_frame())
            .map(|f| f.seq)
            .collect();
        assert_eq!(seqs.len(), 17);
        assert_eq!(seqs[15], 15);
        assert_eq!(seqs[16], 0);
    }

    #[test]
    fn test_pipe_reader_timeout_and_eof() {
        let queue = Arc::new(BoundedQueue::new(4));
        let mut reader = PipeReader::new(Arc::clone(&queue), Duration::from_millis(5));
        let mut buf = [0u8; 4];

        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        queue.push(b"abcdef".to_vec());
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);

        queue.close();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let mut sim = sensor(Transport::Usb);
        assert!(sim.start().await.is_err());
        assert!(sim.frames().is_err());

        sim.connect().await.unwrap();
        sim.set_gain(Gain::new(2).unwrap()).await.unwrap();
        sim.start().await.unwrap();
        assert!(sim.is_streaming());
        assert_eq!(sim.gain().value(), 2);

        sim.close().await.unwrap();
        assert!(!sim.is_connected());
        assert_eq!(
            sim.events().events(),
            vec![
                SimEvent::Start,
                SimEvent::Connect,
                SimEvent::SetGain(Gain::new(2).unwrap()),
                SimEvent::Start,
                SimEvent::Close,
            ]
        );
    }
}
