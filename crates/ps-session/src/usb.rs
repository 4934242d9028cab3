//! USB serial driver
//!
//! The serial port is read with a blocking call bounded by the configured
//! read timeout, so the frame sequence is an [`Iterator`] meant to run on its
//! own thread. A timed-out read yields [`ReadError::Timeout`], which gives
//! the reader a chance to observe its stop signal.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ps_detect::{select_port, PortScanner};
use ps_protocol::usb::{UsbCommand, UsbLineCodec};
use ps_protocol::{Decoded, DeviceCommand, EncodeCommand, Frame, Gain, Transport};
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use crate::config::UsbSettings;
use crate::device::{FrameRead, FrameSource, SensorDevice};
use crate::error::{ReadError, SessionError, SessionResult};

/// Frame sequence over any byte reader
///
/// Ends when the reader reports end of file or a non-timeout I/O error has
/// been returned once.
pub struct UsbFrames<R> {
    reader: R,
    codec: UsbLineCodec,
    buf: [u8; 256],
    done: bool,
}

impl<R: Read> UsbFrames<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            codec: UsbLineCodec::new(),
            buf: [0u8; 256],
            done: false,
        }
    }
}

impl<R: Read> Iterator for UsbFrames<R> {
    type Item = FrameRead;

    fn next(&mut self) -> Option<FrameRead> {
        if self.done {
            return None;
        }
        loop {
            while let Some(decoded) = self.codec.next_decoded() {
                match decoded {
                    Decoded::Frame(frame) => return Some(Ok(frame)),
                    Decoded::Skip => {}
                    Decoded::Fatal(e) => return Some(Err(ReadError::Protocol(e))),
                }
            }

            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => self.codec.push_bytes(&self.buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    let err = ReadError::from(e);
                    if !err.is_recoverable() {
                        self.done = true;
                    }
                    return Some(Err(err));
                }
            }
        }
    }
}

/// PS02 sensor on a USB CDC serial port
pub struct UsbSensor {
    port_name: String,
    settings: UsbSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl UsbSensor {
    pub fn new(port_name: impl Into<String>, settings: UsbSettings) -> Self {
        Self {
            port_name: port_name.into(),
            settings,
            port: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn port_mut(&mut self) -> SessionResult<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| SessionError::Connection(format!("{} is not open", self.port_name)))
    }

    /// Open the port, assert DTR/RTS and flush both directions
    pub fn open(&mut self) -> SessionResult<()> {
        info!(
            "Opening {} at {} baud",
            self.port_name, self.settings.baud_rate
        );
        let mut port = serialport::new(&self.port_name, self.settings.baud_rate)
            .timeout(self.settings.read_timeout())
            .open()?;

        if self.settings.assert_dtr_rts {
            port.write_data_terminal_ready(true)?;
            port.write_request_to_send(true)?;
        }
        port.clear(ClearBuffer::All)?;

        self.port = Some(port);
        Ok(())
    }

    fn send(&mut self, cmd: DeviceCommand) -> SessionResult<()> {
        let bytes = UsbCommand::from(cmd).encode();
        debug!("USB -> {:?}", String::from_utf8_lossy(&bytes).trim_end());
        let port = self.port_mut()?;
        port.write_all(&bytes)
            .and_then(|_| port.flush())
            .map_err(|e| SessionError::Connection(e.to_string()))
    }

    /// Release the port, deasserting DTR/RTS first
    pub fn shutdown(&mut self) {
        let Some(mut port) = self.port.take() else {
            return;
        };
        if self.settings.assert_dtr_rts {
            if let Err(e) = port
                .write_data_terminal_ready(false)
                .and_then(|_| port.write_request_to_send(false))
            {
                debug!("Failed to deassert DTR/RTS on {}: {}", self.port_name, e);
            }
        }
        info!("Closed {}", self.port_name);
    }

    /// Read exactly `n` frames, failing if `timeout` elapses first
    pub fn read_frames(&mut self, n: usize, timeout: Duration) -> SessionResult<Vec<Frame>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let reader = self.port_mut()?.try_clone()?;
        let started = Instant::now();
        let mut out = Vec::with_capacity(n);

        for read in UsbFrames::new(reader) {
            match read {
                Ok(frame) => {
                    out.push(frame);
                    if out.len() >= n {
                        return Ok(out);
                    }
                }
                Err(ReadError::Io(e)) => return Err(SessionError::Connection(e)),
                Err(e) => debug!("Skipping read: {}", e),
            }
            if started.elapsed() > timeout {
                return Err(SessionError::Timeout(format!(
                    "got {} of {} frames within {:?}",
                    out.len(),
                    n,
                    timeout
                )));
            }
        }
        Err(SessionError::Connection(format!("{} closed", self.port_name)))
    }
}

#[async_trait]
impl SensorDevice for UsbSensor {
    fn transport(&self) -> Transport {
        Transport::Usb
    }

    fn describe(&self) -> String {
        format!("USB {}", self.port_name)
    }

    async fn connect(&mut self) -> SessionResult<()> {
        self.open()
    }

    async fn start(&mut self) -> SessionResult<()> {
        // Lines still buffered from before a stop carry the old configuration
        self.port_mut()?.clear(ClearBuffer::Input)?;
        self.send(DeviceCommand::Start)
    }

    async fn stop(&mut self) -> SessionResult<()> {
        self.send(DeviceCommand::Stop)
    }

    async fn set_gain(&mut self, gain: Gain) -> SessionResult<()> {
        self.send(DeviceCommand::SetGain(gain))
    }

    fn frames(&mut self) -> SessionResult<FrameSource> {
        let reader = self.port_mut()?.try_clone()?;
        Ok(FrameSource::Blocking(Box::new(UsbFrames::new(reader))))
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for UsbSensor {
    fn drop(&mut self) {
        if self.port.is_some() {
            warn!("{} dropped while open", self.port_name);
            self.shutdown();
        }
    }
}

/// Find a sensor by VID:PID (and optional serial number) and open it
pub fn auto_connect(settings: &UsbSettings) -> SessionResult<UsbSensor> {
    let ports = PortScanner::new().find_ports(&settings.vidpid)?;
    let port = select_port(&ports, settings.prefer_serial.as_deref())?;
    let mut sensor = UsbSensor::new(port, settings.clone());
    sensor.open()?;
    Ok(sensor)
}
