//! Session configuration
//!
//! Every tunable the engine and drivers use lives here. Durations are stored
//! as milliseconds so the settings file stays readable.

use std::time::Duration;

use ps_detect::{VidPid, DEFAULT_NAME_PREFIX, DEFAULT_VIDPID};
use ps_protocol::{Gain, Transport};
use serde::{Deserialize, Serialize};

/// USB serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    /// Vendor/product identifier to match
    pub vidpid: VidPid,
    /// Preferred serial number when several sensors are attached
    pub prefer_serial: Option<String>,
    pub baud_rate: u32,
    /// Per-read timeout; also bounds how long a reader takes to notice a stop
    pub read_timeout_ms: u64,
    /// Assert DTR/RTS on connect and deassert them on close
    pub assert_dtr_rts: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vidpid: DEFAULT_VIDPID,
            prefer_serial: None,
            baud_rate: 115_200,
            read_timeout_ms: 1_000,
            assert_dtr_rts: true,
        }
    }
}

impl UsbSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// BLE link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    /// Advertised name prefix to accept
    pub name_prefix: String,
    /// Connect only to this address when set
    pub prefer_address: Option<String>,
    pub scan_ms: u64,
    pub connect_timeout_ms: u64,
    /// Wait for one notification before reporting a read timeout
    pub read_timeout_ms: u64,
    /// Start attempts before giving up
    pub start_retries: u32,
    /// How long each start attempt waits for the first notification
    pub first_packet_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    /// Delay after subscribing so the CCCD write lands
    pub subscribe_settle_ms: u64,
    /// Capacity of the raw notification queue
    pub notification_capacity: usize,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            prefer_address: None,
            scan_ms: 10_000,
            connect_timeout_ms: 30_000,
            read_timeout_ms: 1_000,
            start_retries: 3,
            first_packet_timeout_ms: 2_000,
            retry_backoff_ms: 300,
            subscribe_settle_ms: 200,
            notification_capacity: 300,
        }
    }
}

impl BleSettings {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn first_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.first_packet_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn subscribe_settle(&self) -> Duration {
        Duration::from_millis(self.subscribe_settle_ms)
    }
}

/// Queue capacities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Frame queue depth for USB sessions
    pub usb_frames: usize,
    /// Frame queue depth for BLE sessions (higher native throughput)
    pub ble_frames: usize,
    /// Pending configuration commands
    pub commands: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            usb_frames: 20,
            ble_frames: 100,
            commands: 10,
        }
    }
}

impl QueueSettings {
    /// Frame queue depth for a transport
    pub fn frames_for(&self, transport: Transport) -> usize {
        match transport {
            Transport::Usb => self.usb_frames,
            Transport::Ble => self.ble_frames,
        }
    }
}

/// Lifecycle timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Bound on waiting for a reader to exit
    pub reader_join_ms: u64,
    /// Delay around the gain write during reconfiguration
    pub reconfigure_settle_ms: u64,
    /// Delay after stop and after close during cleanup
    pub cleanup_settle_ms: u64,
    /// Final delay after cleanup so the OS releases the handle
    pub release_settle_ms: u64,
    /// Bound on waiting for a stop to complete
    pub stop_wait_ms: u64,
    /// Command loop poll interval
    pub command_poll_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            reader_join_ms: 2_000,
            reconfigure_settle_ms: 150,
            cleanup_settle_ms: 300,
            release_settle_ms: 200,
            stop_wait_ms: 5_000,
            command_poll_ms: 100,
        }
    }
}

impl TimingSettings {
    pub fn reader_join(&self) -> Duration {
        Duration::from_millis(self.reader_join_ms)
    }

    pub fn reconfigure_settle(&self) -> Duration {
        Duration::from_millis(self.reconfigure_settle_ms)
    }

    pub fn cleanup_settle(&self) -> Duration {
        Duration::from_millis(self.cleanup_settle_ms)
    }

    pub fn release_settle(&self) -> Duration {
        Duration::from_millis(self.release_settle_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    pub fn command_poll(&self) -> Duration {
        Duration::from_millis(self.command_poll_ms)
    }

    /// All delays shrunk to a few milliseconds, for simulated devices
    pub fn fast() -> Self {
        Self {
            reader_join_ms: 1_000,
            reconfigure_settle_ms: 5,
            cleanup_settle_ms: 5,
            release_settle_ms: 5,
            stop_wait_ms: 5_000,
            command_poll_ms: 10,
        }
    }
}

/// Complete session engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub usb: UsbSettings,
    pub ble: BleSettings,
    pub queues: QueueSettings,
    pub timing: TimingSettings,
    /// Samples accumulated per reader before flushing to the recording buffer
    pub recording_batch: usize,
    /// Gain pushed to the device on connect
    pub initial_gain: Gain,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            usb: UsbSettings::default(),
            ble: BleSettings::default(),
            queues: QueueSettings::default(),
            timing: TimingSettings::default(),
            recording_batch: 1_000,
            initial_gain: Gain::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.usb.vidpid.to_string(), "1915:521A");
        assert_eq!(config.usb.baud_rate, 115_200);
        assert_eq!(config.ble.name_prefix, "PS02-LF");
        assert_eq!(config.queues.frames_for(Transport::Usb), 20);
        assert_eq!(config.queues.frames_for(Transport::Ble), 100);
        assert_eq!(config.initial_gain.value(), 15);
        assert_eq!(config.timing.reader_join(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"initial_gain": 7, "usb": {"vidpid": "1234:abcd"}}"#).unwrap();
        assert_eq!(config.initial_gain.value(), 7);
        assert_eq!(config.usb.vidpid.to_string(), "1234:ABCD");
        assert_eq!(config.usb.baud_rate, 115_200);
        assert_eq!(config.ble, BleSettings::default());
    }

    #[test]
    fn test_out_of_range_gain_rejected() {
        let result: Result<SessionConfig, _> = serde_json::from_str(r#"{"initial_gain": 16}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_json() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
