//! Session state tracking
//!
//! One [`SessionState`] exists per engine, behind the engine's state lock.
//! Fields are private; callers move the session through its lifecycle with
//! the transition methods:
//!
//! ```text
//! Idle -> Connecting -> Streaming -> (Reconfiguring -> Streaming)* -> Stopping -> Idle
//! ```
//!
//! `Connecting` may also fall straight back to `Idle`.

use std::path::PathBuf;
use std::sync::mpsc;

use ps_protocol::{Gain, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Connecting,
    Streaming,
    Reconfiguring,
    Stopping,
}

impl Phase {
    /// Whether a session exists in this phase
    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Streaming => "streaming",
            Phase::Reconfiguring => "reconfiguring",
            Phase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// What a finished session hands back to whoever asked it to stop
pub type StopReport = Result<Option<PathBuf>, String>;

/// Copy of the state fields, taken under the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub transport: Option<Transport>,
    pub gain: Gain,
    pub device: Option<String>,
    pub session_id: u64,
}

/// The process-wide acquisition state
#[derive(Debug)]
pub struct SessionState {
    phase: Phase,
    transport: Option<Transport>,
    gain: Gain,
    device: Option<String>,
    session_id: u64,
    stop_waiters: Vec<mpsc::Sender<StopReport>>,
}

impl SessionState {
    pub fn new(gain: Gain) -> Self {
        Self {
            phase: Phase::Idle,
            transport: None,
            gain,
            device: None,
            session_id: 0,
            stop_waiters: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transport(&self) -> Option<Transport> {
        self.transport
    }

    pub fn gain(&self) -> Gain {
        self.gain
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase,
            transport: self.transport,
            gain: self.gain,
            device: self.device.clone(),
            session_id: self.session_id,
        }
    }

    fn transition(&mut self, from: &[Phase], to: Phase) -> bool {
        if from.contains(&self.phase) {
            debug!("Session phase {} -> {}", self.phase, to);
            self.phase = to;
            true
        } else {
            warn!("Ignoring transition {} -> {}", self.phase, to);
            false
        }
    }

    /// Idle -> Connecting; returns the new session id
    pub fn begin_connect(&mut self, transport: Transport) -> Option<u64> {
        if !self.transition(&[Phase::Idle], Phase::Connecting) {
            return None;
        }
        self.transport = Some(transport);
        self.session_id += 1;
        Some(self.session_id)
    }

    /// Connecting -> Streaming, recording which device is in use
    pub fn connected(&mut self, device: String) -> bool {
        if self.transition(&[Phase::Connecting], Phase::Streaming) {
            self.device = Some(device);
            true
        } else {
            false
        }
    }

    /// Streaming -> Reconfiguring
    pub fn begin_reconfigure(&mut self) -> bool {
        self.transition(&[Phase::Streaming], Phase::Reconfiguring)
    }

    /// Reconfiguring -> Streaming
    pub fn finish_reconfigure(&mut self) -> bool {
        self.transition(&[Phase::Reconfiguring], Phase::Streaming)
    }

    /// Any active phase -> Stopping
    pub fn begin_stop(&mut self) -> bool {
        self.transition(
            &[Phase::Connecting, Phase::Streaming, Phase::Reconfiguring],
            Phase::Stopping,
        )
    }

    /// Back to Idle from anywhere; returns everyone waiting on the stop
    pub fn finish(&mut self) -> Vec<mpsc::Sender<StopReport>> {
        if self.phase != Phase::Idle {
            debug!("Session phase {} -> idle", self.phase);
        }
        self.phase = Phase::Idle;
        self.transport = None;
        self.device = None;
        std::mem::take(&mut self.stop_waiters)
    }

    /// Record the gain the device is now configured with
    pub fn set_gain(&mut self, gain: Gain) {
        self.gain = gain;
    }

    /// Register interest in the end of the current session
    pub fn add_stop_waiter(&mut self) -> mpsc::Receiver<StopReport> {
        let (tx, rx) = mpsc::channel();
        self.stop_waiters.push(tx);
        rx
    }
}

/// Status payload for external queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub running: bool,
    pub phase: Phase,
    pub transport: Option<Transport>,
    pub gain: u8,
    pub device: Option<String>,
    /// Frames waiting in the distribution queue
    pub frame_queue: usize,
    pub reader_alive: bool,
    pub frames_read: u64,
    pub protocol_errors: u64,
    /// Frames evicted from the distribution queue
    pub frames_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut state = SessionState::new(Gain::MAX);
        assert_eq!(state.begin_connect(Transport::Usb), Some(1));
        assert_eq!(state.phase(), Phase::Connecting);
        assert!(state.connected("USB /dev/ttyACM0".into()));
        assert!(state.begin_reconfigure());
        state.set_gain(Gain::new(3).unwrap());
        assert!(state.finish_reconfigure());
        assert!(state.begin_stop());
        state.finish();

        let snap = state.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(snap.transport, None);
        assert_eq!(snap.device, None);
        assert_eq!(snap.gain.value(), 3);
    }

    #[test]
    fn test_second_connect_refused() {
        let mut state = SessionState::new(Gain::MAX);
        state.begin_connect(Transport::Ble);
        assert_eq!(state.begin_connect(Transport::Usb), None);
        assert_eq!(state.transport(), Some(Transport::Ble));
    }

    #[test]
    fn test_invalid_transitions_ignored() {
        let mut state = SessionState::new(Gain::MAX);
        assert!(!state.begin_reconfigure());
        assert!(!state.connected("x".into()));
        assert!(!state.begin_stop());
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let mut state = SessionState::new(Gain::MAX);
        state.begin_connect(Transport::Usb);
        state.finish();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.begin_connect(Transport::Usb), Some(2));
    }

    #[test]
    fn test_stop_waiters_drained_on_finish() {
        let mut state = SessionState::new(Gain::MAX);
        state.begin_connect(Transport::Usb);
        let rx = state.add_stop_waiter();

        for waiter in state.finish() {
            waiter.send(Ok(None)).unwrap();
        }
        assert_eq!(rx.recv().unwrap(), Ok(None));
        assert!(state.finish().is_empty());
    }
}
