//! Frame reader activity
//!
//! A reader pulls frames from a [`FrameSource`] and hands each one to the
//! distribution queue and the recording batch. Blocking sources get a
//! dedicated thread, async sources a task on the session runtime. Stopping is
//! cooperative: the token is cancelled and the engine waits a bounded time
//! for the reader to notice.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ps_protocol::{Frame, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{FrameRead, FrameSource};
use crate::error::{ReadError, SessionError, SessionResult};
use crate::queue::BoundedQueue;
use crate::recording::{RecordingBatch, RecordingBuffer};

/// Counters shared by every reader of an engine
#[derive(Debug, Default)]
pub struct ReaderStats {
    frames_read: AtomicU64,
    protocol_errors: AtomicU64,
    launched: AtomicU64,
    running: AtomicUsize,
}

impl ReaderStats {
    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Readers launched since the last reset
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::Relaxed)
    }

    /// Whether any reader is currently running
    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }

    /// Zero the counters (running readers are still tracked)
    pub fn reset(&self) {
        self.frames_read.store(0, Ordering::Relaxed);
        self.protocol_errors.store(0, Ordering::Relaxed);
        self.launched.store(0, Ordering::Relaxed);
    }
}

/// Where a reader delivers frames
#[derive(Clone)]
pub struct ReaderSink {
    pub frames: Arc<BoundedQueue<Frame>>,
    pub recording: Arc<RecordingBuffer>,
    pub batch_size: usize,
    pub stats: Arc<ReaderStats>,
}

struct FrameHandler {
    frames: Arc<BoundedQueue<Frame>>,
    batch: RecordingBatch,
    stats: Arc<ReaderStats>,
    transport: Transport,
    count: u64,
}

impl FrameHandler {
    fn new(sink: ReaderSink, transport: Transport) -> Self {
        Self {
            batch: RecordingBatch::new(sink.recording, sink.batch_size),
            frames: sink.frames,
            stats: sink.stats,
            transport,
            count: 0,
        }
    }

    fn handle(&mut self, read: FrameRead) -> ControlFlow<()> {
        match read {
            Ok(frame) => {
                self.count += 1;
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                if self.count % 100 == 0 {
                    debug!("Read {} {} frames", self.count, self.transport);
                }
                self.batch.push(&frame.samples);
                self.frames.push(frame);
                ControlFlow::Continue(())
            }
            Err(ReadError::Timeout) => ControlFlow::Continue(()),
            Err(ReadError::Protocol(e)) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed {} frame: {}", self.transport, e);
                ControlFlow::Continue(())
            }
            Err(ReadError::Io(e)) => {
                warn!("{} transport ended: {}", self.transport, e);
                ControlFlow::Break(())
            }
        }
    }
}

impl Drop for FrameHandler {
    fn drop(&mut self) {
        self.batch.flush();
        self.stats.running.fetch_sub(1, Ordering::AcqRel);
        info!(
            "{} frame reader stopped after {} frames",
            self.transport, self.count
        );
    }
}

fn run_blocking(
    frames: Box<dyn Iterator<Item = FrameRead> + Send>,
    mut handler: FrameHandler,
    cancel: CancellationToken,
) {
    info!("{} frame reader started", handler.transport);
    for read in frames {
        // A frame read after the stop signal belongs to the old configuration
        if cancel.is_cancelled() {
            break;
        }
        if handler.handle(read).is_break() {
            break;
        }
    }
}

async fn run_async(
    mut frames: futures::stream::BoxStream<'static, FrameRead>,
    mut handler: FrameHandler,
    cancel: CancellationToken,
) {
    info!("{} frame reader started", handler.transport);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(read) => {
                    if handler.handle(read).is_break() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

enum Activity {
    Thread(std::thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

/// A running reader
pub struct ReaderActivity {
    cancel: CancellationToken,
    activity: Activity,
}

impl ReaderActivity {
    /// Start consuming `source`
    ///
    /// Async sources are spawned on the current tokio runtime, so this must
    /// be called from inside one.
    pub fn launch(source: FrameSource, sink: ReaderSink, transport: Transport) -> SessionResult<Self> {
        let cancel = CancellationToken::new();
        let stats = Arc::clone(&sink.stats);

        stats.running.fetch_add(1, Ordering::AcqRel);
        let handler = FrameHandler::new(sink, transport);

        let activity = match source {
            FrameSource::Blocking(frames) => {
                let token = cancel.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("ps-reader-{}", transport.name().to_lowercase()))
                    .spawn(move || run_blocking(frames, handler, token));
                // A failed spawn drops the handler with the closure, releasing the count
                Activity::Thread(spawned.map_err(|e| SessionError::Runtime(e.to_string()))?)
            }
            FrameSource::Async(frames) => {
                let runtime = match tokio::runtime::Handle::try_current() {
                    Ok(rt) => rt,
                    Err(e) => {
                        drop(handler);
                        return Err(SessionError::Runtime(e.to_string()));
                    }
                };
                Activity::Task(runtime.spawn(run_async(frames, handler, cancel.clone())))
            }
        };

        stats.launched.fetch_add(1, Ordering::Relaxed);
        Ok(Self { cancel, activity })
    }

    /// Whether the reader has exited on its own
    pub fn is_finished(&self) -> bool {
        match &self.activity {
            Activity::Thread(handle) => handle.is_finished(),
            Activity::Task(handle) => handle.is_finished(),
        }
    }

    /// Signal the reader to stop and wait up to `timeout` for it
    ///
    /// Returns `false` if the reader was still running when the wait ran
    /// out; a thread is then left detached and a task is aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        match self.activity {
            Activity::Thread(handle) => {
                let deadline = tokio::time::Instant::now() + timeout;
                while !handle.is_finished() {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("Frame reader thread did not stop within {:?}, detaching", timeout);
                        return false;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                if handle.join().is_err() {
                    warn!("Frame reader thread panicked");
                }
                true
            }
            Activity::Task(mut handle) => {
                match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!("Frame reader task failed: {}", e);
                        true
                    }
                    Err(_) => {
                        warn!("Frame reader task did not stop within {:?}, aborting", timeout);
                        handle.abort();
                        false
                    }
                }
            }
        }
    }
}
