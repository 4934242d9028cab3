//! Recording buffer and CSV export
//!
//! The reader accumulates samples in a private [`RecordingBatch`] and only
//! takes the shared lock once per batch. On stop the buffer is drained and
//! written as `index,raw` rows to `data_<YYYYMMDD_HHMMSS>.csv`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Whether and where to record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

impl RecordingConfig {
    /// Directory to export into, if recording is active
    pub fn target(&self) -> Option<&Path> {
        if self.enabled {
            self.directory.as_deref()
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Samples {
    session: u64,
    data: Vec<i16>,
}

/// Shared sample accumulator
///
/// Samples belong to one session at a time. Batches staged by a reader of an
/// earlier session are dropped instead of leaking into the current one.
#[derive(Default)]
pub struct RecordingBuffer {
    samples: Mutex<Samples>,
    config: Mutex<RecordingConfig>,
    enabled: AtomicBool,
    planned: Mutex<Option<PathBuf>>,
}

impl RecordingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, config: RecordingConfig) {
        info!(
            "Recording {} ({:?})",
            if config.enabled { "enabled" } else { "disabled" },
            config.directory
        );
        let mut current = self.config.lock();
        self.enabled
            .store(config.target().is_some(), Ordering::Release);
        *current = config;
    }

    pub fn config(&self) -> RecordingConfig {
        self.config.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Empty the buffer and hand it to session `session`
    pub fn begin_session(&self, session: u64) {
        let mut samples = self.samples.lock();
        samples.session = session;
        samples.data.clear();
        *self.planned.lock() = None;
    }

    /// Session the buffer currently records for
    pub fn session(&self) -> u64 {
        self.samples.lock().session
    }

    /// Append samples to the current session
    pub fn extend(&self, batch: &[i16]) {
        self.samples.lock().data.extend_from_slice(batch);
    }

    /// Append samples staged for `session`; returns `false` if that session
    /// is no longer the current one and the samples were dropped
    pub fn extend_for(&self, session: u64, batch: &[i16]) -> bool {
        let mut samples = self.samples.lock();
        if samples.session != session {
            return false;
        }
        samples.data.extend_from_slice(batch);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().data.is_empty()
    }

    pub fn clear(&self) {
        self.samples.lock().data.clear();
    }

    /// Take every buffered sample, leaving the buffer empty
    pub fn drain(&self) -> Vec<i16> {
        std::mem::take(&mut self.samples.lock().data)
    }

    /// Fix the path the next export will be written to
    ///
    /// Returns `None` while recording is disabled. Repeated calls return the
    /// same path until the export happens or a new session begins.
    pub fn plan_export(&self) -> Option<PathBuf> {
        let dir = self.config().target().map(Path::to_path_buf)?;
        let mut planned = self.planned.lock();
        Some(
            planned
                .get_or_insert_with(|| dir.join(export_filename()))
                .clone(),
        )
    }

    /// Drain the buffer and export it if recording is enabled
    ///
    /// Returns the written path, or `None` when recording is disabled or
    /// nothing was recorded.
    pub fn finish(&self) -> std::io::Result<Option<PathBuf>> {
        let samples = self.drain();
        let planned = self.planned.lock().take();
        let Some(dir) = self.config().target().map(Path::to_path_buf) else {
            debug!("Recording disabled, discarding {} samples", samples.len());
            return Ok(None);
        };
        if samples.is_empty() {
            info!("Recording buffer empty, nothing to save");
            return Ok(None);
        }
        let path = planned
            .filter(|p| p.parent() == Some(dir.as_path()))
            .unwrap_or_else(|| dir.join(export_filename()));
        write_csv(&path, &samples).map(|()| Some(path))
    }
}

/// Per-reader staging area in front of a [`RecordingBuffer`]
///
/// Bound to the session current when it was created. Flushes when
/// `batch_size` samples are staged and on drop.
pub struct RecordingBatch {
    buffer: Arc<RecordingBuffer>,
    session: u64,
    staged: Vec<i16>,
    batch_size: usize,
}

impl RecordingBatch {
    pub fn new(buffer: Arc<RecordingBuffer>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            session: buffer.session(),
            buffer,
            staged: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Stage samples if recording is enabled
    pub fn push(&mut self, samples: &[i16]) {
        if !self.buffer.is_enabled() {
            return;
        }
        self.staged.extend_from_slice(samples);
        if self.staged.len() >= self.batch_size {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        if !self.buffer.extend_for(self.session, &self.staged) {
            debug!(
                "Dropping {} samples staged for ended session #{}",
                self.staged.len(),
                self.session
            );
        }
        self.staged.clear();
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }
}

impl Drop for RecordingBatch {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Filename for an export started now
pub fn export_filename() -> String {
    format!("data_{}.csv", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

/// Write `samples` as `index,raw` rows into a new file under `dir`
pub fn export_csv(dir: &Path, samples: &[i16]) -> std::io::Result<PathBuf> {
    let path = dir.join(export_filename());
    write_csv(&path, samples)?;
    Ok(path)
}

fn write_csv(path: &Path, samples: &[i16]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["index", "raw"])?;
    for (i, v) in samples.iter().enumerate() {
        writer.write_record([i.to_string(), v.to_string()])?;
    }
    writer.flush()?;

    info!("CSV saved: {} ({} samples)", path.display(), samples.len());
    Ok(())
}
