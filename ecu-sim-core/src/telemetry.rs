//! Telemetry snapshot output
//!
//! The session publishes its live state to a JSON file at a fixed rate.
//! Each write replaces the file atomically (write to a sibling temp file,
//! then rename) so readers never see a partial document.
//!
//! [`TelemetryPublisher`] moves the writes onto a background thread so a
//! slow filesystem never holds up the transmission loop.

use crate::codec::{ClampRecord, SignalValues};
use crate::scenario::Mode;
use crate::scheduler::{period_from_hz, Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default telemetry rate
pub const DEFAULT_TELEMETRY_HZ: f64 = 5.0;

/// Last transmission of one signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_ms: Option<i64>,
    /// Payload of the frame that carried the signal, lower-case hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_hex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub tx_frames: u64,
    pub tx_errors: u64,
    pub rx_frames: u64,
    pub bus_state: Option<String>,
}

/// One telemetry document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Epoch seconds
    pub timestamp: f64,
    pub interface: String,
    pub bitrate: u32,
    pub rate_hz: f64,
    pub mode: Mode,
    pub last_error: Option<String>,
    pub signals: SignalValues,
    pub signal_meta: BTreeMap<String, SignalMeta>,
    /// Clamps of the last cycle, per message then per signal
    pub clamped: BTreeMap<String, BTreeMap<String, ClampRecord>>,
    pub counters: TelemetryCounters,
}

/// Write `contents` to `path` via a temp file and rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Rate-limited, best-effort snapshot writer
pub struct TelemetryWriter {
    path: PathBuf,
    period: Duration,
    next: Option<Instant>,
    clock: Arc<dyn Clock>,
    writes: u64,
}

impl TelemetryWriter {
    pub fn new(path: impl Into<PathBuf>, hz: f64) -> Self {
        Self::with_clock(path, hz, Arc::new(SystemClock))
    }

    /// Unusable rates fall back to the default
    pub fn with_clock(path: impl Into<PathBuf>, hz: f64, clock: Arc<dyn Clock>) -> Self {
        let period = period_from_hz(hz).unwrap_or_else(|e| {
            log::warn!("Telemetry {}; using {} Hz", e, DEFAULT_TELEMETRY_HZ);
            Duration::from_millis((1000.0 / DEFAULT_TELEMETRY_HZ) as u64)
        });
        Self {
            path: path.into(),
            period,
            next: None,
            clock,
            writes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Successful writes so far
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Write the snapshot if a slot is due; returns whether it was written
    pub fn maybe_write(&mut self, snapshot: &TelemetrySnapshot) -> bool {
        claim_slot(&mut self.next, self.clock.now(), self.period) && self.write(snapshot)
    }

    /// Write immediately, ignoring the rate limit
    pub fn write(&mut self, snapshot: &TelemetrySnapshot) -> bool {
        let result = serde_json::to_vec_pretty(snapshot)
            .map_err(std::io::Error::from)
            .and_then(|bytes| write_atomic(&self.path, &bytes));
        match result {
            Ok(()) => {
                self.writes += 1;
                true
            }
            Err(e) => {
                log::debug!("Telemetry write to {:?} failed: {}", self.path, e);
                false
            }
        }
    }
}

/// Take the write slot at `now` if one is due; a stall yields one slot
fn claim_slot(next: &mut Option<Instant>, now: Instant, period: Duration) -> bool {
    let mut due = match *next {
        Some(due) if now < due => return false,
        Some(due) => due,
        None => now,
    };
    while due <= now {
        due += period;
    }
    *next = Some(due);
    true
}

/// Hands snapshots to a writer thread
///
/// Rate limiting happens on the caller's side so snapshots are only built
/// when a slot is due. The hand-off holds at most one pending snapshot; if
/// the writer is still busy with it, the new one is skipped.
pub struct TelemetryPublisher {
    sender: Option<SyncSender<TelemetrySnapshot>>,
    handle: Option<JoinHandle<u64>>,
    clock: Arc<dyn Clock>,
    period: Duration,
    next: Option<Instant>,
    skipped: u64,
}

impl TelemetryPublisher {
    /// Move `writer` onto its own thread
    pub fn spawn(mut writer: TelemetryWriter) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<TelemetrySnapshot>(1);
        let clock = Arc::clone(&writer.clock);
        let period = writer.period;
        let handle = std::thread::Builder::new()
            .name("telemetry-writer".to_string())
            .spawn(move || {
                for snapshot in receiver {
                    writer.write(&snapshot);
                }
                writer.writes()
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            clock,
            period,
            next: None,
            skipped: 0,
        })
    }

    /// Hand off a snapshot if a slot is due; `build` runs only then
    pub fn maybe_publish(&mut self, build: impl FnOnce() -> TelemetrySnapshot) -> bool {
        if !claim_slot(&mut self.next, self.clock.now(), self.period) {
            return false;
        }
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        match sender.try_send(build()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.skipped += 1;
                log::debug!("Telemetry writer busy; snapshot skipped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("Telemetry writer thread is gone");
                self.sender = None;
                false
            }
        }
    }

    /// Snapshots dropped because the writer was busy
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Write whatever is pending, stop the thread; returns successful writes
    pub fn join(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.sender = None;
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(writes)) => writes,
            Some(Err(_)) => {
                log::warn!("Telemetry writer thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read a telemetry file back
pub fn read_snapshot(path: &Path) -> Option<TelemetrySnapshot> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}
