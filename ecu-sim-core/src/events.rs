//! JSONL event log
//!
//! One JSON object per line, each with a `type` tag and a `ts` in epoch
//! seconds. Logging is best-effort: write failures are reported through
//! `log` and otherwise ignored.

use crate::scenario::Mode;
use crate::types::now_epoch_seconds;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Everything the transmission session reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Start {
        session_id: u32,
        iface: String,
        channel: u32,
        bitrate: u32,
        hz: f64,
        mode: Mode,
    },
    Stop {
        session_id: u32,
        tx_frames: u64,
        tx_errors: u64,
    },
    ModeChange {
        from: Option<Mode>,
        to: Mode,
        frames: usize,
        hz: f64,
    },
    TxOk {
        id: u32,
        dlc: usize,
        mode: Mode,
        hz: f64,
        tx_frames: u64,
    },
    TxFail {
        id: u32,
        dlc: usize,
        mode: Mode,
        hz: f64,
        consec_fail: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BusState {
        state: String,
    },
    ReopenBegin {
        consec_fail: u32,
    },
    ReopenOk,
    ReopenFail {
        error: String,
        backoff_s: f64,
    },
    Rate {
        tx_per_s: f64,
        rx_per_s: f64,
        err_per_s: f64,
        state: Option<String>,
    },
    TxTiming {
        hz_target: f64,
        dt_ms_min: f64,
        dt_ms_max: f64,
        dt_ms_avg: f64,
        late_cycles: u64,
    },
}

impl Event {
    /// The `type` tag this event serializes with
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Start { .. } => "start",
            Event::Stop { .. } => "stop",
            Event::ModeChange { .. } => "mode_change",
            Event::TxOk { .. } => "tx_ok",
            Event::TxFail { .. } => "tx_fail",
            Event::BusState { .. } => "bus_state",
            Event::ReopenBegin { .. } => "reopen_begin",
            Event::ReopenOk => "reopen_ok",
            Event::ReopenFail { .. } => "reopen_fail",
            Event::Rate { .. } => "rate",
            Event::TxTiming { .. } => "tx_timing",
        }
    }
}

/// A logged line: the event plus its timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: f64,
    #[serde(flatten)]
    pub event: Event,
}

/// Append-only JSONL writer, opened lazily on first event
#[derive(Debug)]
pub struct EventLog {
    path: Option<PathBuf>,
    file: Option<File>,
    open_failed: bool,
    written: u64,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            file: None,
            open_failed: false,
            written: 0,
        }
    }

    /// A log that drops every event
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
            open_failed: false,
            written: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of lines written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Record an event stamped with the current time
    pub fn emit(&mut self, event: Event) {
        self.emit_at(now_epoch_seconds(), event);
    }

    /// Record an event with an explicit timestamp
    pub fn emit_at(&mut self, ts: f64, event: Event) {
        let Some(file) = self.file() else {
            return;
        };
        let record = EventRecord { ts, event };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Cannot serialize {} event: {}", record.event.kind(), e);
                return;
            }
        };
        match writeln!(file, "{}", line).and_then(|_| file.flush()) {
            Ok(()) => self.written += 1,
            Err(e) => log::warn!("Failed to write event log: {}", e),
        }
    }

    fn file(&mut self) -> Option<&mut File> {
        if self.file.is_none() && !self.open_failed {
            let path = self.path.as_ref()?;
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    log::warn!("Cannot open event log {:?}: {}", path, e);
                    self.open_failed = true;
                }
            }
        }
        self.file.as_mut()
    }
}

/// Read every well-formed record of an event log
pub fn read_events(path: &Path) -> std::io::Result<Vec<EventRecord>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
