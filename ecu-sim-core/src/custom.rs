//! Custom frame schedule
//!
//! In `custom` mode an optional JSON schedule replaces the dash broadcast with
//! arbitrary raw frames, each sent at its own period:
//!
//! ```json
//! [
//!   {"id": "0x5E8", "extended": false, "data": "0000123400000000", "period_ms": 20},
//!   {"id": 256, "data": "AABB", "period_ms": 100}
//! ]
//! ```

use crate::control::coerce_bool;
use crate::stop::StopSignal;
use crate::transport::CanTransport;
use crate::types::{CanFrame, EngineError, Result, MAX_DLC, MAX_EXTENDED_ID, MAX_STANDARD_ID};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest idle sleep of the scheduler thread
const MAX_IDLE: Duration = Duration::from_millis(50);
/// Longest accepted period (one day)
const MAX_PERIOD: Duration = Duration::from_secs(86_400);

/// One scheduled frame
#[derive(Debug, Clone, PartialEq)]
pub struct CustomFrame {
    pub frame: CanFrame,
    pub period: Duration,
}

fn schedule_error(index: usize, detail: impl std::fmt::Display) -> EngineError {
    EngineError::CustomSchedule(format!("frame #{}: {}", index, detail))
}

fn parse_id(index: usize, value: Option<&Value>) -> Result<u32> {
    let id = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    };
    id.and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| schedule_error(index, "id must be an integer or a \"0x..\" string"))
}

fn parse_data(index: usize, value: Option<&Value>) -> Result<Vec<u8>> {
    let text = match value {
        None | Some(Value::Null) => "",
        Some(Value::String(s)) => s.trim(),
        Some(_) => return Err(schedule_error(index, "data must be a hex string")),
    };
    if text.len() % 2 != 0 {
        return Err(schedule_error(index, "data hex length must be even"));
    }
    let bytes = (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        })
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| schedule_error(index, "data is not valid hex"))?;
    if bytes.len() > MAX_DLC {
        return Err(schedule_error(
            index,
            format!("data has {} bytes (max {})", bytes.len(), MAX_DLC),
        ));
    }
    Ok(bytes)
}

fn parse_entry(index: usize, entry: &Value) -> Result<CustomFrame> {
    let obj = entry
        .as_object()
        .ok_or_else(|| schedule_error(index, "must be an object"))?;

    let can_id = parse_id(index, obj.get("id"))?;
    let extended = obj.get("extended").and_then(coerce_bool).unwrap_or(false);
    let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
    if can_id > max_id {
        return Err(schedule_error(
            index,
            format!("id 0x{:X} exceeds 0x{:X}", can_id, max_id),
        ));
    }

    let data = parse_data(index, obj.get("data"))?;

    let period_ms = obj.get("period_ms").and_then(Value::as_f64).unwrap_or(0.0);
    if !period_ms.is_finite() || period_ms <= 0.0 {
        return Err(schedule_error(index, "period_ms must be > 0"));
    }
    let period = Duration::try_from_secs_f64(period_ms / 1000.0)
        .ok()
        .filter(|period| *period <= MAX_PERIOD && !period.is_zero())
        .ok_or_else(|| schedule_error(index, "period_ms out of range"))?;

    Ok(CustomFrame {
        frame: CanFrame::new(can_id, data, extended),
        period,
    })
}

/// Parse schedule JSON text
pub fn parse_custom_frames_str(text: &str) -> Result<Vec<CustomFrame>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| EngineError::CustomSchedule(format!("invalid JSON: {}", e)))?;
    let entries = value
        .as_array()
        .ok_or_else(|| EngineError::CustomSchedule("must be a list of frame objects".to_string()))?;
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| parse_entry(index, entry))
        .collect()
}

/// Load and validate a schedule file
pub fn parse_custom_frames(path: &Path) -> Result<Vec<CustomFrame>> {
    if !path.exists() {
        return Err(EngineError::CustomSchedule(format!(
            "custom file not found: {:?}",
            path
        )));
    }
    let text = std::fs::read_to_string(path)?;
    parse_custom_frames_str(&text)
}

/// Background thread sending a custom schedule
pub struct CustomScheduler {
    handle: Option<JoinHandle<()>>,
    tx_frames: Arc<AtomicU64>,
    halt: Arc<AtomicBool>,
}

impl CustomScheduler {
    pub fn spawn(
        transport: Arc<dyn CanTransport>,
        frames: Vec<CustomFrame>,
        stop: StopSignal,
    ) -> std::io::Result<Self> {
        let tx_frames = Arc::new(AtomicU64::new(0));
        let halt = Arc::new(AtomicBool::new(false));
        let counter = Arc::clone(&tx_frames);
        let halted = Arc::clone(&halt);

        let handle = std::thread::Builder::new()
            .name("custom-scheduler".to_string())
            .spawn(move || {
                let start = Instant::now();
                let mut schedule: Vec<(CustomFrame, Instant)> = frames
                    .into_iter()
                    .map(|f| {
                        let first = start + f.period;
                        (f, first)
                    })
                    .collect();

                while !halted.load(Ordering::Relaxed) && !stop.is_set() {
                    let now = Instant::now();
                    for (item, next) in schedule.iter_mut() {
                        if now >= *next {
                            if transport.send(&item.frame) {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            *next = now + item.period;
                        }
                    }
                    let sleep = schedule
                        .iter()
                        .map(|(_, next)| next.saturating_duration_since(Instant::now()))
                        .min()
                        .unwrap_or(MAX_IDLE)
                        .clamp(Duration::from_millis(1), MAX_IDLE);
                    std::thread::sleep(sleep);
                }
            })?;

        Ok(Self {
            handle: Some(handle),
            tx_frames,
            halt,
        })
    }

    /// Frames sent successfully so far
    pub fn tx_frames(&self) -> u64 {
        self.tx_frames.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it; returns the final frame count
    pub fn join(mut self) -> u64 {
        self.shutdown();
        self.tx_frames()
    }

    fn shutdown(&mut self) {
        self.halt.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Custom scheduler thread panicked");
            }
        }
    }
}

impl Drop for CustomScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualBus;

    #[test]
    fn test_parse_valid_schedule() {
        let frames = parse_custom_frames_str(
            r#"[
                {"id": "0x5E8", "extended": false, "data": "0000123400000000", "period_ms": 20},
                {"id": 256, "data": "aabb", "period_ms": 100.5},
                {"id": "0x18FEF100", "extended": "yes", "data": "", "period_ms": 1000}
            ]"#,
        )
        .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame.can_id, 0x5E8);
        assert_eq!(frames[0].frame.data, vec![0, 0, 0x12, 0x34, 0, 0, 0, 0]);
        assert_eq!(frames[0].period, Duration::from_millis(20));
        assert_eq!(frames[1].frame.can_id, 256);
        assert_eq!(frames[1].frame.data, vec![0xAA, 0xBB]);
        assert!(frames[2].frame.is_extended);
        assert!(frames[2].frame.data.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let bad = [
            r#"{"id": 1}"#,
            r#"[1]"#,
            r#"[{"data": "00", "period_ms": 10}]"#,
            r#"[{"id": "zz", "period_ms": 10}]"#,
            r#"[{"id": 1, "data": "abc", "period_ms": 10}]"#,
            r#"[{"id": 1, "data": "zz", "period_ms": 10}]"#,
            r#"[{"id": 1, "data": 12, "period_ms": 10}]"#,
            r#"[{"id": 1, "data": "00", "period_ms": 0}]"#,
            r#"[{"id": 1, "data": "00"}]"#,
            r#"[{"id": 1, "data": "00", "period_ms": 1e30}]"#,
            r#"[{"id": 1, "data": "00", "period_ms": 1e12}]"#,
            r#"[{"id": 1, "data": "00", "period_ms": 1e-12}]"#,
            r#"[{"id": 2048, "period_ms": 10}]"#,
            r#"[{"id": 1, "data": "000000000000000000", "period_ms": 10}]"#,
            "not json",
        ];
        for text in bad {
            assert!(
                matches!(parse_custom_frames_str(text), Err(EngineError::CustomSchedule(_))),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            parse_custom_frames(Path::new("/nonexistent/custom.json")),
            Err(EngineError::CustomSchedule(_))
        ));
    }

    #[test]
    fn test_scheduler_sends_frames() {
        let bus = VirtualBus::new();
        let transport: Arc<dyn CanTransport> = Arc::new(bus.attach("sim"));
        transport.open().unwrap();
        let frames = parse_custom_frames_str(r#"[{"id": 1, "data": "01", "period_ms": 10}]"#).unwrap();

        let scheduler =
            CustomScheduler::spawn(Arc::clone(&transport), frames, StopSignal::new()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while scheduler.tx_frames() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let sent = scheduler.join();
        assert!(sent >= 3);

        let received = transport.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(received, CanFrame::new(1, vec![1], false));
    }
}
