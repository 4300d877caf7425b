//! Passive receive side
//!
//! [`Listener`] drains the shared transport on a background thread, counts
//! frames, and optionally logs them (decoded against the database) to CSV.
//! [`sniff`] is a bounded variant that collects per-ID statistics.

use crate::codec::SignalCodec;
use crate::signals::database::SignalDatabase;
use crate::stop::StopSignal;
use crate::transport::CanTransport;
use crate::txlog::RxLog;
use crate::types::{now_epoch_seconds, CanFrame};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Receive timeout of one listener poll
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);

/// Frame whose inter-arrival time the sniffer tracks by default
pub const SNIFF_FOCUS_ID: u32 = 0x5E8;

#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    /// Append received frames to this CSV file
    pub rx_log: Option<PathBuf>,
    /// Decode frames known to the database into the RX log
    pub decode: bool,
}

/// Background receive loop
pub struct Listener {
    handle: Option<JoinHandle<()>>,
    rx_frames: Arc<AtomicU64>,
    halt: Arc<AtomicBool>,
}

impl Listener {
    /// Start listening on `transport` until `stop` fires or [`Listener::join`]
    pub fn spawn(
        transport: Arc<dyn CanTransport>,
        database: Option<Arc<SignalDatabase>>,
        config: ListenerConfig,
        stop: StopSignal,
    ) -> std::io::Result<Self> {
        let mut rx_log = match &config.rx_log {
            Some(path) => Some(RxLog::open(path)?),
            None => None,
        };
        let rx_frames = Arc::new(AtomicU64::new(0));
        let halt = Arc::new(AtomicBool::new(false));

        let counter = Arc::clone(&rx_frames);
        let halted = Arc::clone(&halt);
        let handle = std::thread::Builder::new()
            .name("can-listener".to_string())
            .spawn(move || {
                log::debug!("Listener started on {}", transport.describe());
                while !halted.load(Ordering::Relaxed) && !stop.is_set() {
                    if !transport.is_open() {
                        std::thread::sleep(RECEIVE_TIMEOUT);
                        continue;
                    }
                    let Some(frame) = transport.receive(RECEIVE_TIMEOUT) else {
                        continue;
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    log::trace!("RX {}", frame);

                    if let Some(log) = rx_log.as_mut() {
                        let decoded = if config.decode {
                            database
                                .as_deref()
                                .and_then(|db| db.get_message(frame.can_id))
                                .map(|msg| SignalCodec::decode_message(msg, &frame.data))
                        } else {
                            None
                        };
                        log.write(now_epoch_seconds(), &frame, decoded.as_ref());
                    }
                }
                log::debug!("Listener stopped");
            })?;

        Ok(Self {
            handle: Some(handle),
            rx_frames,
            halt,
        })
    }

    /// Frames received so far
    pub fn rx_frames(&self) -> u64 {
        self.rx_frames.load(Ordering::Relaxed)
    }

    /// Shared counter, for snapshots taken on other threads
    pub fn rx_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.rx_frames)
    }

    /// Stop the thread and wait for it
    pub fn join(mut self) -> u64 {
        self.shutdown();
        self.rx_frames()
    }

    fn shutdown(&mut self) {
        self.halt.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Per-ID traffic statistics
#[derive(Debug, Clone)]
pub struct SniffStats {
    pub focus_id: u32,
    pub counts: BTreeMap<u32, u64>,
    focus_prev: Option<Instant>,
    focus_min: Option<Duration>,
    focus_max: Option<Duration>,
    focus_sum: Duration,
    focus_samples: u32,
}

impl SniffStats {
    pub fn new(focus_id: u32) -> Self {
        Self {
            focus_id,
            counts: BTreeMap::new(),
            focus_prev: None,
            focus_min: None,
            focus_max: None,
            focus_sum: Duration::ZERO,
            focus_samples: 0,
        }
    }

    pub fn record(&mut self, frame: &CanFrame, at: Instant) {
        *self.counts.entry(frame.can_id).or_insert(0) += 1;
        if frame.can_id != self.focus_id {
            return;
        }
        if let Some(prev) = self.focus_prev {
            let delta = at.saturating_duration_since(prev);
            self.focus_min = Some(self.focus_min.map_or(delta, |m| m.min(delta)));
            self.focus_max = Some(self.focus_max.map_or(delta, |m| m.max(delta)));
            self.focus_sum += delta;
            self.focus_samples += 1;
        }
        self.focus_prev = Some(at);
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// `(min, max, avg)` inter-arrival of the focus ID
    pub fn focus_interarrival(&self) -> Option<(Duration, Duration, Duration)> {
        if self.focus_samples == 0 {
            return None;
        }
        Some((
            self.focus_min?,
            self.focus_max?,
            self.focus_sum / self.focus_samples,
        ))
    }

    /// Log the summary the way operators expect to grep it
    pub fn log_summary(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(1e-6);
        log::info!(
            "SNIFF_SUMMARY duration={:.2}s frames={} ids={}",
            secs,
            self.total(),
            self.counts.len()
        );
        for (id, count) in &self.counts {
            log::info!("ID 0x{:x} count={} freq={:.2}/s", id, count, *count as f64 / secs);
        }
        match self.focus_interarrival() {
            Some((min, max, avg)) => log::info!(
                "ID 0x{:x} inter-arrival (s): min={:.4} max={:.4} avg={:.4} samples={}",
                self.focus_id,
                min.as_secs_f64(),
                max.as_secs_f64(),
                avg.as_secs_f64(),
                self.focus_samples
            ),
            None => log::warn!(
                "ID 0x{:x} not observed; no inter-arrival stats",
                self.focus_id
            ),
        }
    }
}

/// Listen passively for `duration` (or until stopped) and collect statistics
pub fn sniff(
    transport: &dyn CanTransport,
    duration: Duration,
    focus_id: u32,
    stop: &StopSignal,
) -> SniffStats {
    let mut stats = SniffStats::new(focus_id);
    let start = Instant::now();
    let end = start.checked_add(duration);

    while !stop.is_set() {
        let remaining = end.map_or(Duration::MAX, |end| end.saturating_duration_since(Instant::now()));
        if remaining.is_zero() {
            break;
        }
        if let Some(frame) = transport.receive(remaining.min(Duration::from_millis(200))) {
            stats.record(&frame, Instant::now());
        }
    }

    stats.log_summary(start.elapsed());
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::layout::reference_database;
    use crate::transport::VirtualBus;
    use tempfile::TempDir;

    #[test]
    fn test_listener_counts_and_logs() {
        let dir = TempDir::new().unwrap();
        let rx_path = dir.path().join("rx.csv");
        let bus = VirtualBus::new();
        let tx = bus.attach("sim");
        let rx: Arc<dyn CanTransport> = Arc::new(bus.attach("sim"));
        tx.open().unwrap();
        rx.open().unwrap();

        let db = Arc::new(reference_database().unwrap());
        let listener = Listener::spawn(
            Arc::clone(&rx),
            Some(db),
            ListenerConfig {
                rx_log: Some(rx_path.clone()),
                decode: true,
            },
            StopSignal::new(),
        )
        .unwrap();

        for _ in 0..3 {
            assert!(tx.send(&CanFrame::new(0x5E8, vec![0, 0, 0x03, 0x84, 0, 0, 0, 0], false)));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.rx_frames() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(listener.join(), 3);

        let text = std::fs::read_to_string(&rx_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains(",0x5e8,0000038400000000,"));
        assert!(lines[1].contains(r#"""rpm"":900.0"#));
    }

    #[test]
    fn test_listener_stops_on_signal() {
        let bus = VirtualBus::new();
        let rx: Arc<dyn CanTransport> = Arc::new(bus.attach("sim"));
        let stop = StopSignal::new();
        let listener =
            Listener::spawn(rx, None, ListenerConfig::default(), stop.clone()).unwrap();
        stop.request();
        assert_eq!(listener.join(), 0);
    }

    #[test]
    fn test_sniff_stats_interarrival() {
        let mut stats = SniffStats::new(0x5E8);
        let t0 = Instant::now();
        let focus = CanFrame::new(0x5E8, vec![], false);
        let other = CanFrame::new(0x5E9, vec![], false);
        stats.record(&focus, t0);
        stats.record(&other, t0 + Duration::from_millis(1));
        stats.record(&focus, t0 + Duration::from_millis(20));
        stats.record(&focus, t0 + Duration::from_millis(50));

        assert_eq!(stats.total(), 4);
        assert_eq!(stats.counts[&0x5E8], 3);
        let (min, max, avg) = stats.focus_interarrival().unwrap();
        assert_eq!(min, Duration::from_millis(20));
        assert_eq!(max, Duration::from_millis(30));
        assert_eq!(avg, Duration::from_millis(25));
    }

    #[test]
    fn test_sniff_on_virtual_bus() {
        let bus = VirtualBus::new();
        let rx = bus.attach("sim");
        rx.open().unwrap();
        let tx = bus.attach("sim");
        tx.open().unwrap();
        tx.send(&CanFrame::new(0x5E8, vec![1], false));
        tx.send(&CanFrame::new(0x123, vec![2], false));

        let stats = sniff(&rx, Duration::from_millis(100), SNIFF_FOCUS_ID, &StopSignal::new());
        assert_eq!(stats.total(), 2);
        assert!(stats.focus_interarrival().is_none());
    }
}
