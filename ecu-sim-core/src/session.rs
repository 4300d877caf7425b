//! Transmission session
//!
//! The session owns one broadcast run: it computes the desired signal values
//! every tick, builds the dash frames, sends them in ascending ID order, and
//! keeps the link alive.
//!
//! # Recovery
//!
//! Individual send failures are absorbed. After `failure_threshold`
//! consecutive failures the link is closed, optionally hard-reset, and
//! reopened with exponential backoff (floor 0.5 s, doubling, capped at 2 s)
//! until it comes back or a stop is requested.
//!
//! ```text
//!            ok                        failure (count < threshold)
//!   Running <---- Degraded <-----------------------------+
//!      |  \________________________________________________|
//!      |            count >= threshold
//!      +--------------------------> Reopening --open ok--> Running
//!                                       |
//!                                       +--stop--> Stopped
//! ```
//!
//! # Observability
//!
//! Every tick optionally writes a telemetry snapshot, a TX CSV line per
//! frame, and JSONL events (`tx_ok` at most once per second, `tx_fail`,
//! `bus_state`, reopen progress, 1 Hz `rate` and `tx_timing`).

use crate::codec::{ClampRecord, EncodeError, SignalCodec, SignalValues};
use crate::control::ControlReader;
use crate::custom::CustomScheduler;
use crate::events::{Event, EventLog};
use crate::frame_builder::{BuiltFrames, FrameBuilder};
use crate::listener::Listener;
use crate::scenario::{enforce_map_bounds, scenario_values, Mode};
use crate::scheduler::{Clock, FixedRateScheduler, SystemClock};
use crate::signals::database::SignalDatabase;
use crate::stop::StopSignal;
use crate::telemetry::{
    SignalMeta, TelemetryCounters, TelemetryPublisher, TelemetrySnapshot, TelemetryWriter,
};
use crate::transport::{CanTransport, TransportError};
use crate::txlog::TxLog;
use crate::types::{hex_lower, now_epoch_seconds, CanFrame, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summaries (`rate`, `tx_timing`, `TX_STATS`) are emitted this often
const SUMMARY_INTERVAL: Duration = Duration::from_secs(1);

/// `tx_ok` events are emitted at most this often
const TX_OK_INTERVAL: Duration = Duration::from_secs(1);

/// A send gap above this many periods counts as a late cycle
const LATE_FACTOR: f64 = 1.5;

/// Longest `last_error` text kept in telemetry
const MAX_ERROR_LEN: usize = 120;

/// Link health as seen by the transmission loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Running,
    /// Some recent sends failed
    Degraded,
    /// Too many consecutive failures; the link must be reopened
    Reopening,
    Stopped,
}

/// When and how to reopen a failing link
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub failure_threshold: u32,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    /// Try a device-level reset before reopening
    pub hard_reset: bool,
    /// Pause after a hard reset
    pub reset_settle: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 50,
            backoff_floor: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(2),
            hard_reset: false,
            reset_settle: Duration::from_secs(1),
        }
    }
}

/// Consecutive-failure bookkeeping, free of any I/O
#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    policy: RecoveryPolicy,
    state: LinkState,
    consecutive_failures: u32,
    backoff: Duration,
}

impl RecoveryTracker {
    pub fn new(policy: RecoveryPolicy) -> Self {
        let backoff = policy.backoff_floor;
        Self {
            policy,
            state: LinkState::Running,
            consecutive_failures: 0,
            backoff,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record one send; `Reopening` means the caller must reopen the link
    pub fn on_send(&mut self, ok: bool) -> LinkState {
        if self.state == LinkState::Stopped {
            return self.state;
        }
        if ok {
            self.consecutive_failures = 0;
            self.backoff = self.policy.backoff_floor;
            self.state = LinkState::Running;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.state = if self.consecutive_failures >= self.policy.failure_threshold {
                LinkState::Reopening
            } else {
                LinkState::Degraded
            };
        }
        self.state
    }

    /// Current backoff; the next one doubles up to the cap
    pub fn next_backoff(&mut self) -> Duration {
        let current = self.backoff;
        self.backoff = (current * 2).min(self.policy.backoff_cap);
        current
    }

    pub fn on_reopened(&mut self) {
        self.state = LinkState::Running;
        self.consecutive_failures = 0;
        self.backoff = self.policy.backoff_floor;
    }

    pub fn on_stopped(&mut self) {
        self.state = LinkState::Stopped;
    }
}

/// Counters shared with other threads while a session runs
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub tx_frames: AtomicU64,
    pub tx_errors: AtomicU64,
    pub rx_frames: AtomicU64,
    pub reopens: AtomicU64,
    pub ticks: AtomicU64,
}

impl SessionCounters {
    pub fn snapshot(&self, bus_state: Option<String>) -> TelemetryCounters {
        TelemetryCounters {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            bus_state,
        }
    }
}

/// Static parameters of a run
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: u32,
    pub hz: f64,
    pub mode: Mode,
    /// Let the control file switch the mode at runtime
    pub follow_control_mode: bool,
    /// Stop automatically after this long
    pub duration: Option<Duration>,
    /// Log per-ID TX counts once per second
    pub tx_stats: bool,
    /// Interface label for events and telemetry
    pub interface: String,
    pub channel: u32,
    pub bitrate: u32,
    pub recovery: RecoveryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: 1,
            hz: crate::control::DEFAULT_HZ,
            mode: Mode::Loop,
            follow_control_mode: true,
            duration: None,
            tx_stats: false,
            interface: "can0".to_string(),
            channel: 0,
            bitrate: crate::transport::DEFAULT_BITRATE,
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Why a session ended abnormally
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Encoding failed, stopping session: {0}")]
    EncodeFailed(#[from] EncodeError),

    #[error("Bus reopen aborted by stop request after {0} consecutive failures")]
    ReopenAborted(u32),

    #[error("Cannot open transport: {0}")]
    Transport(#[from] TransportError),
}

/// Final numbers of a run
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub mode: Mode,
    pub ticks: u64,
    pub tx_frames: u64,
    pub tx_errors: u64,
    pub rx_frames: u64,
    pub reopens: u64,
    pub elapsed: Duration,
}

/// Inter-send timing over one summary interval
#[derive(Debug, Clone, Default)]
struct JitterStats {
    min: Option<Duration>,
    max: Option<Duration>,
    sum: Duration,
    count: u32,
    late: u64,
}

impl JitterStats {
    fn record(&mut self, dt: Duration, period: Duration) {
        self.min = Some(self.min.map_or(dt, |m| m.min(dt)));
        self.max = Some(self.max.map_or(dt, |m| m.max(dt)));
        self.sum += dt;
        self.count += 1;
        if dt.as_secs_f64() > period.as_secs_f64() * LATE_FACTOR {
            self.late += 1;
        }
    }

    /// The `tx_timing` event for this interval, then reset
    fn take_event(&mut self, hz: f64) -> Option<Event> {
        let stats = std::mem::take(self);
        if stats.count == 0 {
            return None;
        }
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        Some(Event::TxTiming {
            hz_target: hz,
            dt_ms_min: stats.min.map_or(0.0, ms),
            dt_ms_max: stats.max.map_or(0.0, ms),
            dt_ms_avg: ms(stats.sum / stats.count),
            late_cycles: stats.late,
        })
    }
}

/// Counter values at the previous summary
#[derive(Debug, Clone)]
struct RateMark {
    at: Instant,
    tx: u64,
    rx: u64,
    err: u64,
    per_id: BTreeMap<u32, u64>,
}

fn short_error(message: String) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message;
    }
    let mut cut: String = message.chars().take(MAX_ERROR_LEN - 3).collect();
    cut.push_str("...");
    cut
}

/// One broadcast run over a shared transport
pub struct TransmissionSession {
    config: SessionConfig,
    database: Arc<SignalDatabase>,
    transport: Arc<dyn CanTransport>,
    stop: StopSignal,
    clock: Arc<dyn Clock>,
    scheduler: FixedRateScheduler,
    codec: SignalCodec,
    tracker: RecoveryTracker,
    counters: Arc<SessionCounters>,

    control: Option<ControlReader>,
    telemetry: Option<TelemetryPublisher>,
    events: EventLog,
    tx_log: Option<TxLog>,
    listener: Option<Listener>,
    rx_counter: Option<Arc<AtomicU64>>,
    custom: Option<CustomScheduler>,

    started: Option<Instant>,
    mode: Mode,
    last_mode: Option<Mode>,
    dash_tx_frames: u64,
    carried_tx_errors: u64,
    tx_by_id: BTreeMap<u32, u64>,
    last_error: Option<String>,
    last_state: Option<String>,
    last_map: Option<f64>,
    last_cycle_send: Option<Instant>,
    last_tx_ok_event: Option<Instant>,
    jitter: JitterStats,
    rate_mark: Option<RateMark>,
    signal_meta: BTreeMap<String, SignalMeta>,
}

impl TransmissionSession {
    /// Session paced by the system clock
    pub fn new(
        config: SessionConfig,
        database: Arc<SignalDatabase>,
        transport: Arc<dyn CanTransport>,
        stop: StopSignal,
    ) -> Result<Self> {
        Self::with_clock(config, database, transport, stop, Arc::new(SystemClock))
    }

    /// Session paced by a caller-provided clock
    pub fn with_clock(
        config: SessionConfig,
        database: Arc<SignalDatabase>,
        transport: Arc<dyn CanTransport>,
        stop: StopSignal,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let scheduler = FixedRateScheduler::with_clock(config.hz, Arc::clone(&clock))?;
        let tx_by_id = database.get_all_can_ids().into_iter().map(|id| (id, 0)).collect();
        Ok(Self {
            tracker: RecoveryTracker::new(config.recovery.clone()),
            mode: config.mode,
            config,
            database,
            transport,
            stop,
            clock,
            scheduler,
            codec: SignalCodec::new(),
            counters: Arc::new(SessionCounters::default()),
            control: None,
            telemetry: None,
            events: EventLog::disabled(),
            tx_log: None,
            listener: None,
            rx_counter: None,
            custom: None,
            started: None,
            last_mode: None,
            dash_tx_frames: 0,
            carried_tx_errors: 0,
            tx_by_id,
            last_error: None,
            last_state: None,
            last_map: None,
            last_cycle_send: None,
            last_tx_ok_event: None,
            jitter: JitterStats::default(),
            rate_mark: None,
            signal_meta: BTreeMap::new(),
        })
    }

    pub fn with_control(mut self, control: ControlReader) -> Self {
        self.control = Some(control);
        self
    }

    /// Publish snapshots through `telemetry` on a background thread
    pub fn with_telemetry(mut self, telemetry: TelemetryWriter) -> Self {
        match TelemetryPublisher::spawn(telemetry) {
            Ok(publisher) => self.telemetry = Some(publisher),
            Err(e) => log::warn!("Telemetry disabled: could not start writer thread: {}", e),
        }
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_tx_log(mut self, tx_log: TxLog) -> Self {
        self.tx_log = Some(tx_log);
        self
    }

    /// Take ownership of the listener; its count feeds `rx_frames`
    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.rx_counter = Some(listener.rx_counter());
        self.listener = Some(listener);
        self
    }

    /// In `custom` mode this scheduler transmits instead of the dash frames
    pub fn with_custom_scheduler(mut self, custom: CustomScheduler) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Shared live counters
    pub fn counters(&self) -> Arc<SessionCounters> {
        Arc::clone(&self.counters)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn link_state(&self) -> LinkState {
        self.tracker.state()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// TX errors across reopens (transport counters reset on open)
    pub fn tx_errors(&self) -> u64 {
        self.carried_tx_errors + self.transport.tx_errors()
    }

    /// Frames sent so far, dash and custom
    pub fn tx_frames(&self) -> u64 {
        self.dash_tx_frames + self.custom.as_ref().map_or(0, |c| c.tx_frames())
    }

    /// Run until stopped; the transport is opened first if needed
    pub fn run(&mut self) -> std::result::Result<SessionSummary, SessionError> {
        if !self.transport.is_open() {
            if let Err(e) = self.transport.open() {
                self.drain();
                return Err(SessionError::Transport(e));
            }
        }

        self.events.emit(Event::Start {
            session_id: self.config.session_id,
            iface: self.config.interface.clone(),
            channel: self.config.channel,
            bitrate: self.config.bitrate,
            hz: self.config.hz,
            mode: self.mode,
        });
        self.emit_mode_change(None);
        log::info!(
            "Session {} started on {} at {:.1} Hz, mode {}",
            self.config.session_id,
            self.transport.describe(),
            self.config.hz,
            self.mode
        );

        let outcome = loop {
            match self.tick() {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => {
                    log::error!("{}", e);
                    break Err(e);
                }
            }
        };

        self.drain();
        outcome.map(|()| self.summary())
    }

    /// One cycle of the transmission loop
    ///
    /// Returns `Ok(false)` once the session should stop.
    pub fn tick(&mut self) -> std::result::Result<bool, SessionError> {
        let now = self.clock.now();
        let started = *self.started.get_or_insert_with(|| {
            self.scheduler.start();
            now
        });
        let elapsed = now.saturating_duration_since(started);

        if let Some(limit) = self.config.duration {
            if elapsed >= limit {
                log::info!("Duration reached ({:.2}s); stopping", limit.as_secs_f64());
                self.stop.request();
                return Ok(false);
            }
        }

        let desired = self.desired_values(elapsed.as_secs_f64());
        let mut used = desired.clone();
        let mut clamped = BTreeMap::new();

        // A custom schedule owns the bus in custom mode
        let schedule_owns_bus = self.mode == Mode::Custom && self.custom.is_some();
        if self.mode.transmits() && !schedule_owns_bus {
            let built = FrameBuilder::new(&self.database).build(&mut self.codec, &desired)?;
            used.extend(built.used.iter().map(|(k, v)| (k.clone(), *v)));
            self.send_all(&built, &used)?;
            clamped = built.clamped;
        }

        let bus_state = self.update_bus_state();
        self.refresh_counters();
        self.maybe_summarize(&used, bus_state.clone());
        self.write_telemetry(used, clamped, bus_state);
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        if self.stop.is_set() {
            return Ok(false);
        }
        self.scheduler.wait_next();
        Ok(true)
    }

    /// Scenario values for the current mode, with control overrides and
    /// the MAP plausibility bounds applied
    fn desired_values(&mut self, t: f64) -> SignalValues {
        let update = self.control.as_mut().map(|c| c.poll().clone());
        if let Some(update) = &update {
            if self.config.follow_control_mode {
                if let Some(mode) = update.mode {
                    self.mode = mode;
                }
            }
        }
        if self.last_mode != Some(self.mode) {
            self.emit_mode_change(self.last_mode);
        }

        let mut values = scenario_values(self.mode, t);
        if self.mode == Mode::Custom {
            if let Some(update) = update {
                values.extend(update.overrides);
            }
        }
        enforce_map_bounds(&mut values, &format!("{}_runtime", self.mode));
        values
    }

    fn emit_mode_change(&mut self, from: Option<Mode>) {
        if from.is_some() {
            log::info!("Mode changed: {} -> {}", from.map_or("none", |m| m.as_str()), self.mode);
        }
        self.events.emit(Event::ModeChange {
            from,
            to: self.mode,
            frames: self.tx_by_id.len(),
            hz: self.config.hz,
        });
        self.last_mode = Some(self.mode);
    }

    /// Send every built frame in ascending ID order
    fn send_all(
        &mut self,
        built: &BuiltFrames,
        used: &SignalValues,
    ) -> std::result::Result<(), SessionError> {
        let database = Arc::clone(&self.database);
        let period = self.scheduler.period();

        // One timing sample per cycle, taken at its first send
        if !built.payloads.is_empty() {
            let now = self.clock.now();
            if let Some(prev) = self.last_cycle_send {
                self.jitter.record(now.saturating_duration_since(prev), period);
            }
            self.last_cycle_send = Some(now);
        }

        for (can_id, _, payload) in &built.payloads {
            let Some(message) = database.get_message(*can_id) else {
                continue;
            };
            let frame = CanFrame::new(*can_id, payload.clone(), message.is_extended);

            let meta = SignalMeta {
                last_sent_ms: Some(chrono::Utc::now().timestamp_millis()),
                raw_hex: Some(hex_lower(payload)),
            };
            for signal in &message.signals {
                self.signal_meta.insert(signal.name.clone(), meta.clone());
            }

            let ok = self.transport.send(&frame);
            if ok {
                self.on_sent(&frame, message.signals.iter().map(|s| s.name.as_str()), used);
                self.tracker.on_send(true);
                continue;
            }

            self.last_error = Some(short_error(format!("send failed id=0x{:x}", can_id)));
            let state = self.tracker.on_send(false);
            self.events.emit(Event::TxFail {
                id: *can_id,
                dlc: frame.dlc(),
                mode: self.mode,
                hz: self.config.hz,
                consec_fail: self.tracker.consecutive_failures(),
                error: None,
            });
            if state == LinkState::Reopening {
                self.reopen()?;
            }
        }
        Ok(())
    }

    fn on_sent<'a>(
        &mut self,
        frame: &CanFrame,
        signals: impl Iterator<Item = &'a str>,
        used: &SignalValues,
    ) {
        self.dash_tx_frames += 1;
        *self.tx_by_id.entry(frame.can_id).or_insert(0) += 1;
        if let Some(map) = used.get("map") {
            if self.database.find_signal("map").map(|(m, _)| m.id) == Some(frame.can_id) {
                self.last_map = Some(*map);
            }
        }

        let now = self.clock.now();
        let due = self
            .last_tx_ok_event
            .map_or(true, |prev| now.saturating_duration_since(prev) >= TX_OK_INTERVAL);
        if due {
            self.events.emit(Event::TxOk {
                id: frame.can_id,
                dlc: frame.dlc(),
                mode: self.mode,
                hz: self.config.hz,
                tx_frames: self.tx_frames(),
            });
            self.last_tx_ok_event = Some(now);
        }

        if let Some(tx_log) = self.tx_log.as_mut() {
            let subset: SignalValues = signals
                .map(|name| (name.to_string(), used.get(name).copied().unwrap_or(0.0)))
                .collect();
            tx_log.write(now_epoch_seconds(), frame, &subset);
        }
    }

    /// Close, optionally reset, and reopen the link with backoff
    fn reopen(&mut self) -> std::result::Result<(), SessionError> {
        let failures = self.tracker.consecutive_failures();
        log::warn!("Too many send errors ({}); attempting bus reopen", failures);
        self.events.emit(Event::ReopenBegin {
            consec_fail: failures,
        });

        let errors_before = self.transport.tx_errors();
        self.transport.close();

        if self.tracker.policy().hard_reset {
            log::warn!("Attempting hard reset of {} after stall", self.transport.describe());
            match self.transport.hard_reset() {
                Ok(()) => log::info!("Hard reset done"),
                Err(e) => log::error!("Hard reset failed: {}", e),
            }
            let settle = self.tracker.policy().reset_settle;
            self.stop.sleep(self.clock.as_ref(), settle);
        }

        loop {
            if self.stop.is_set() {
                self.tracker.on_stopped();
                return Err(SessionError::ReopenAborted(failures));
            }
            match self.transport.open() {
                Ok(()) => {
                    log::info!("Bus reopen successful");
                    self.carried_tx_errors += errors_before;
                    self.tracker.on_reopened();
                    self.counters.reopens.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(Event::ReopenOk);
                    return Ok(());
                }
                Err(e) => {
                    let backoff = self.tracker.next_backoff();
                    log::error!("Bus reopen failed: {}", e);
                    self.events.emit(Event::ReopenFail {
                        error: e.to_string(),
                        backoff_s: backoff.as_secs_f64(),
                    });
                    self.stop.sleep(self.clock.as_ref(), backoff);
                }
            }
        }
    }

    fn update_bus_state(&mut self) -> Option<String> {
        let state = self.transport.state().filter(|s| !s.is_empty());
        if let Some(current) = &state {
            if self.last_state.as_ref() != Some(current) {
                log::warn!("CAN state changed: {}", current);
                self.events.emit(Event::BusState {
                    state: current.clone(),
                });
                self.last_state = Some(current.clone());
            }
        }
        state
    }

    fn refresh_counters(&self) {
        self.counters.tx_frames.store(self.tx_frames(), Ordering::Relaxed);
        self.counters.tx_errors.store(self.tx_errors(), Ordering::Relaxed);
        if let Some(rx) = &self.rx_counter {
            self.counters
                .rx_frames
                .store(rx.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Once per second: `rate`, `tx_timing` and the optional `TX_STATS` line
    fn maybe_summarize(&mut self, used: &SignalValues, state: Option<String>) {
        let now = self.clock.now();
        let counters = self.counters.snapshot(None);
        let mark = self.rate_mark.get_or_insert_with(|| RateMark {
            at: now,
            tx: 0,
            rx: 0,
            err: 0,
            per_id: BTreeMap::new(),
        });
        let dt = now.saturating_duration_since(mark.at);
        if dt < SUMMARY_INTERVAL {
            return;
        }

        let secs = dt.as_secs_f64();
        let per_s = |delta: u64| delta as f64 / secs;
        let rate = Event::Rate {
            tx_per_s: per_s(counters.tx_frames.saturating_sub(mark.tx)),
            rx_per_s: per_s(counters.rx_frames.saturating_sub(mark.rx)),
            err_per_s: per_s(counters.tx_errors.saturating_sub(mark.err)),
            state,
        };

        if self.config.tx_stats {
            let parts: Vec<String> = self
                .tx_by_id
                .iter()
                .map(|(id, count)| {
                    let delta = count.saturating_sub(mark.per_id.get(id).copied().unwrap_or(0));
                    format!("{}:{} ({:.1}/s)", id, delta, per_s(delta))
                })
                .collect();
            let map = self
                .last_map
                .or_else(|| used.get("map").copied())
                .map_or_else(|| "n/a".to_string(), |m| format!("{:.3}", m));
            log::info!("TX_STATS dt={:.2}s {} map={}", secs, parts.join(" "), map);
        }

        *mark = RateMark {
            at: now,
            tx: counters.tx_frames,
            rx: counters.rx_frames,
            err: counters.tx_errors,
            per_id: self.tx_by_id.clone(),
        };

        self.events.emit(rate);
        if let Some(timing) = self.jitter.take_event(self.config.hz) {
            self.events.emit(timing);
        }
    }

    fn write_telemetry(
        &mut self,
        signals: SignalValues,
        clamped: BTreeMap<String, BTreeMap<String, ClampRecord>>,
        bus_state: Option<String>,
    ) {
        let Some(publisher) = self.telemetry.as_mut() else {
            return;
        };
        let config = &self.config;
        let mode = self.mode;
        let last_error = &self.last_error;
        let signal_meta = &self.signal_meta;
        let counters = &self.counters;
        publisher.maybe_publish(|| TelemetrySnapshot {
            timestamp: now_epoch_seconds(),
            interface: config.interface.clone(),
            bitrate: config.bitrate,
            rate_hz: config.hz,
            mode,
            last_error: last_error.clone(),
            signals,
            signal_meta: signal_meta.clone(),
            clamped,
            counters: counters.snapshot(bus_state),
        });
    }

    /// Stop helper threads, close the link, emit `stop`
    fn drain(&mut self) {
        self.stop.request();
        if let Some(custom) = self.custom.take() {
            let sent = custom.join();
            self.dash_tx_frames += sent;
        }
        if let Some(listener) = self.listener.take() {
            let received = listener.join();
            self.counters.rx_frames.store(received, Ordering::Relaxed);
        }
        if let Some(publisher) = self.telemetry.take() {
            let skipped = publisher.skipped();
            let writes = publisher.join();
            log::debug!("Telemetry writes={} skipped={}", writes, skipped);
        }
        self.counters.tx_frames.store(self.tx_frames(), Ordering::Relaxed);
        self.counters.tx_errors.store(self.tx_errors(), Ordering::Relaxed);
        self.transport.close();

        self.events.emit(Event::Stop {
            session_id: self.config.session_id,
            tx_frames: self.tx_frames(),
            tx_errors: self.tx_errors(),
        });
        log::info!(
            "TX summary mode={} tx_frames={} tx_errors={} encode_errors={}",
            self.mode,
            self.tx_frames(),
            self.tx_errors(),
            self.codec.encode_error_count()
        );
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            mode: self.mode,
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            tx_frames: self.tx_frames(),
            tx_errors: self.tx_errors(),
            rx_frames: self.counters.rx_frames.load(Ordering::Relaxed),
            reopens: self.counters.reopens.load(Ordering::Relaxed),
            elapsed: self
                .started
                .map_or(Duration::ZERO, |s| self.clock.now().saturating_duration_since(s)),
        }
    }
}
