//! Fixed-rate tick scheduler
//!
//! Paces the transmission loop at a constant rate using a monotonic clock.
//! A late tick is never caught up with a burst: the schedule is realigned to
//! the current time and continues one period later.

use crate::types::{EngineError, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Slowest accepted tick period (one day)
pub const MAX_PERIOD: Duration = Duration::from_secs(86_400);

/// Tick period for a rate in Hz
///
/// Rejects rates whose period is zero, longer than [`MAX_PERIOD`], or not
/// representable as a `Duration`.
pub fn period_from_hz(hz: f64) -> Result<Duration> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "rate must be positive, got {} Hz",
            hz
        )));
    }
    Duration::try_from_secs_f64(1.0 / hz)
        .ok()
        .filter(|period| !period.is_zero() && *period <= MAX_PERIOD)
        .ok_or_else(|| EngineError::InvalidConfig(format!("rate out of range: {} Hz", hz)))
}

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock backed by `Instant::now` and `thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to
///
/// `sleep` advances time instantly, which makes scheduling deterministic in
/// tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward without sleeping
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += duration;
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Ticks at a fixed frequency
pub struct FixedRateScheduler {
    period: Duration,
    clock: Arc<dyn Clock>,
    start: Option<Instant>,
    next: Option<Instant>,
}

impl FixedRateScheduler {
    /// Scheduler on the system clock
    pub fn new(hz: f64) -> Result<Self> {
        Self::with_clock(hz, Arc::new(SystemClock))
    }

    /// Scheduler on a caller-provided clock
    pub fn with_clock(hz: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            period: period_from_hz(hz)?,
            clock,
            start: None,
            next: None,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Anchor the schedule at the current time
    pub fn start(&mut self) {
        let now = self.clock.now();
        self.start = Some(now);
        self.next = Some(now + self.period);
    }

    /// Sleep until the next tick; returns time elapsed since `start`
    pub fn wait_next(&mut self) -> Duration {
        if self.start.is_none() || self.next.is_none() {
            self.start();
        }
        let start = self.start.unwrap_or_else(|| self.clock.now());
        let mut next = self.next.unwrap_or(start);

        let mut now = self.clock.now();
        if next > now {
            self.clock.sleep(next - now);
            now = self.clock.now();
        } else {
            // Late: realign instead of bursting to catch up
            next = now;
        }
        self.next = Some(next + self.period);

        now.saturating_duration_since(start)
    }
}
