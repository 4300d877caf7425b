//! Driving scenarios
//!
//! Each mode produces a full set of physical signal values (DBC units:
//! temperatures in °F, VSS1 in m/s) for a point in time.

use crate::codec::SignalValues;
use crate::signals::layout::SIGNAL_LIST;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Lowest plausible manifold pressure, kPa
pub const MAP_MIN: f64 = 10.0;

/// Highest plausible manifold pressure, kPa
pub const MAP_MAX: f64 = 260.0;

/// MAP used when the requested value is not a number
pub const MAP_FALLBACK: f64 = 100.0;

/// Length of one `loop` cycle in seconds
pub const LOOP_PERIOD_S: f64 = 15.0;

/// Broadcast mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Cycle koeo → idle → pull every 15 s
    #[default]
    Loop,
    /// Key on, engine off
    Koeo,
    Idle,
    /// Wide-open-throttle ramp over 5 s
    Pull,
    /// Idle base plus overrides from the control file
    Custom,
    /// Compute values but transmit nothing
    Silent,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Loop => "loop",
            Mode::Koeo => "koeo",
            Mode::Idle => "idle",
            Mode::Pull => "pull",
            Mode::Custom => "custom",
            Mode::Silent => "silent",
        }
    }

    /// Whether frames go on the bus in this mode
    pub fn transmits(&self) -> bool {
        !matches!(self, Mode::Silent)
    }

    /// Parse a mode name, falling back to `loop` with a warning
    pub fn parse_lenient(name: &str) -> Mode {
        name.parse().unwrap_or_else(|_| {
            log::warn!("Unknown mode {:?}; defaulting to loop", name);
            Mode::Loop
        })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loop" => Ok(Mode::Loop),
            "koeo" => Ok(Mode::Koeo),
            "idle" => Ok(Mode::Idle),
            "pull" => Ok(Mode::Pull),
            "custom" => Ok(Mode::Custom),
            "silent" => Ok(Mode::Silent),
            other => Err(format!("unknown mode {:?}", other)),
        }
    }
}

/// Clamp MAP to plausible bounds; non-finite becomes [`MAP_FALLBACK`]
pub fn sanitize_map(value: f64, context: &str) -> f64 {
    let value = if value.is_finite() {
        value
    } else {
        log::warn!(
            "MAP non-finite in {}: {} -> {:.1} kPa",
            context,
            value,
            MAP_FALLBACK
        );
        MAP_FALLBACK
    };
    let clamped = value.clamp(MAP_MIN, MAP_MAX);
    if clamped != value {
        log::debug!("MAP clamped in {}: {:.1} -> {:.1} kPa", context, value, clamped);
    }
    clamped
}

/// Apply the MAP plausibility policy in place; returns the value kept
///
/// This runs before codec clamping and is independent of it.
pub fn enforce_map_bounds(signals: &mut SignalValues, context: &str) -> f64 {
    let raw = signals.get("map").copied().unwrap_or(MAP_FALLBACK);
    let sanitized = sanitize_map(raw, context);
    signals.insert("map".to_string(), sanitized);
    sanitized
}

/// Every known signal set to 0.0
fn base_signals() -> SignalValues {
    SIGNAL_LIST.iter().map(|name| (name.to_string(), 0.0)).collect()
}

/// Keep only known signals, replace non-finite values, bound MAP
fn ordered(pairs: &[(&str, f64)], context: &str) -> SignalValues {
    let mut out = base_signals();
    for &(name, value) in pairs {
        let value = if name == "map" {
            sanitize_map(value, context)
        } else if value.is_finite() {
            value
        } else {
            0.0
        };
        if let Some(slot) = out.get_mut(name) {
            *slot = value;
        }
    }
    out
}

fn wave(freq_hz: f64, t: f64) -> f64 {
    (2.0 * PI * freq_hz * t).sin()
}

/// Key on, engine off
pub fn koeo() -> SignalValues {
    ordered(
        &[
            ("map", 100.0),
            ("rpm", 0.0),
            ("clt", 70.0),
            ("tps", 0.5),
            ("mat", 70.0),
            ("afrtgt1", 14.7),
            ("AFR1", 14.7),
            ("egocor1", 100.0),
            ("egt1", 200.0),
            ("batt", 12.2),
        ],
        "scenario_koeo",
    )
}

/// Warm idle with slow oscillations
pub fn idle(t: f64) -> SignalValues {
    let s_rpm = wave(0.5, t);
    let s_tps = wave(0.2, t);
    let s_map = wave(0.3, t);
    let s_batt = wave(0.1, t);
    let s_adv = wave(0.25, t);
    let s_pw = wave(0.4, t);
    let s_clt = wave(0.03, t);
    let s_mat = wave(0.05, t);
    let s_egt = wave(0.2, t);
    let s_knk = wave(0.15, t);

    ordered(
        &[
            ("map", 100.0 + s_map),
            ("rpm", 900.0 + 40.0 * s_rpm),
            ("clt", 185.0 + 2.0 * s_clt),
            ("tps", 1.5 + 0.2 * s_tps),
            ("pw1", 2.5 + 0.15 * s_pw),
            ("pw2", 2.5 + 0.15 * s_pw),
            ("mat", 86.0 + s_mat),
            ("adv_deg", 12.0 + 2.0 * s_adv),
            ("afrtgt1", 14.7),
            ("AFR1", 14.7),
            ("egocor1", 100.0),
            ("egt1", 500.0 + 30.0 * s_egt),
            ("pwseq1", 2.5 + 0.15 * s_pw),
            ("batt", 14.0 - 0.05 * s_batt),
            ("sensors1", 280.0 + 10.0 * s_map),
            ("sensors2", 90.0 + 2.0 * s_mat),
            ("knk_rtd", (0.5 * s_knk).max(0.0)),
        ],
        "scenario_idle",
    )
}

/// Full-throttle pull, ramping over the first 5 s
pub fn pull(t: f64) -> SignalValues {
    let ramp = (t / 5.0).clamp(0.0, 1.0);
    let afr = 14.7 - 2.2 * ramp;

    ordered(
        &[
            ("map", 100.0 + 10.0 * ramp),
            ("rpm", 1000.0 + 7000.0 * ramp),
            ("clt", 185.0 + 5.0 * ramp),
            ("tps", 2.0 + 93.0 * ramp),
            ("pw1", 3.0 + 8.0 * ramp),
            ("pw2", 3.0 + 8.0 * ramp),
            ("mat", 86.0 + 10.0 * ramp),
            ("adv_deg", 12.0 - 6.0 * ramp),
            ("afrtgt1", afr),
            ("AFR1", afr),
            ("egocor1", 100.0),
            ("egt1", 520.0 + 650.0 * ramp),
            ("pwseq1", 3.0 + 8.0 * ramp),
            ("batt", 14.0 - 0.2 * ramp),
            ("sensors1", 300.0 + 220.0 * ramp),
            ("sensors2", 95.0 + 15.0 * ramp),
            ("VSS1", 35.0 * ramp),
        ],
        "scenario_pull",
    )
}

/// koeo for 5 s, idle for 5 s, pull for 5 s, repeat
pub fn cycle(t: f64) -> SignalValues {
    let t = t.rem_euclid(LOOP_PERIOD_S);
    if t < 5.0 {
        koeo()
    } else if t < 10.0 {
        idle(t - 5.0)
    } else {
        pull(t - 10.0)
    }
}

/// Base values for a mode at time `t` (seconds since start)
pub fn scenario_values(mode: Mode, t: f64) -> SignalValues {
    match mode {
        Mode::Loop | Mode::Silent => cycle(t),
        Mode::Koeo => koeo(),
        Mode::Idle | Mode::Custom => idle(t),
        Mode::Pull => pull(t),
    }
}

/// Starting values written into a fresh control file's `custom` block
pub fn default_custom_values() -> SignalValues {
    ordered(
        &[
            ("rpm", 900.0),
            ("map", 45.0),
            ("tps", 2.0),
            ("clt", 185.0),
            ("pw1", 2.5),
            ("pw2", 2.5),
            ("mat", 86.0),
            ("adv_deg", 10.0),
            ("afrtgt1", 14.7),
            ("AFR1", 14.7),
            ("egocor1", 100.0),
            ("egt1", 500.0),
            ("pwseq1", 2.5),
            ("batt", 12.5),
        ],
        "custom_defaults",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("LOOP".parse::<Mode>().unwrap(), Mode::Loop);
        assert_eq!("silent".parse::<Mode>().unwrap(), Mode::Silent);
        assert!("drift".parse::<Mode>().is_err());
        assert_eq!(Mode::parse_lenient("drift"), Mode::Loop);
        assert!(!Mode::Silent.transmits());
        assert!(Mode::Custom.transmits());
    }

    #[test]
    fn test_every_scenario_has_all_signals() {
        for mode in [Mode::Loop, Mode::Koeo, Mode::Idle, Mode::Pull, Mode::Custom, Mode::Silent] {
            for t in [0.0, 2.5, 7.0, 12.0, 31.3] {
                let values = scenario_values(mode, t);
                assert_eq!(values.len(), SIGNAL_LIST.len(), "{} @ {}", mode, t);
                assert!(values.values().all(|v| v.is_finite()));
            }
        }
    }

    #[test]
    fn test_koeo_values() {
        let values = koeo();
        assert_eq!(values["rpm"], 0.0);
        assert_eq!(values["map"], 100.0);
        assert_eq!(values["batt"], 12.2);
        assert_eq!(values["VSS1"], 0.0);
    }

    #[test]
    fn test_idle_at_zero() {
        let values = idle(0.0);
        assert!((values["rpm"] - 900.0).abs() < 1e-9);
        assert!((values["map"] - 100.0).abs() < 1e-9);
        assert_eq!(values["knk_rtd"], 0.0);
    }

    #[test]
    fn test_pull_ramp() {
        assert_eq!(pull(0.0)["rpm"], 1000.0);
        assert!((pull(2.5)["rpm"] - 4500.0).abs() < 1e-9);
        assert_eq!(pull(5.0)["rpm"], 8000.0);
        assert_eq!(pull(60.0)["rpm"], 8000.0);
        assert!((pull(5.0)["AFR1"] - 12.5).abs() < 1e-9);
        assert_eq!(pull(5.0)["VSS1"], 35.0);
    }

    #[test]
    fn test_loop_phases() {
        assert_eq!(cycle(1.0), koeo());
        assert_eq!(cycle(6.0), idle(1.0));
        assert_eq!(cycle(11.0), pull(1.0));
        assert_eq!(cycle(16.0), koeo());
    }

    #[test]
    fn test_map_bounds() {
        assert_eq!(sanitize_map(5.0, "t"), MAP_MIN);
        assert_eq!(sanitize_map(400.0, "t"), MAP_MAX);
        assert_eq!(sanitize_map(f64::NAN, "t"), MAP_FALLBACK);
        assert_eq!(sanitize_map(101.3, "t"), 101.3);

        let mut values = SignalValues::new();
        assert_eq!(enforce_map_bounds(&mut values, "t"), MAP_FALLBACK);
        values.insert("map".to_string(), 9999.0);
        assert_eq!(enforce_map_bounds(&mut values, "t"), MAP_MAX);
        assert_eq!(values["map"], MAP_MAX);
    }

    #[test]
    fn test_default_custom_values() {
        let values = default_custom_values();
        assert_eq!(values.len(), SIGNAL_LIST.len());
        assert_eq!(values["rpm"], 900.0);
        assert_eq!(values["map"], 45.0);
        assert_eq!(values["knk_rtd"], 0.0);
    }
}
