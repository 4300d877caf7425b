//! Run profile loading (ecu-sim.toml)

use anyhow::{Context, Result};
use ecu_sim_core::control::ControlOverlay;
use ecu_sim_core::scheduler::period_from_hz;
use ecu_sim_core::session::RecoveryPolicy;
use ecu_sim_core::telemetry::DEFAULT_TELEMETRY_HZ;
use ecu_sim_core::{Backend, Mode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a run profile can set; every section is optional
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunProfile {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_control")]
    pub control: PathBuf,
    #[serde(default = "default_telemetry")]
    pub telemetry: PathBuf,
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,
    #[serde(default = "default_stop_file")]
    pub stop_file: PathBuf,
    pub dbc: Option<PathBuf>,
    pub custom_file: Option<PathBuf>,
    pub tx_log: Option<PathBuf>,
    pub rx_log: Option<PathBuf>,
}

fn default_control() -> PathBuf {
    PathBuf::from("control.json")
}

fn default_telemetry() -> PathBuf {
    PathBuf::from("telemetry.json")
}

fn default_event_log() -> PathBuf {
    PathBuf::from("logs/can_monitor.jsonl")
}

fn default_stop_file() -> PathBuf {
    PathBuf::from("stop.flag")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            control: default_control(),
            telemetry: default_telemetry(),
            event_log: default_event_log(),
            stop_file: default_stop_file(),
            dbc: None,
            custom_file: None,
            tx_log: None,
            rx_log: None,
        }
    }
}

/// Link settings; unset fields fall through to the control file and defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSection {
    pub backend: Option<Backend>,
    pub iface: Option<String>,
    pub channel: Option<u32>,
    pub port: Option<String>,
    pub serial_baud: Option<u32>,
    pub skip_bitrate: Option<bool>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    pub hz: Option<f64>,
    pub mode: Option<Mode>,
    #[serde(default = "default_telemetry_hz")]
    pub telemetry_hz: f64,
    /// Seconds; run until stopped when unset
    pub duration: Option<f64>,
    #[serde(default)]
    pub hardkill_on_stall: bool,
    #[serde(default)]
    pub tx_stats: bool,
    #[serde(default)]
    pub enforce_dbc_hash: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_telemetry_hz() -> f64 {
    DEFAULT_TELEMETRY_HZ
}

fn default_failure_threshold() -> u32 {
    50
}

fn default_backoff_floor_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    2000
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            hz: None,
            mode: None,
            telemetry_hz: default_telemetry_hz(),
            duration: None,
            hardkill_on_stall: false,
            tx_stats: false,
            enforce_dbc_hash: false,
            failure_threshold: default_failure_threshold(),
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl RunProfile {
    /// The profile's settings as the lowest-precedence overlay
    pub fn overlay(&self) -> ControlOverlay {
        let t = &self.transport;
        ControlOverlay {
            backend: t.backend,
            iface: t.iface.clone(),
            channel: t.channel,
            port: t.port.clone(),
            serial_baud: t.serial_baud,
            skip_bitrate: t.skip_bitrate,
            bitrate: t.bitrate,
            hz: self.session.hz,
            mode: self.session.mode,
            ..Default::default()
        }
    }

    pub fn recovery_policy(&self, hard_reset: bool) -> RecoveryPolicy {
        let s = &self.session;
        let floor = Duration::from_millis(s.backoff_floor_ms.max(1));
        RecoveryPolicy {
            failure_threshold: s.failure_threshold.max(1),
            backoff_floor: floor,
            backoff_cap: Duration::from_millis(s.backoff_cap_ms).max(floor),
            hard_reset: hard_reset || s.hardkill_on_stall,
            ..Default::default()
        }
    }
}

/// Load a run profile from a TOML file
pub fn load_profile(path: &Path) -> Result<RunProfile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let profile: RunProfile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    if let Some(hz) = profile.session.hz {
        period_from_hz(hz).with_context(|| format!("session.hz in {:?}", path))?;
    }

    Ok(profile)
}
