//! Control file input
//!
//! `control.json` is written by an operator (or a UI) while the simulator
//! runs. Reading it never fails: missing, oversized or malformed files and
//! invalid fields all fall back to defaults.

use crate::codec::SignalValues;
use crate::scenario::Mode;
use crate::scheduler::period_from_hz;
use crate::signals::layout::SIGNAL_LIST;
use crate::transport::{Backend, TransportConfig, DEFAULT_BITRATE, DEFAULT_SERIAL_BAUD};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Control files larger than this are ignored
pub const MAX_CONTROL_BYTES: u64 = 256 * 1024;

/// Default broadcast rate
pub const DEFAULT_HZ: f64 = 50.0;

/// Fully resolved run settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlConfig {
    pub profile_id: String,
    pub backend: Backend,
    pub iface: String,
    pub channel: u32,
    pub port: Option<String>,
    pub serial_baud: u32,
    pub skip_bitrate: bool,
    pub bitrate: u32,
    pub hz: f64,
    pub mode: Mode,
    pub custom: SignalValues,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            profile_id: "ms_simplified".to_string(),
            backend: Backend::Native,
            iface: "can0".to_string(),
            channel: 0,
            port: None,
            serial_baud: DEFAULT_SERIAL_BAUD,
            skip_bitrate: false,
            bitrate: DEFAULT_BITRATE,
            hz: DEFAULT_HZ,
            mode: Mode::Loop,
            custom: SignalValues::new(),
        }
    }
}

impl ControlConfig {
    /// Defaults overlaid with whatever the control file provides
    pub fn load(path: &Path) -> Self {
        let mut config = Self::default();
        config.apply(&ControlOverlay::load(path));
        config
    }

    /// Overlay the fields set in `overlay`
    pub fn apply(&mut self, overlay: &ControlOverlay) {
        if let Some(v) = &overlay.profile_id {
            self.profile_id = v.clone();
        }
        if let Some(v) = overlay.backend {
            self.backend = v;
        }
        if let Some(v) = &overlay.iface {
            self.iface = v.clone();
        }
        if let Some(v) = overlay.channel {
            self.channel = v;
        }
        if let Some(v) = &overlay.port {
            self.port = Some(v.clone());
        }
        if let Some(v) = overlay.serial_baud {
            self.serial_baud = v;
        }
        if let Some(v) = overlay.skip_bitrate {
            self.skip_bitrate = v;
        }
        if let Some(v) = overlay.bitrate {
            self.bitrate = v;
        }
        if let Some(v) = overlay.hz {
            self.hz = v;
        }
        if let Some(v) = overlay.mode {
            self.mode = v;
        }
        self.custom
            .extend(overlay.custom.iter().map(|(k, v)| (k.clone(), *v)));
    }

    /// Link settings derived from this configuration
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            backend: self.backend,
            iface: self.iface.clone(),
            channel: self.channel,
            port: self.port.clone(),
            serial_baud: self.serial_baud,
            bitrate: self.bitrate,
            skip_bitrate: self.skip_bitrate,
        }
    }
}

/// A partial configuration: only the fields a source actually set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlOverlay {
    pub profile_id: Option<String>,
    pub backend: Option<Backend>,
    pub iface: Option<String>,
    pub channel: Option<u32>,
    pub port: Option<String>,
    pub serial_baud: Option<u32>,
    pub skip_bitrate: Option<bool>,
    pub bitrate: Option<u32>,
    pub hz: Option<f64>,
    pub mode: Option<Mode>,
    /// Signal overrides (known names, numeric values only)
    pub custom: SignalValues,
}

impl ControlOverlay {
    /// Read a control file; any problem yields an empty overlay
    pub fn load(path: &Path) -> Self {
        match read_control_json(path) {
            Some(root) => Self::from_object(&root),
            None => Self::default(),
        }
    }

    /// Extract fields from a parsed JSON object, dropping invalid ones
    pub fn from_object(root: &Map<String, Value>) -> Self {
        Self {
            profile_id: root.get("profile_id").and_then(coerce_string),
            backend: root
                .get("backend")
                .and_then(coerce_string)
                .and_then(|s| match s.parse() {
                    Ok(backend) => Some(backend),
                    Err(e) => {
                        log::warn!("Ignoring control backend: {}", e);
                        None
                    }
                }),
            iface: root.get("iface").and_then(coerce_string),
            channel: root.get("channel").and_then(coerce_u32),
            port: root.get("port").and_then(coerce_string),
            serial_baud: root.get("serial_baud").and_then(coerce_u32),
            skip_bitrate: root.get("skip_bitrate").and_then(coerce_bool),
            bitrate: root.get("bitrate").and_then(coerce_u32),
            hz: root
                .get("hz")
                .and_then(coerce_f64)
                .filter(|hz| period_from_hz(*hz).is_ok()),
            mode: root
                .get("mode")
                .and_then(coerce_string)
                .map(|s| Mode::parse_lenient(&s)),
            custom: extract_overrides(root),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Read and parse a control file as a JSON object
///
/// `None` if the file is missing, too large, unreadable, or not an object.
fn read_control_json(path: &Path) -> Option<Map<String, Value>> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.len() > MAX_CONTROL_BYTES {
        log::warn!(
            "Control file {:?} too large ({} bytes > {}), ignoring",
            path,
            meta.len(),
            MAX_CONTROL_BYTES
        );
        return None;
    }

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::debug!("Cannot read control file {:?}: {}", path, e);
            return None;
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            log::debug!("Control file {:?} is not a JSON object", path);
            None
        }
        Err(e) => {
            log::debug!("Malformed control file {:?}: {}", path, e);
            None
        }
    }
}

/// Numeric overrides from the `custom` block, or the root object without one
pub fn extract_overrides(root: &Map<String, Value>) -> SignalValues {
    let source = match root.get("custom") {
        Some(Value::Object(custom)) => custom,
        _ => root,
    };
    source
        .iter()
        .filter(|(name, _)| SIGNAL_LIST.contains(&name.as_str()))
        .filter_map(|(name, value)| coerce_f64(value).map(|v| (name.clone(), v)))
        .collect()
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_u32(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok()
}

/// Accepts booleans, numbers, and the usual yes/no spellings
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Some(true),
            "0" | "false" | "no" | "n" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// What a control poll yields for the running session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlUpdate {
    /// Mode requested by the file, if any
    pub mode: Option<Mode>,
    /// Signal overrides (used in custom mode)
    pub overrides: SignalValues,
}

/// Re-reads the control file only when its modification time changes
#[derive(Debug)]
pub struct ControlReader {
    path: PathBuf,
    mtime: Option<SystemTime>,
    cached: ControlUpdate,
    reloads: u64,
}

impl ControlReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mtime: None,
            cached: ControlUpdate::default(),
            reloads: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of times the file was actually parsed
    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    /// Current mode and overrides
    pub fn poll(&mut self) -> &ControlUpdate {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();

        match mtime {
            None => {
                self.mtime = None;
                self.cached = ControlUpdate::default();
            }
            Some(mtime) if self.mtime != Some(mtime) => {
                let overlay = ControlOverlay::load(&self.path);
                self.cached = ControlUpdate {
                    mode: overlay.mode,
                    overrides: overlay.custom,
                };
                self.mtime = Some(mtime);
                self.reloads += 1;
                log::debug!(
                    "Control reloaded from {:?}: mode={:?} overrides={}",
                    self.path,
                    self.cached.mode,
                    self.cached.overrides.len()
                );
            }
            Some(_) => {}
        }
        &self.cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(path: &Path, text: &str) {
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = ControlConfig::load(Path::new("/nonexistent/control.json"));
        assert_eq!(config, ControlConfig::default());
        assert_eq!(config.backend, Backend::Native);
        assert_eq!(config.iface, "can0");
        assert_eq!(config.serial_baud, 115_200);
        assert_eq!(config.bitrate, 500_000);
        assert_eq!(config.hz, 50.0);
        assert_eq!(config.mode, Mode::Loop);
    }

    #[test]
    fn test_fields_and_coercion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.json");
        write(
            &path,
            r#"{"backend":"slcan","iface":"","channel":"2","port":"/dev/ttyACM1",
                "serial_baud":"bogus","skip_bitrate":"yes","bitrate":250000.0,
                "hz":"20","mode":"PULL","custom":{"rpm":"3000","map":150,"bogus":1,"tps":"x"}}"#,
        );
        let config = ControlConfig::load(&path);
        assert_eq!(config.backend, Backend::Slcan);
        assert_eq!(config.iface, "can0");
        assert_eq!(config.channel, 2);
        assert_eq!(config.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(config.serial_baud, 115_200);
        assert!(config.skip_bitrate);
        assert_eq!(config.bitrate, 250_000);
        assert_eq!(config.hz, 20.0);
        assert_eq!(config.mode, Mode::Pull);
        assert_eq!(config.custom.len(), 2);
        assert_eq!(config.custom["rpm"], 3000.0);
        assert_eq!(config.custom["map"], 150.0);
    }

    #[test]
    fn test_unknown_mode_falls_back_to_loop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.json");
        write(&path, r#"{"mode":"drift"}"#);
        assert_eq!(ControlConfig::load(&path).mode, Mode::Loop);
    }

    #[test]
    fn test_malformed_and_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.json");
        write(&path, "{not json");
        assert_eq!(ControlConfig::load(&path), ControlConfig::default());
        write(&path, "[1,2,3]");
        assert_eq!(ControlConfig::load(&path), ControlConfig::default());
    }

    #[test]
    fn test_oversized_file_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.json");
        let padding = " ".repeat(MAX_CONTROL_BYTES as usize + 1);
        write(&path, &format!(r#"{{"hz": 10{}}}"#, padding));
        assert_eq!(ControlConfig::load(&path).hz, DEFAULT_HZ);
    }

    #[test]
    fn test_unusable_rate_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.json");
        for hz in ["1e-30", "1e30", "0", "-3"] {
            write(&path, &format!(r#"{{"hz": {}}}"#, hz));
            assert_eq!(ControlOverlay::load(&path).hz, None, "{}", hz);
            assert_eq!(ControlConfig::load(&path).hz, DEFAULT_HZ, "{}", hz);
        }
    }

    #[test]
    fn test_bool_spellings() {
        for (text, expected) in [
            ("true", Some(true)),
            ("0", Some(false)),
            ("1", Some(true)),
            (r#""on""#, Some(true)),
            (r#""No""#, Some(false)),
            (r#""maybe""#, None),
            ("null", None),
        ] {
            let value: Value = serde_json::from_str(text).unwrap();
            assert_eq!(coerce_bool(&value), expected, "{}", text);
        }
    }

    #[test]
    fn test_overrides_from_root_without_custom_block() {
        let root: Value = serde_json::from_str(r#"{"rpm": 1234, "hz": 5, "clt": "190.5"}"#).unwrap();
        let overrides = extract_overrides(root.as_object().unwrap());
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides["rpm"], 1234.0);
        assert_eq!(overrides["clt"], 190.5);
    }

    #[test]
    fn test_overlay_precedence() {
        let mut config = ControlConfig::default();
        let lower = ControlOverlay {
            hz: Some(10.0),
            iface: Some("vcan0".to_string()),
            ..Default::default()
        };
        let upper = ControlOverlay {
            hz: Some(25.0),
            ..Default::default()
        };
        config.apply(&lower);
        config.apply(&upper);
        assert_eq!(config.hz, 25.0);
        assert_eq!(config.iface, "vcan0");
        assert!(ControlOverlay::default().is_empty());
        assert!(!upper.is_empty());
    }

    #[test]
    fn test_reader_caches_by_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.json");
        let mut reader = ControlReader::new(&path);

        assert_eq!(reader.poll(), &ControlUpdate::default());
        assert_eq!(reader.reloads(), 0);

        write(&path, r#"{"mode":"custom","custom":{"rpm":2000}}"#);
        let first_mtime = fs::metadata(&path).unwrap().modified().unwrap();
        let update = reader.poll().clone();
        assert_eq!(update.mode, Some(Mode::Custom));
        assert_eq!(update.overrides["rpm"], 2000.0);
        assert_eq!(reader.reloads(), 1);

        // Same mtime: contents are not re-read
        write(&path, r#"{"mode":"idle","custom":{"rpm":3000}}"#);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(first_mtime)
            .unwrap();
        assert_eq!(reader.poll().overrides["rpm"], 2000.0);
        assert_eq!(reader.reloads(), 1);

        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(first_mtime + Duration::from_secs(5))
            .unwrap();
        assert_eq!(reader.poll().mode, Some(Mode::Idle));
        assert_eq!(reader.poll().overrides["rpm"], 3000.0);
        assert_eq!(reader.reloads(), 2);

        fs::remove_file(&path).unwrap();
        assert_eq!(reader.poll(), &ControlUpdate::default());
    }

    #[test]
    fn test_transport_config_from_control() {
        let config = ControlConfig {
            backend: Backend::Virtual,
            iface: "bench".to_string(),
            ..Default::default()
        };
        let transport = config.transport_config();
        assert_eq!(transport.backend, Backend::Virtual);
        assert_eq!(transport.iface, "bench");
        assert_eq!(transport.bitrate, DEFAULT_BITRATE);
    }
}
