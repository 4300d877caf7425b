//! CAN transports
//!
//! A transport moves [`CanFrame`]s to and from one physical or virtual link.
//! Handles are shared between the transmission loop and the passive listener,
//! so every method takes `&self` and implementations use interior mutability.
//!
//! Supported links:
//! - [`VirtualTransport`]: in-process bus ([`VirtualBus`]) for tests and demos
//! - [`NativeTransport`]: Linux SocketCAN interface (`can0`, `vcan0`, ...)
//! - [`SlcanTransport`]: serial-line CAN adapters speaking the SLCAN ASCII protocol

mod native;
pub mod slcan;
mod virtual_bus;

pub use native::NativeTransport;
pub use slcan::{SlcanTransport, DEFAULT_SERIAL_BAUD};
pub use virtual_bus::{VirtualBus, VirtualTransport};

use crate::types::CanFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Lowest accepted nominal bitrate
pub const MIN_BITRATE: u32 = 10_000;

/// Highest accepted nominal bitrate
pub const MAX_BITRATE: u32 = 2_000_000;

/// Default nominal bitrate
pub const DEFAULT_BITRATE: u32 = 500_000;

/// Errors raised while acquiring or driving a link
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport is not open")]
    NotOpen,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which link implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Virtual,
    #[default]
    Native,
    Slcan,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Virtual => "virtual",
            Backend::Native => "native",
            Backend::Slcan => "slcan",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtual" | "vcan-hub" => Ok(Backend::Virtual),
            "native" | "socketcan" | "can" => Ok(Backend::Native),
            "slcan" | "serial" | "usb" => Ok(Backend::Slcan),
            other => Err(format!("unknown backend {:?}", other)),
        }
    }
}

/// Everything needed to open a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub backend: Backend,
    /// Interface name (native) or channel name (virtual)
    pub iface: String,
    /// Adapter channel index, informational for single-channel links
    pub channel: u32,
    /// Serial device path for SLCAN; `None` means auto-detect
    pub port: Option<String>,
    /// Serial line speed for SLCAN
    pub serial_baud: u32,
    /// Nominal CAN bitrate
    pub bitrate: u32,
    /// Skip the SLCAN bitrate command (adapter keeps its own setting)
    pub skip_bitrate: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Native,
            iface: "can0".to_string(),
            channel: 0,
            port: None,
            serial_baud: DEFAULT_SERIAL_BAUD,
            bitrate: DEFAULT_BITRATE,
            skip_bitrate: false,
        }
    }
}

impl TransportConfig {
    /// Virtual bus channel with default settings
    pub fn virtual_channel(name: impl Into<String>) -> Self {
        Self {
            backend: Backend::Virtual,
            iface: name.into(),
            ..Default::default()
        }
    }

    /// Short label for log lines and telemetry
    pub fn interface_label(&self) -> String {
        match self.backend {
            Backend::Slcan => format!(
                "slcan:{}",
                self.port.as_deref().unwrap_or("auto")
            ),
            _ => format!("{}:{}", self.backend, self.iface),
        }
    }
}

/// Check a nominal bitrate against the accepted range
pub fn validate_bitrate(bitrate: u32) -> Result<u32, TransportError> {
    if !(MIN_BITRATE..=MAX_BITRATE).contains(&bitrate) {
        return Err(TransportError::Unavailable(format!(
            "bitrate {} out of allowed range ({}..{})",
            bitrate, MIN_BITRATE, MAX_BITRATE
        )));
    }
    Ok(bitrate)
}

/// A CAN link shared between the writer and the listener
pub trait CanTransport: Send + Sync {
    /// Acquire the link. Idempotent; resets the TX error counter.
    fn open(&self) -> Result<(), TransportError>;

    /// Send one frame; `false` on any recoverable failure (including not open)
    fn send(&self, frame: &CanFrame) -> bool;

    /// Wait up to `timeout` for one frame
    fn receive(&self, timeout: Duration) -> Option<CanFrame>;

    /// Release the link. Idempotent and infallible.
    fn close(&self);

    /// Whether the link is currently open
    fn is_open(&self) -> bool;

    /// Adapter-reported bus state, if known
    fn state(&self) -> Option<String>;

    /// Failed sends since the last open
    fn tx_errors(&self) -> u64;

    /// Best-effort device-level reset
    fn hard_reset(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!(
            "hard reset not available for {}",
            self.describe()
        )))
    }

    /// Human readable description for log lines
    fn describe(&self) -> String;
}

/// Build the transport selected by `config`
///
/// Virtual links attach to `hub`. The returned handle is not opened yet.
pub fn open_transport(
    config: &TransportConfig,
    hub: &VirtualBus,
) -> Result<Arc<dyn CanTransport>, TransportError> {
    let transport: Arc<dyn CanTransport> = match config.backend {
        Backend::Virtual => Arc::new(hub.attach(&config.iface)),
        Backend::Native => {
            validate_bitrate(config.bitrate)?;
            Arc::new(NativeTransport::new(&config.iface))
        }
        Backend::Slcan => {
            let port = match &config.port {
                Some(port) => port.clone(),
                None => slcan::detect_port().ok_or_else(|| {
                    TransportError::Unavailable("no SLCAN serial port found".to_string())
                })?,
            };
            Arc::new(SlcanTransport::new(
                port,
                config.serial_baud,
                config.bitrate,
                config.skip_bitrate,
            ))
        }
    };

    log::debug!("Created transport {}", transport.describe());
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("virtual".parse::<Backend>().unwrap(), Backend::Virtual);
        assert_eq!("SocketCAN".parse::<Backend>().unwrap(), Backend::Native);
        assert_eq!(" slcan ".parse::<Backend>().unwrap(), Backend::Slcan);
        assert!("pcan".parse::<Backend>().is_err());
        assert_eq!(Backend::default(), Backend::Native);
    }

    #[test]
    fn test_backend_serde_lowercase() {
        let json = serde_json::to_string(&Backend::Slcan).unwrap();
        assert_eq!(json, "\"slcan\"");
        let back: Backend = serde_json::from_str("\"virtual\"").unwrap();
        assert_eq!(back, Backend::Virtual);
    }

    #[test]
    fn test_validate_bitrate() {
        assert!(validate_bitrate(500_000).is_ok());
        assert!(validate_bitrate(10_000).is_ok());
        assert!(validate_bitrate(2_000_000).is_ok());
        assert!(validate_bitrate(9_999).is_err());
        assert!(validate_bitrate(2_000_001).is_err());
    }

    #[test]
    fn test_open_transport_virtual() {
        let hub = VirtualBus::new();
        let config = TransportConfig::virtual_channel("sim");
        let transport = open_transport(&config, &hub).unwrap();
        assert!(!transport.is_open());
        transport.open().unwrap();
        assert!(transport.send(&CanFrame::new(0x5E8, vec![1, 2], false)));
        let echoed = transport.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(echoed.can_id, 0x5E8);
        transport.close();
    }

    #[test]
    fn test_open_transport_rejects_bitrate() {
        let hub = VirtualBus::new();
        let config = TransportConfig {
            bitrate: 5_000,
            ..Default::default()
        };
        assert!(matches!(
            open_transport(&config, &hub),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[test]
    fn test_interface_label() {
        let config = TransportConfig::default();
        assert_eq!(config.interface_label(), "native:can0");
        let config = TransportConfig {
            backend: Backend::Slcan,
            port: Some("/dev/ttyACM0".to_string()),
            ..Default::default()
        };
        assert_eq!(config.interface_label(), "slcan:/dev/ttyACM0");
    }
}
