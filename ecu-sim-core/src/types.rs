//! Core types for the ECU simulator engine
//!
//! This module defines the frame type moved between the engine and the
//! transports, and the error type returned by every fallible engine operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::EncodeError;
use crate::transport::TransportError;

/// Timestamp type used throughout the engine
pub type Timestamp = DateTime<Utc>;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Maximum payload of a classic CAN frame
pub const MAX_DLC: usize = 8;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// A classic CAN frame as handed to or received from a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// CAN arbitration ID (11-bit or 29-bit)
    pub can_id: u32,
    /// Frame data bytes (0-8)
    pub data: Vec<u8>,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if the adapter reported this as an error frame
    #[serde(default)]
    pub is_error_frame: bool,
    /// True if this is a remote frame
    #[serde(default)]
    pub is_remote_frame: bool,
}

impl CanFrame {
    /// Create a data frame
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>, is_extended: bool) -> Self {
        Self {
            can_id,
            data: data.into(),
            is_extended,
            is_error_frame: false,
            is_remote_frame: false,
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Lower-case hex rendering of the payload
    pub fn data_hex(&self) -> String {
        hex_lower(&self.data)
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X} [{}]", self.can_id, self.dlc())?;
        } else {
            write!(f, "{:03X} [{}]", self.can_id, self.dlc())?;
        }
        for byte in &self.data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Seconds since the Unix epoch with millisecond resolution
pub fn epoch_seconds(ts: Timestamp) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

/// Current wall-clock time as epoch seconds
pub fn now_epoch_seconds() -> f64 {
    epoch_seconds(Utc::now())
}

/// Lower-case hex string of a byte slice (no separators)
pub fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Errors that can occur in the engine
///
/// Only structural problems (bad definitions, layout mismatch, bad config)
/// and encode failures surface here. Transient bus problems are absorbed by
/// the transmission session and only show up in counters and events.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Message layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid custom frame schedule: {0}")]
    CustomSchedule(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_display_standard() {
        let frame = CanFrame::new(0x5E8, vec![0x00, 0x64, 0x12, 0x34], false);
        assert_eq!(frame.to_string(), "5E8 [4] 00 64 12 34");
        assert_eq!(frame.dlc(), 4);
    }

    #[test]
    fn test_frame_display_extended() {
        let frame = CanFrame::new(0x18FEF100, vec![0xFF], true);
        assert_eq!(frame.to_string(), "18FEF100 [1] FF");
    }

    #[test]
    fn test_epoch_seconds() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:01.250Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(epoch_seconds(ts), 1_704_067_201.25);
    }

    #[test]
    fn test_hex_lower() {
        assert_eq!(hex_lower(&[0x00, 0x00, 0x12, 0x34]), "00001234");
        assert_eq!(hex_lower(&[]), "");
    }
}
