//! Signal Codec
//!
//! Converts physical signal values to raw integers and packs them into CAN
//! payloads (and back). Handles bit placement for both byte orders, sign
//! extension, and saturation to the raw limits of each signal.
//!
//! Saturation always targets the raw integer range implied by the signal's
//! bit length and signedness, never the DBC min/max. The value reported as
//! "used" is the clamped raw value converted back to physical units, so
//! callers always see what actually went on the wire.

use crate::signals::database::{MessageDefinition, SignalDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Physical values keyed by signal name
pub type SignalValues = BTreeMap<String, f64>;

/// Verbose error lines per message before switching to summaries
const VERBOSE_ERROR_LIMIT: u64 = 3;

/// Minimum spacing of summarized error lines
const ERROR_SUMMARY_INTERVAL: Duration = Duration::from_secs(1);

/// Structural failure while packing a message
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("signal {message}.{signal} needs {required} bytes but the message is {size} bytes")]
    SignalOutOfBounds {
        message: String,
        signal: String,
        required: usize,
        size: usize,
    },

    #[error("signal {message}.{signal} has unsupported length {length}")]
    UnsupportedLength {
        message: String,
        signal: String,
        length: u16,
    },
}

/// A clamp that changed the requested value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampRecord {
    /// Physical value that was asked for
    pub requested: f64,
    /// Physical value that was actually encoded
    pub sent: f64,
}

/// Result of encoding one signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodedSignal {
    /// Raw integer after clamping
    pub raw: i64,
    /// Physical value of `raw`
    pub used: f64,
    /// Value as requested by the caller (before sanitation)
    pub requested: f64,
    /// True if the raw value hit a limit
    pub clamped: bool,
    /// True if a non-finite input was replaced by 0.0
    pub sanitized: bool,
}

/// A fully encoded message
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    /// Payload bytes, always `message.size` long
    pub payload: Vec<u8>,
    /// Physical value actually sent, per signal
    pub used: SignalValues,
    /// Signals whose value was clamped
    pub clamped: BTreeMap<String, ClampRecord>,
}

/// Raw integer limits `(lo, hi)` derived from bit length and signedness
///
/// Unsigned 64-bit signals are capped at `i64::MAX`.
pub fn raw_limits(signal: &SignalDefinition) -> (i64, i64) {
    let bits = signal.length.clamp(1, 64) as u32;
    if signal.is_signed() {
        if bits == 64 {
            (i64::MIN, i64::MAX)
        } else {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        }
    } else if bits >= 63 {
        (0, i64::MAX)
    } else {
        (0, (1i64 << bits) - 1)
    }
}

/// Convert a physical value to a raw integer (unclamped)
///
/// Out-of-range results saturate at the i64 bounds.
pub fn to_raw(signal: &SignalDefinition, physical: f64) -> i64 {
    ((physical - signal.offset) / signal.factor).round() as i64
}

/// Convert a raw integer back to physical units
pub fn to_phys(signal: &SignalDefinition, raw: i64) -> f64 {
    raw as f64 * signal.factor + signal.offset
}

/// Clamp a raw value to the signal limits; returns the value and whether it changed
pub fn clamp_raw(signal: &SignalDefinition, raw: i64) -> (i64, bool) {
    let (lo, hi) = raw_limits(signal);
    if raw < lo {
        (lo, true)
    } else if raw > hi {
        (hi, true)
    } else {
        (raw, false)
    }
}

/// Write a raw value into the signal's bit range
///
/// Only the low `length` bits of `raw` are written (two's complement for
/// negative values). Fails without touching `data` if any bit falls outside.
pub fn pack_raw(data: &mut [u8], signal: &SignalDefinition, raw: i64) -> Result<(), usize> {
    let length = signal.length as usize;
    let required = signal.required_bytes();
    if required > data.len() {
        return Err(required);
    }

    let bits = raw as u64;
    for k in 0..length {
        let (byte_idx, bit_in_byte) = signal.raw_bit_location(k);
        let mask = 1u8 << bit_in_byte;
        if (bits >> k) & 0x01 != 0 {
            data[byte_idx] |= mask;
        } else {
            data[byte_idx] &= !mask;
        }
    }
    Ok(())
}

/// Extract the raw value of a signal from payload bytes
///
/// Returns `None` if the frame is too short for the signal.
pub fn extract_raw(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
    let length = signal.length as usize;
    if signal.required_bytes() > data.len() {
        return None;
    }

    let mut result: u64 = 0;
    for k in 0..length {
        let (byte_idx, bit_in_byte) = signal.raw_bit_location(k);
        let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
        result |= (bit_value as u64) << k;
    }

    Some(if signal.is_signed() {
        sign_extend(result, length)
    } else {
        result as i64
    })
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length == 0 || bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

#[derive(Debug, Default)]
struct ErrorStats {
    count: u64,
    last_summary: Option<Instant>,
}

/// Stateful encoder for one transmission session
///
/// Owns the warn-once sets and error counters so that each session (and
/// each test) starts from a clean slate.
#[derive(Debug, Default)]
pub struct SignalCodec {
    warned_clamps: HashSet<(String, String)>,
    warned_sanitized: HashSet<(String, String)>,
    clamp_counts: HashMap<String, u64>,
    sanitized_total: u64,
    encode_errors: HashMap<String, ErrorStats>,
    encode_error_total: u64,
}

impl SignalCodec {
    /// Create a codec with empty warning/error state
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one physical value: sanitize, scale, round, clamp
    pub fn encode_signal(
        &mut self,
        message_name: &str,
        signal: &SignalDefinition,
        physical: f64,
    ) -> EncodedSignal {
        let mut value = physical;
        let mut sanitized = false;
        if !value.is_finite() {
            let key = (message_name.to_string(), signal.name.clone());
            if self.warned_sanitized.insert(key) {
                log::warn!(
                    "Non-finite value for {}.{}: {} (using 0.0)",
                    message_name,
                    signal.name,
                    physical
                );
            }
            self.sanitized_total += 1;
            value = 0.0;
            sanitized = true;
        }

        let (raw, clamped) = clamp_raw(signal, to_raw(signal, value));
        let used = to_phys(signal, raw);

        if clamped {
            *self.clamp_counts.entry(signal.name.clone()).or_insert(0) += 1;
            let key = (message_name.to_string(), signal.name.clone());
            if self.warned_clamps.insert(key) {
                log::warn!(
                    "Clamp applied for {}.{}: requested={} sent={}",
                    message_name,
                    signal.name,
                    physical,
                    used
                );
            }
        }

        EncodedSignal {
            raw,
            used,
            requested: physical,
            clamped,
            sanitized,
        }
    }

    /// Encode a complete message from desired physical values
    ///
    /// Missing values default to 0.0. Signals aliasing an already-encoded bit
    /// range are skipped. A structural error aborts the whole message.
    pub fn encode_message(
        &mut self,
        message: &MessageDefinition,
        desired: &SignalValues,
    ) -> Result<EncodedMessage, EncodeError> {
        let mut payload = vec![0u8; message.size];
        let mut used = SignalValues::new();
        let mut clamped = BTreeMap::new();

        for signal in message.unique_signals() {
            if signal.length == 0 || signal.length > 64 {
                let err = EncodeError::UnsupportedLength {
                    message: message.name.clone(),
                    signal: signal.name.clone(),
                    length: signal.length,
                };
                self.record_encode_error(&message.name, &err);
                return Err(err);
            }

            let requested = desired.get(&signal.name).copied().unwrap_or(0.0);
            let encoded = self.encode_signal(&message.name, signal, requested);

            if let Err(required) = pack_raw(&mut payload, signal, encoded.raw) {
                let err = EncodeError::SignalOutOfBounds {
                    message: message.name.clone(),
                    signal: signal.name.clone(),
                    required,
                    size: message.size,
                };
                self.record_encode_error(&message.name, &err);
                return Err(err);
            }

            used.insert(signal.name.clone(), encoded.used);
            if encoded.clamped {
                clamped.insert(
                    signal.name.clone(),
                    ClampRecord {
                        requested: encoded.requested,
                        sent: encoded.used,
                    },
                );
            }
        }

        Ok(EncodedMessage {
            payload,
            used,
            clamped,
        })
    }

    /// Decode a raw value to physical units (no clamping)
    pub fn decode(signal: &SignalDefinition, raw: i64) -> f64 {
        to_phys(signal, raw)
    }

    /// Decode every signal of a message that fits in `data`
    pub fn decode_message(message: &MessageDefinition, data: &[u8]) -> SignalValues {
        message
            .signals
            .iter()
            .filter_map(|signal| {
                extract_raw(data, signal).map(|raw| (signal.name.clone(), Self::decode(signal, raw)))
            })
            .collect()
    }

    /// Total structural encode failures seen by this codec
    pub fn encode_error_count(&self) -> u64 {
        self.encode_error_total
    }

    /// How many times a signal has been clamped
    pub fn clamp_count(&self, signal_name: &str) -> u64 {
        self.clamp_counts.get(signal_name).copied().unwrap_or(0)
    }

    /// How many non-finite inputs were replaced
    pub fn sanitized_count(&self) -> u64 {
        self.sanitized_total
    }

    /// Forget all warnings and counters
    pub fn reset_stats(&mut self) {
        *self = Self::default();
    }

    fn record_encode_error(&mut self, message_name: &str, err: &EncodeError) {
        self.encode_error_total += 1;
        let stats = self.encode_errors.entry(message_name.to_string()).or_default();
        stats.count += 1;

        if stats.count <= VERBOSE_ERROR_LIMIT {
            log::error!("Encoding failed for {}: {}", message_name, err);
            return;
        }

        let now = Instant::now();
        let due = stats
            .last_summary
            .map_or(true, |last| now.duration_since(last) >= ERROR_SUMMARY_INTERVAL);
        if due {
            log::error!(
                "Encoding failures for {}: count={} latest={}",
                message_name,
                stats.count,
                err
            );
            stats.last_summary = Some(now);
        }
    }
}
