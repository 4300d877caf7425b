//! Signal database
//!
//! Holds the message and signal definitions the engine broadcasts, keyed by
//! CAN ID so iteration is always in ascending frame-id order.

use crate::types::{EngineError, Result};
use std::collections::{BTreeMap, HashMap};

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDefinition {
    /// CAN message ID
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// True for 29-bit identifiers
    pub is_extended: bool,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// Source file (DBC filename, or "embedded")
    pub source: String,
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit, DBC convention (MSB for Motorola, LSB for Intel)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order of the signal
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value (informational)
    pub min: f64,
    /// Maximum physical value (informational)
    pub max: f64,
    /// Engineering unit (e.g., "kPa", "RPM", "V")
    pub unit: Option<String>,
}

/// Byte order for signal placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer (two's complement)
    Signed,
    /// Unsigned integer
    Unsigned,
}

impl SignalDefinition {
    /// Convenience constructor for a big-endian signal without min/max/unit
    pub fn big_endian(
        name: impl Into<String>,
        start_bit: u16,
        length: u16,
        value_type: ValueType,
        factor: f64,
        offset: f64,
    ) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::BigEndian,
            value_type,
            factor,
            offset,
            min: 0.0,
            max: 0.0,
            unit: None,
        }
    }

    /// True if the raw value is interpreted as two's complement
    pub fn is_signed(&self) -> bool {
        self.value_type == ValueType::Signed
    }

    /// Position of the MSB in linear MSB-first numbering
    /// (bit 0 = MSB of byte 0, bit 8 = MSB of byte 1, ...)
    ///
    /// Only meaningful for big-endian signals.
    pub fn msb_linear_position(&self) -> usize {
        let start = self.start_bit as usize;
        (start / 8) * 8 + (7 - start % 8)
    }

    /// Byte index and bit-within-byte (0 = LSB) of raw bit `k`
    /// (k = 0 is the least significant bit of the raw value)
    pub fn raw_bit_location(&self, k: usize) -> (usize, u8) {
        match self.byte_order {
            ByteOrder::LittleEndian => {
                let pos = self.start_bit as usize + k;
                (pos / 8, (pos % 8) as u8)
            }
            ByteOrder::BigEndian => {
                let length = self.length as usize;
                let pos = self.msb_linear_position() + (length - 1 - k);
                (pos / 8, 7 - (pos % 8) as u8)
            }
        }
    }

    /// Number of bytes a payload needs for this signal to fit
    pub fn required_bytes(&self) -> usize {
        (0..self.length as usize)
            .map(|k| self.raw_bit_location(k).0 + 1)
            .max()
            .unwrap_or(0)
    }

    /// Key identifying the occupied bit range; two signals with the same key alias
    pub fn bit_range_key(&self) -> (u16, u16, ByteOrder) {
        (self.start_bit, self.length, self.byte_order)
    }

    /// Absolute bit indices (byte * 8 + bit) occupied by this signal
    fn occupied_bits(&self) -> Vec<usize> {
        (0..self.length as usize)
            .map(|k| {
                let (byte, bit) = self.raw_bit_location(k);
                byte * 8 + bit as usize
            })
            .collect()
    }
}

impl MessageDefinition {
    /// Signals to encode, skipping aliases of an already-seen bit range
    pub fn unique_signals(&self) -> Vec<&SignalDefinition> {
        let mut seen = Vec::new();
        let mut unique = Vec::new();
        for signal in &self.signals {
            let key = signal.bit_range_key();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            unique.push(signal);
        }
        unique
    }

    /// Find a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Reject partially overlapping signals
    ///
    /// Signals sharing exactly the same bit range are tolerated as aliases and
    /// deduplicated at encode time.
    pub fn validate_overlaps(&self) -> Result<()> {
        for (i, a) in self.signals.iter().enumerate() {
            if a.length == 0 {
                return Err(EngineError::InvalidSignalDefinition(format!(
                    "{}.{} has zero length",
                    self.name, a.name
                )));
            }
            let a_bits = a.occupied_bits();
            for b in self.signals.iter().skip(i + 1) {
                if a.bit_range_key() == b.bit_range_key() {
                    log::debug!(
                        "{}.{} aliases {}.{}; encoding once",
                        self.name,
                        b.name,
                        self.name,
                        a.name
                    );
                    continue;
                }
                let b_bits = b.occupied_bits();
                if a_bits.iter().any(|bit| b_bits.contains(bit)) {
                    return Err(EngineError::InvalidSignalDefinition(format!(
                        "{}: signals '{}' and '{}' overlap",
                        self.name, a.name, b.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The signal database
#[derive(Debug, Clone, Default)]
pub struct SignalDatabase {
    /// All message definitions by CAN ID
    messages: BTreeMap<u32, MessageDefinition>,

    /// Signal name lookup
    /// Key: Signal name, Value: (CAN ID, signal index)
    signal_lookup: HashMap<String, (u32, usize)>,

    /// Message name lookup
    message_lookup: HashMap<String, u32>,
}

impl SignalDatabase {
    /// Create a new empty signal database
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a database from a list of messages
    pub fn from_messages(messages: Vec<MessageDefinition>) -> Result<Self> {
        let mut db = Self::new();
        for message in messages {
            db.add_message(message)?;
        }
        Ok(db)
    }

    /// Add a message definition to the database
    ///
    /// Fails on duplicate CAN IDs and on overlapping signal bit ranges.
    pub fn add_message(&mut self, message: MessageDefinition) -> Result<()> {
        let can_id = message.id;
        if self.messages.contains_key(&can_id) {
            return Err(EngineError::InvalidSignalDefinition(format!(
                "duplicate message ID 0x{:X} ({})",
                can_id, message.name
            )));
        }
        message.validate_overlaps()?;

        for (sig_idx, signal) in message.signals.iter().enumerate() {
            self.signal_lookup
                .entry(signal.name.clone())
                .or_insert((can_id, sig_idx));
        }
        self.message_lookup.insert(message.name.clone(), can_id);
        self.messages.insert(can_id, message);
        Ok(())
    }

    /// All messages in ascending CAN ID order
    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.values()
    }

    /// Get a message definition by CAN ID
    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&can_id)
    }

    /// Get a message definition by name
    pub fn get_message_by_name(&self, message_name: &str) -> Option<&MessageDefinition> {
        self.message_lookup
            .get(message_name)
            .and_then(|can_id| self.messages.get(can_id))
    }

    /// Find the message owning a signal, and the signal itself
    pub fn find_signal(&self, signal_name: &str) -> Option<(&MessageDefinition, &SignalDefinition)> {
        let (can_id, sig_idx) = self.signal_lookup.get(signal_name)?;
        let message = self.messages.get(can_id)?;
        message.signals.get(*sig_idx).map(|sig| (message, sig))
    }

    /// Signal names in message order, then declaration order
    pub fn signal_names(&self) -> Vec<String> {
        self.messages()
            .flat_map(|msg| msg.signals.iter().map(|s| s.name.clone()))
            .collect()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|msg| msg.signals.len()).sum(),
        }
    }

    /// Get all CAN IDs in ascending order
    pub fn get_all_can_ids(&self) -> Vec<u32> {
        self.messages.keys().copied().collect()
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}
