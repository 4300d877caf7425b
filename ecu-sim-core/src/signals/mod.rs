//! Signal database, DBC parser and the expected broadcast layout
//!
//! This module contains the DBC loader, the signal database the codec works
//! from, and the compatibility gate that pins the five broadcast frames.

pub mod dbc;
pub mod database;
pub mod layout;

// Re-export key types for convenience
pub use database::{
    ByteOrder, DatabaseStats, MessageDefinition, SignalDatabase, SignalDefinition, ValueType,
};
pub use layout::{assert_expected_layout, load_database, reference_database, SIGNAL_LIST};
