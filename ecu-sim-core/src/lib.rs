//! ECU CAN Broadcast Simulator Library
//!
//! Simulates an engine ECU broadcasting its dash telemetry (five MegaSquirt
//! style frames, IDs 1512..=1516) on a CAN bus at a fixed rate.
//!
//! # Architecture
//!
//! - [`signals`]: DBC loading, the signal database, and the layout gate that
//!   pins the five broadcast frames
//! - [`codec`]: physical value ↔ raw bit-field conversion with clamping
//! - [`frame_builder`]: one payload per message from a set of desired values
//! - [`transport`]: virtual, SocketCAN and SLCAN serial links
//! - [`scheduler`]: fixed-rate ticks without burst catch-up
//! - [`session`]: the transmission loop and its recovery state machine
//! - [`control`], [`telemetry`], [`events`], [`stop`], [`txlog`]: the file
//!   based operator interface
//!
//! The library does NOT:
//! - Parse command lines or read TOML run profiles
//! - Install signal handlers
//! - Initialise a logger (it only emits through `log`)
//!
//! All of that is in the application layer (ecu-sim-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use ecu_sim_core::{
//!     reference_database, SessionConfig, StopSignal, TransmissionSession, VirtualBus,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let database = Arc::new(reference_database().unwrap());
//! let bus = VirtualBus::new();
//! let transport = Arc::new(bus.attach("sim"));
//!
//! let config = SessionConfig {
//!     duration: Some(Duration::from_secs(2)),
//!     ..Default::default()
//! };
//! let mut session =
//!     TransmissionSession::new(config, database, transport, StopSignal::new()).unwrap();
//! let summary = session.run().unwrap();
//! println!("sent {} frames", summary.tx_frames);
//! ```

// Public modules
pub mod codec;
pub mod control;
pub mod custom;
pub mod events;
pub mod frame_builder;
pub mod listener;
pub mod scenario;
pub mod scheduler;
pub mod session;
pub mod signals;
pub mod stop;
pub mod telemetry;
pub mod transport;
pub mod txlog;
pub mod types;

// Re-export main types for convenience
pub use codec::{ClampRecord, EncodeError, SignalCodec, SignalValues};
pub use control::{ControlConfig, ControlOverlay, ControlReader};
pub use custom::{parse_custom_frames, CustomFrame, CustomScheduler};
pub use events::{Event, EventLog};
pub use frame_builder::{BuiltFrames, FrameBuilder};
pub use listener::{sniff, Listener, ListenerConfig, SniffStats};
pub use scenario::Mode;
pub use scheduler::{Clock, FixedRateScheduler, ManualClock, SystemClock};
pub use session::{
    LinkState, RecoveryPolicy, RecoveryTracker, SessionConfig, SessionCounters, SessionError,
    SessionSummary, TransmissionSession,
};
pub use signals::{
    assert_expected_layout, load_database, reference_database, DatabaseStats, MessageDefinition,
    SignalDatabase, SignalDefinition,
};
pub use stop::StopSignal;
pub use telemetry::{TelemetryPublisher, TelemetrySnapshot, TelemetryWriter};
pub use transport::{
    open_transport, Backend, CanTransport, TransportConfig, TransportError, VirtualBus,
};
pub use txlog::{RxLog, TxLog};
pub use types::{CanFrame, EngineError, Result, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: the embedded layout loads and passes its own gate
        let db = reference_database().unwrap();
        let stats = db.stats();
        assert_eq!(stats.num_messages, 5);
        assert!(assert_expected_layout(&db).is_ok());
        assert!(!VERSION.is_empty());
    }
}
