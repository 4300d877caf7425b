//! Frame builder
//!
//! Turns one set of desired physical values into a payload for every message
//! of the database, in ascending frame ID order.

use crate::codec::{ClampRecord, EncodeError, EncodedMessage, SignalCodec, SignalValues};
use crate::signals::database::{MessageDefinition, SignalDatabase};
use crate::types::CanFrame;
use std::collections::BTreeMap;

/// Payloads and bookkeeping for one broadcast cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltFrames {
    /// Frame ID, message name and payload, ascending by ID
    pub payloads: Vec<(u32, String, Vec<u8>)>,
    /// Physical value actually encoded, per signal
    pub used: SignalValues,
    /// Clamps applied, per message then per signal
    pub clamped: BTreeMap<String, BTreeMap<String, ClampRecord>>,
}

impl BuiltFrames {
    /// Payload of a message by name
    pub fn payload(&self, message_name: &str) -> Option<&[u8]> {
        self.payloads
            .iter()
            .find(|(_, name, _)| name == message_name)
            .map(|(_, _, data)| data.as_slice())
    }

    /// Frames ready to hand to a transport
    pub fn frames(&self) -> Vec<CanFrame> {
        self.payloads
            .iter()
            .map(|(id, _, data)| CanFrame::new(*id, data.clone(), false))
            .collect()
    }

    /// Clamp records flattened to `signal -> record`
    pub fn clamped_by_signal(&self) -> BTreeMap<String, ClampRecord> {
        self.clamped
            .values()
            .flat_map(|signals| signals.iter().map(|(k, v)| (k.clone(), *v)))
            .collect()
    }
}

/// Builds every message of a database through a session codec
pub struct FrameBuilder<'a> {
    database: &'a SignalDatabase,
}

impl<'a> FrameBuilder<'a> {
    pub fn new(database: &'a SignalDatabase) -> Self {
        Self { database }
    }

    /// Build all payloads; any structural encode error aborts the build
    pub fn build(
        &self,
        codec: &mut SignalCodec,
        desired: &SignalValues,
    ) -> Result<BuiltFrames, EncodeError> {
        let mut built = BuiltFrames::default();

        for message in self.database.messages() {
            let EncodedMessage {
                payload,
                used,
                clamped,
            } = codec.encode_message(message, desired)?;

            built.used.extend(used);
            if !clamped.is_empty() {
                built.clamped.insert(message.name.clone(), clamped);
            }
            built.payloads.push((message.id, message.name.clone(), payload));
        }

        Ok(built)
    }

    /// Build a single message
    pub fn encode_message(
        &self,
        codec: &mut SignalCodec,
        message: &MessageDefinition,
        desired: &SignalValues,
    ) -> Result<EncodedMessage, EncodeError> {
        codec.encode_message(message, desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::layout::{reference_database, SIGNAL_LIST};

    #[test]
    fn test_build_all_messages_in_id_order() {
        let db = reference_database().unwrap();
        let mut codec = SignalCodec::new();
        let built = FrameBuilder::new(&db)
            .build(&mut codec, &SignalValues::new())
            .unwrap();

        let ids: Vec<u32> = built.payloads.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1512, 1513, 1514, 1515, 1516]);
        for (_, _, payload) in &built.payloads {
            assert_eq!(payload.len(), 8);
        }
        assert_eq!(built.used.len(), SIGNAL_LIST.len());
        assert!(built.clamped.is_empty());
    }

    #[test]
    fn test_build_reports_clamps_per_message() {
        let db = reference_database().unwrap();
        let mut codec = SignalCodec::new();
        let mut desired = SignalValues::new();
        desired.insert("map".to_string(), 9999.0);
        desired.insert("knk_rtd".to_string(), -5.0);
        desired.insert("rpm".to_string(), 4660.0);

        let built = FrameBuilder::new(&db).build(&mut codec, &desired).unwrap();

        assert_eq!(
            built.payload("megasquirt_dash0").unwrap(),
            &[0x7F, 0xFF, 0x12, 0x34, 0x00, 0x00, 0x00, 0x00]
        );
        let dash0 = &built.clamped["megasquirt_dash0"];
        assert_eq!(dash0["map"].requested, 9999.0);
        assert!((dash0["map"].sent - 3276.7).abs() < 1e-9);
        assert_eq!(built.clamped["megasquirt_dash3"]["knk_rtd"].sent, 0.0);
        assert_eq!(built.clamped_by_signal().len(), 2);
    }

    #[test]
    fn test_frames_are_standard_ids() {
        let db = reference_database().unwrap();
        let mut codec = SignalCodec::new();
        let built = FrameBuilder::new(&db)
            .build(&mut codec, &SignalValues::new())
            .unwrap();
        let frames = built.frames();
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| !f.is_extended && f.dlc() == 8));
    }
}
