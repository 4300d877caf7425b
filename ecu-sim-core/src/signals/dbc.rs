//! DBC file parser
//!
//! Parses Vector DBC files and converts them into our internal signal database format.

use crate::signals::database::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{EngineError, Result};
use std::path::Path;

/// Bit 31 of a DBC message ID flags a 29-bit identifier
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        EngineError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc")
        .to_string();

    let messages = parse_dbc_bytes(&bytes, &source_filename)?;

    log::info!("Parsed {} messages from {:?}", messages.len(), path);

    Ok(messages)
}

/// Parse DBC content already held in memory
pub fn parse_dbc_bytes(bytes: &[u8], source: &str) -> Result<Vec<MessageDefinition>> {
    // Try UTF-8 first, then fallback to Latin-1/Windows-1252 encoding
    let dbc_content = match String::from_utf8(bytes.to_vec()) {
        Ok(content) => content,
        Err(_) => {
            log::warn!("DBC {} is not UTF-8, trying Latin-1 encoding", source);
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    let dbc = can_dbc::DBC::from_slice(dbc_content.as_bytes()).map_err(|e| {
        EngineError::DbcParseError(format!("Failed to parse DBC {}: {:?}", source, e))
    })?;

    dbc.messages()
        .iter()
        .map(|dbc_msg| convert_message(dbc_msg, source))
        .collect()
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(dbc_msg: &can_dbc::Message, source: &str) -> Result<MessageDefinition> {
    let signals = dbc_msg
        .signals()
        .iter()
        .map(convert_signal)
        .collect::<Result<Vec<_>>>()?;

    let raw_id = dbc_msg.message_id().0;
    let is_extended = raw_id & DBC_EXTENDED_FLAG != 0;

    Ok(MessageDefinition {
        id: raw_id & !DBC_EXTENDED_FLAG,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        is_extended,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        source: source.to_string(),
    })
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(dbc_sig: &can_dbc::Signal) -> Result<SignalDefinition> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let length = *dbc_sig.signal_size();
    if length == 0 || length > 64 {
        return Err(EngineError::InvalidSignalDefinition(format!(
            "Signal '{}' has unsupported length {}",
            dbc_sig.name(),
            length
        )));
    }
    if *dbc_sig.factor() == 0.0 {
        return Err(EngineError::InvalidSignalDefinition(format!(
            "Signal '{}' has a zero factor",
            dbc_sig.name()
        )));
    }

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: length as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SIMPLE_DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 7|16@0+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 23|8@0- (0.5,-40) [-40|215] "C" ECU2

BO_ 2566844926 ExtendedMsg: 8 ECU1
 SG_ Counter : 0|8@1+ (1,0) [0|255] "" ECU2
"#;

    #[test]
    fn test_parse_simple_dbc() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(SIMPLE_DBC.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let messages = parse_dbc_file(temp_file.path()).unwrap();
        assert_eq!(messages.len(), 2);

        let msg1 = &messages[0];
        assert_eq!(msg1.id, 291);
        assert_eq!(msg1.name, "EngineData");
        assert_eq!(msg1.size, 8);
        assert!(!msg1.is_extended);
        assert_eq!(msg1.sender, Some("ECU1".to_string()));
        assert_eq!(msg1.signals.len(), 2);

        let speed = &msg1.signals[0];
        assert_eq!(speed.name, "EngineSpeed");
        assert_eq!(speed.start_bit, 7);
        assert_eq!(speed.length, 16);
        assert_eq!(speed.byte_order, ByteOrder::BigEndian);
        assert_eq!(speed.value_type, ValueType::Unsigned);
        assert_eq!(speed.unit, Some("rpm".to_string()));

        let temp = &msg1.signals[1];
        assert_eq!(temp.value_type, ValueType::Signed);
        assert_eq!(temp.factor, 0.5);
        assert_eq!(temp.offset, -40.0);
    }

    #[test]
    fn test_extended_flag_stripped() {
        let messages = parse_dbc_bytes(SIMPLE_DBC.as_bytes(), "inline.dbc").unwrap();
        let ext = &messages[1];
        assert!(ext.is_extended);
        assert_eq!(ext.id, 2566844926 & 0x7FFF_FFFF);
        assert_eq!(ext.signals[0].byte_order, ByteOrder::LittleEndian);
    }

    #[test]
    fn test_missing_file_is_parse_error() {
        let result = parse_dbc_file(Path::new("/nonexistent/dash.dbc"));
        assert!(matches!(result, Err(EngineError::DbcParseError(_))));
    }
}
