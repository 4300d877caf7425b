//! Expected broadcast layout
//!
//! The simulator only ever transmits the MegaSquirt "simplified dash" set:
//! five 8-byte frames at 0x5E8..0x5EC. Whatever DBC is loaded must match this
//! layout bit for bit, otherwise startup is refused.

use crate::signals::database::{ByteOrder, SignalDatabase};
use crate::signals::dbc;
use crate::types::{EngineError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;

/// Version tag of the layout below
pub const LAYOUT_VERSION: &str = "ms-simplified-dash/1";

/// Reference DBC shipped with the engine
pub const REFERENCE_DBC: &[u8] = include_bytes!("../../assets/megasquirt_dash.dbc");

/// SHA-256 of the reference DBC, upper-case hex
pub const REFERENCE_DBC_SHA256: &str =
    "5A5FE9158DB7FB79120D5E78AEBBFAD2E610EBA5F1D8BE86EAA8DC86F0DDDF0D";

/// Every broadcast frame carries a full 8-byte payload
pub const EXPECTED_DLC: usize = 8;

/// All 20 signals in the stable order used by control, telemetry and UIs
pub const SIGNAL_LIST: [&str; 20] = [
    "map",
    "rpm",
    "clt",
    "tps",
    "pw1",
    "pw2",
    "mat",
    "adv_deg",
    "afrtgt1",
    "AFR1",
    "egocor1",
    "egt1",
    "pwseq1",
    "batt",
    "sensors1",
    "sensors2",
    "knk_rtd",
    "VSS1",
    "tc_retard",
    "launch_timing",
];

/// Expected bit-level metadata of one signal
#[derive(Debug, Clone, Copy)]
pub struct ExpectedSignal {
    pub name: &'static str,
    pub start: u16,
    pub length: u16,
    pub signed: bool,
    pub factor: f64,
    pub offset: f64,
}

/// Expected message: ID, name and signal set
#[derive(Debug, Clone, Copy)]
pub struct ExpectedMessage {
    pub id: u32,
    pub name: &'static str,
    pub signals: &'static [ExpectedSignal],
}

const fn sig(name: &'static str, start: u16, length: u16, signed: bool, factor: f64) -> ExpectedSignal {
    ExpectedSignal {
        name,
        start,
        length,
        signed,
        factor,
        offset: 0.0,
    }
}

/// The simplified dash broadcast layout (all signals big-endian)
pub const EXPECTED_LAYOUT: [ExpectedMessage; 5] = [
    ExpectedMessage {
        id: 1512,
        name: "megasquirt_dash0",
        signals: &[
            sig("map", 7, 16, true, 0.1),
            sig("rpm", 23, 16, false, 1.0),
            sig("clt", 39, 16, true, 0.1),
            sig("tps", 55, 16, true, 0.1),
        ],
    },
    ExpectedMessage {
        id: 1513,
        name: "megasquirt_dash1",
        signals: &[
            sig("pw1", 7, 16, false, 0.001),
            sig("pw2", 23, 16, false, 0.001),
            sig("mat", 39, 16, true, 0.1),
            sig("adv_deg", 55, 16, true, 0.1),
        ],
    },
    ExpectedMessage {
        id: 1514,
        name: "megasquirt_dash2",
        signals: &[
            sig("AFR1", 15, 8, false, 0.1),
            sig("afrtgt1", 7, 8, false, 0.1),
            sig("egocor1", 23, 16, true, 0.1),
            sig("egt1", 39, 16, true, 0.1),
            sig("pwseq1", 55, 16, true, 0.001),
        ],
    },
    ExpectedMessage {
        id: 1515,
        name: "megasquirt_dash3",
        signals: &[
            sig("batt", 7, 16, true, 0.1),
            sig("sensors1", 23, 16, true, 0.01),
            sig("sensors2", 39, 16, true, 0.01),
            sig("knk_rtd", 55, 8, false, 0.1),
        ],
    },
    ExpectedMessage {
        id: 1516,
        name: "megasquirt_dash4",
        signals: &[
            sig("VSS1", 7, 16, false, 0.1),
            sig("tc_retard", 23, 16, true, 0.1),
            sig("launch_timing", 39, 16, true, 0.1),
        ],
    },
];

fn same_float(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
}

/// Validate that a database matches the simplified dash layout exactly
pub fn assert_expected_layout(db: &SignalDatabase) -> Result<()> {
    let found_ids: BTreeSet<u32> = db.get_all_can_ids().into_iter().collect();
    let expected_ids: BTreeSet<u32> = EXPECTED_LAYOUT.iter().map(|m| m.id).collect();
    if found_ids != expected_ids {
        return Err(EngineError::LayoutMismatch(format!(
            "unexpected frame IDs: found {:?}, expected {:?}",
            found_ids, expected_ids
        )));
    }

    for expected in &EXPECTED_LAYOUT {
        let msg = db
            .get_message(expected.id)
            .ok_or_else(|| EngineError::MessageNotFound(expected.name.to_string()))?;

        if msg.size != EXPECTED_DLC {
            return Err(EngineError::LayoutMismatch(format!(
                "unexpected DLC for {}: {} (expected {})",
                msg.name, msg.size, EXPECTED_DLC
            )));
        }
        if msg.name != expected.name {
            return Err(EngineError::LayoutMismatch(format!(
                "unexpected name for frame {}: {:?} (expected {:?})",
                expected.id, msg.name, expected.name
            )));
        }
        if msg.is_extended {
            return Err(EngineError::LayoutMismatch(format!(
                "{} must use a standard 11-bit identifier",
                msg.name
            )));
        }

        let found: BTreeSet<&str> = msg.signals.iter().map(|s| s.name.as_str()).collect();
        let wanted: BTreeSet<&str> = expected.signals.iter().map(|s| s.name).collect();
        if found != wanted {
            return Err(EngineError::LayoutMismatch(format!(
                "unexpected signals for frame {} ({}): found {:?}, expected {:?}",
                expected.id, msg.name, found, wanted
            )));
        }

        for exp in expected.signals {
            let Some(sig) = msg.signal(exp.name) else {
                continue;
            };
            let mut diff = Vec::new();
            if sig.start_bit != exp.start {
                diff.push(format!("start {} != {}", sig.start_bit, exp.start));
            }
            if sig.length != exp.length {
                diff.push(format!("len {} != {}", sig.length, exp.length));
            }
            if sig.byte_order != ByteOrder::BigEndian {
                diff.push("byte_order little_endian != big_endian".to_string());
            }
            if sig.is_signed() != exp.signed {
                diff.push(format!("signed {} != {}", sig.is_signed(), exp.signed));
            }
            if !same_float(sig.factor, exp.factor) {
                diff.push(format!("scale {} != {}", sig.factor, exp.factor));
            }
            if !same_float(sig.offset, exp.offset) {
                diff.push(format!("offset {} != {}", sig.offset, exp.offset));
            }
            if !diff.is_empty() {
                return Err(EngineError::LayoutMismatch(format!(
                    "signal layout mismatch for {}.{}: {}",
                    msg.name,
                    sig.name,
                    diff.join(", ")
                )));
            }
        }
    }

    Ok(())
}

/// Upper-case hex SHA-256 of a byte buffer
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

/// Compare a DBC's fingerprint with the reference one
///
/// A mismatch is only a warning unless `enforce` is set; the layout gate is
/// what actually protects the broadcast.
pub fn verify_hash(bytes: &[u8], source: &str, enforce: bool) -> Result<()> {
    let digest = sha256_hex(bytes);
    if digest == REFERENCE_DBC_SHA256 {
        return Ok(());
    }
    let msg = format!(
        "DBC hash mismatch for {}: {} (expected {})",
        source, digest, REFERENCE_DBC_SHA256
    );
    if enforce {
        return Err(EngineError::LayoutMismatch(msg));
    }
    log::warn!("{}", msg);
    Ok(())
}

/// The embedded reference layout, parsed and validated
pub fn reference_database() -> Result<SignalDatabase> {
    let messages = dbc::parse_dbc_bytes(REFERENCE_DBC, "embedded")?;
    let db = SignalDatabase::from_messages(messages)?;
    assert_expected_layout(&db)?;
    Ok(db)
}

/// Load a DBC from disk and gate it against the expected layout
pub fn load_database(path: &Path, enforce_hash: bool) -> Result<SignalDatabase> {
    if !path.exists() {
        return Err(EngineError::DbcParseError(format!(
            "DBC file not found at {:?}",
            path
        )));
    }
    let bytes = std::fs::read(path)?;
    verify_hash(&bytes, &path.display().to_string(), enforce_hash)?;

    let messages = dbc::parse_dbc_file(path)?;
    let db = SignalDatabase::from_messages(messages)?;
    assert_expected_layout(&db)?;

    let stats = db.stats();
    log::info!(
        "DBC layout {} verified: {} messages, {} signals",
        LAYOUT_VERSION,
        stats.num_messages,
        stats.num_signals
    );
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::database::{MessageDefinition, ValueType};

    fn mutated(f: impl FnOnce(&mut Vec<MessageDefinition>)) -> Result<()> {
        let mut messages = dbc::parse_dbc_bytes(REFERENCE_DBC, "embedded").unwrap();
        f(&mut messages);
        let db = SignalDatabase::from_messages(messages)?;
        assert_expected_layout(&db)
    }

    #[test]
    fn test_reference_database_passes_gate() {
        let db = reference_database().unwrap();
        assert_eq!(db.stats().num_messages, 5);
        assert_eq!(db.stats().num_signals, SIGNAL_LIST.len());
        for name in SIGNAL_LIST {
            assert!(db.find_signal(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn test_reference_hash_matches() {
        assert_eq!(sha256_hex(REFERENCE_DBC), REFERENCE_DBC_SHA256);
        assert!(verify_hash(REFERENCE_DBC, "embedded", true).is_ok());
    }

    #[test]
    fn test_hash_mismatch_only_enforced_on_request() {
        assert!(verify_hash(b"BO_ 1 x: 8 MS", "other", false).is_ok());
        assert!(verify_hash(b"BO_ 1 x: 8 MS", "other", true).is_err());
    }

    #[test]
    fn test_wrong_start_bit_rejected() {
        let result = mutated(|msgs| {
            let rpm = msgs[0].signals.iter_mut().find(|s| s.name == "rpm").unwrap();
            rpm.start_bit = 31;
        });
        match result {
            Err(EngineError::LayoutMismatch(msg)) => assert!(msg.contains("megasquirt_dash0.rpm")),
            other => panic!("expected layout mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_sign_rejected() {
        let result = mutated(|msgs| {
            let map = msgs[0].signals.iter_mut().find(|s| s.name == "map").unwrap();
            map.value_type = ValueType::Unsigned;
        });
        assert!(matches!(result, Err(EngineError::LayoutMismatch(_))));
    }

    #[test]
    fn test_missing_message_rejected() {
        let result = mutated(|msgs| {
            msgs.pop();
        });
        assert!(matches!(result, Err(EngineError::LayoutMismatch(_))));
    }

    #[test]
    fn test_renamed_message_rejected() {
        let result = mutated(|msgs| msgs[1].name = "dash1".to_string());
        assert!(matches!(result, Err(EngineError::LayoutMismatch(_))));
    }

    #[test]
    fn test_wrong_dlc_rejected() {
        let result = mutated(|msgs| msgs[2].size = 6);
        assert!(matches!(result, Err(EngineError::LayoutMismatch(_))));
    }

    #[test]
    fn test_load_database_missing_file() {
        let result = load_database(Path::new("/nonexistent/dash.dbc"), false);
        assert!(matches!(result, Err(EngineError::DbcParseError(_))));
    }
}
