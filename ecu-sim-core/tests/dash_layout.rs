// Dash layout and codec behaviour through the public API
use ecu_sim_core::codec::SignalCodec;
use ecu_sim_core::scenario::{scenario_values, Mode};
use ecu_sim_core::signals::layout::REFERENCE_DBC;
use ecu_sim_core::{load_database, EngineError, FrameBuilder, SignalValues};
use std::path::PathBuf;
use tempfile::TempDir;

fn asset_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets/megasquirt_dash.dbc")
}

#[test]
fn test_shipped_dbc_loads_with_hash_enforced() {
    let db = load_database(&asset_path(), true).unwrap();
    assert_eq!(db.get_all_can_ids(), vec![1512, 1513, 1514, 1515, 1516]);
}

#[test]
fn test_edited_dbc_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dash.dbc");

    // A unit edit changes the hash but not the layout
    let text = String::from_utf8(REFERENCE_DBC.to_vec())
        .unwrap()
        .replacen("\"RPM\"", "\"rpm\"", 1);
    assert_ne!(text.as_bytes(), REFERENCE_DBC);
    std::fs::write(&path, &text).unwrap();
    assert!(load_database(&path, false).is_ok());
    assert!(matches!(
        load_database(&path, true),
        Err(EngineError::LayoutMismatch(_))
    ));

    // Moving rpm by one bit breaks the layout gate
    let moved = String::from_utf8(REFERENCE_DBC.to_vec())
        .unwrap()
        .replacen("SG_ rpm : 23|16@0+", "SG_ rpm : 22|16@0+", 1);
    assert_ne!(moved.as_bytes(), REFERENCE_DBC);
    std::fs::write(&path, &moved).unwrap();
    assert!(load_database(&path, false).is_err());
}

#[test]
fn test_every_scenario_encodes_cleanly() {
    let db = load_database(&asset_path(), false).unwrap();
    let builder = FrameBuilder::new(&db);
    let mut codec = SignalCodec::new();

    for mode in [Mode::Koeo, Mode::Idle, Mode::Pull, Mode::Loop] {
        for step in 0..30 {
            let t = step as f64 * 0.5;
            let built = builder.build(&mut codec, &scenario_values(mode, t)).unwrap();
            assert_eq!(built.payloads.len(), 5);
            assert!(built.payloads.iter().all(|(_, _, data)| data.len() == 8));
        }
    }
    assert_eq!(codec.encode_error_count(), 0);
}

#[test]
fn test_out_of_range_map_clamped_and_recorded() {
    let db = load_database(&asset_path(), false).unwrap();
    let mut codec = SignalCodec::new();
    let mut desired = SignalValues::new();
    desired.insert("map".to_string(), 9999.0);

    let built = FrameBuilder::new(&db).build(&mut codec, &desired).unwrap();
    assert_eq!(&built.payload("megasquirt_dash0").unwrap()[0..2], &[0x7F, 0xFF]);
    assert!((built.used["map"] - 3276.7).abs() < 1e-6);

    let record = built.clamped_by_signal()["map"];
    assert_eq!(record.requested, 9999.0);
    assert!((record.sent - 3276.7).abs() < 1e-6);
    assert_eq!(codec.clamp_count("map"), 1);
}

#[test]
fn test_built_frames_decode_back() {
    let db = load_database(&asset_path(), false).unwrap();
    let mut codec = SignalCodec::new();
    let desired = scenario_values(Mode::Pull, 2.5);
    let built = FrameBuilder::new(&db).build(&mut codec, &desired).unwrap();

    for frame in built.frames() {
        let message = db.get_message(frame.can_id).unwrap();
        let decoded = SignalCodec::decode_message(message, &frame.data);
        for (name, value) in decoded {
            let signal = message.signal(&name).unwrap();
            let step = signal.factor.abs();
            assert!(
                (value - built.used[&name]).abs() <= step * 0.5 + 1e-9,
                "{}: {} vs {}",
                name,
                value,
                built.used[&name]
            );
        }
    }
}
