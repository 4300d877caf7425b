// End-to-end broadcast runs on the in-process virtual bus
use ecu_sim_core::custom::parse_custom_frames_str;
use ecu_sim_core::events::read_events;
use ecu_sim_core::telemetry::read_snapshot;
use ecu_sim_core::{
    reference_database, CanTransport, ControlReader, CustomScheduler, EventLog, Listener,
    ListenerConfig, Mode, RecoveryPolicy, SessionConfig, StopSignal, TelemetryWriter,
    TransmissionSession, TxLog, VirtualBus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn monitor(bus: &VirtualBus, stop: &StopSignal, config: ListenerConfig) -> Listener {
    let rx: Arc<dyn CanTransport> = Arc::new(bus.attach("sim"));
    rx.open().unwrap();
    Listener::spawn(rx, Some(Arc::new(reference_database().unwrap())), config, stop.clone())
        .unwrap()
}

#[test]
fn test_broadcast_reaches_listener() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let telemetry = dir.path().join("telemetry.json");
    let events = dir.path().join("can_monitor.jsonl");
    let tx_log = dir.path().join("tx.csv");
    let rx_log = dir.path().join("rx.csv");

    let bus = VirtualBus::new();
    let stop = StopSignal::new();
    let listener = monitor(
        &bus,
        &stop,
        ListenerConfig {
            rx_log: Some(rx_log.clone()),
            decode: true,
        },
    );

    let config = SessionConfig {
        hz: 50.0,
        mode: Mode::Idle,
        duration: Some(Duration::from_millis(500)),
        interface: "virtual:sim".to_string(),
        ..Default::default()
    };
    let mut session = TransmissionSession::new(
        config,
        Arc::new(reference_database().unwrap()),
        Arc::new(bus.attach("sim")),
        stop.clone(),
    )
    .unwrap()
    .with_listener(listener)
    .with_telemetry(TelemetryWriter::new(&telemetry, 5.0))
    .with_events(EventLog::new(&events))
    .with_tx_log(TxLog::open(&tx_log).unwrap());

    let summary = session.run().unwrap();
    assert_eq!(summary.mode, Mode::Idle);
    assert!(summary.tx_frames >= 5);
    assert_eq!(summary.tx_frames % 5, 0);
    assert_eq!(summary.tx_errors, 0);
    assert!(summary.rx_frames > 0);
    assert!(summary.rx_frames <= summary.tx_frames);
    assert!(stop.is_set());

    let snapshot = read_snapshot(&telemetry).unwrap();
    assert_eq!(snapshot.interface, "virtual:sim");
    assert_eq!(snapshot.mode, Mode::Idle);
    assert!(snapshot.signals["rpm"] > 800.0);
    assert!(snapshot.signal_meta.contains_key("launch_timing"));

    let kinds: Vec<&str> = read_events(&events)
        .unwrap()
        .iter()
        .map(|r| r.event.kind())
        .collect();
    assert_eq!(kinds.first(), Some(&"start"));
    assert_eq!(kinds.last(), Some(&"stop"));
    assert!(kinds.contains(&"tx_ok"));
    assert!(!kinds.contains(&"tx_fail"));

    let tx_lines = std::fs::read_to_string(&tx_log).unwrap().lines().count() as u64;
    assert_eq!(tx_lines, summary.tx_frames + 1);
    let rx_text = std::fs::read_to_string(&rx_log).unwrap();
    assert!(rx_text.contains("0x5e8"));
    assert!(rx_text.contains("launch_timing"));
}

#[test]
fn test_dead_bus_recovers() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let events = dir.path().join("can_monitor.jsonl");

    let bus = VirtualBus::new();
    let tx = Arc::new(bus.attach("sim"));
    tx.open().unwrap();
    bus.set_offline("sim", true);

    let revive = {
        let bus = bus.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            bus.set_offline("sim", false);
        })
    };

    let config = SessionConfig {
        hz: 200.0,
        duration: Some(Duration::from_millis(800)),
        recovery: RecoveryPolicy {
            failure_threshold: 10,
            backoff_floor: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut session = TransmissionSession::new(
        config,
        Arc::new(reference_database().unwrap()),
        tx,
        StopSignal::new(),
    )
    .unwrap()
    .with_events(EventLog::new(&events));

    let summary = session.run().unwrap();
    revive.join().unwrap();

    assert!(summary.reopens >= 1);
    assert!(summary.tx_frames > 0);
    assert!(summary.tx_errors >= 10);

    let records = read_events(&events).unwrap();
    let count = |kind: &str| records.iter().filter(|r| r.event.kind() == kind).count();
    assert!(count("reopen_begin") >= 1);
    assert!(count("reopen_fail") >= 1);
    assert!(count("reopen_ok") >= 1);
    assert!(count("tx_fail") >= 10);
    assert!(count("bus_state") >= 1);
}

#[test]
fn test_custom_schedule_replaces_dash_frames() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let control = dir.path().join("control.json");
    std::fs::write(&control, r#"{"mode": "custom"}"#).unwrap();

    let bus = VirtualBus::new();
    let stop = StopSignal::new();
    let sniffer = bus.attach("sim");
    sniffer.open().unwrap();

    let tx: Arc<dyn CanTransport> = Arc::new(bus.attach("sim"));
    tx.open().unwrap();
    let frames =
        parse_custom_frames_str(r#"[{"id": "0x100", "data": "DEADBEEF", "period_ms": 20}]"#)
            .unwrap();
    let custom = CustomScheduler::spawn(Arc::clone(&tx), frames, stop.clone()).unwrap();

    let config = SessionConfig {
        mode: Mode::Custom,
        duration: Some(Duration::from_millis(300)),
        ..Default::default()
    };
    let mut session =
        TransmissionSession::new(config, Arc::new(reference_database().unwrap()), tx, stop)
            .unwrap()
            .with_control(ControlReader::new(&control))
            .with_custom_scheduler(custom);

    let summary = session.run().unwrap();
    assert!(summary.tx_frames >= 5);

    let mut seen = Vec::new();
    while let Some(frame) = sniffer.receive(Duration::from_millis(10)) {
        seen.push(frame);
    }
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|f| f.can_id == 0x100));
    assert_eq!(seen[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn test_stop_flag_file_ends_run() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let flag = dir.path().join("stop.flag");
    let bus = VirtualBus::new();
    let stop = StopSignal::with_file(&flag);

    let requester = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            stop.request_via_file();
        })
    };

    let mut session = TransmissionSession::new(
        SessionConfig::default(),
        Arc::new(reference_database().unwrap()),
        Arc::new(bus.attach("sim")),
        stop,
    )
    .unwrap();
    let summary = session.run().unwrap();
    requester.join().unwrap();

    assert!(flag.exists());
    assert!(summary.ticks >= 1);
    assert!(summary.elapsed < Duration::from_secs(5));
}
