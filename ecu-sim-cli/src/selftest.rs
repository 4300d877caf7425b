//! Offline self-test (`--selftest`)
//!
//! Exercises the engine without any hardware: layout gate, byte order,
//! clamping, scheduling and the virtual bus.

use anyhow::{ensure, Context, Result};
use ecu_sim_core::scheduler::{Clock, FixedRateScheduler, ManualClock};
use ecu_sim_core::{
    reference_database, CanFrame, CanTransport, FrameBuilder, SignalCodec, SignalDatabase,
    SignalValues, VirtualBus,
};
use std::sync::Arc;
use std::time::Duration;

fn check_layout() -> Result<SignalDatabase> {
    let db = reference_database().context("reference layout")?;
    let stats = db.stats();
    log::info!(
        "SELFTEST layout ok: {} messages, {} signals",
        stats.num_messages,
        stats.num_signals
    );
    Ok(db)
}

fn check_endianness(db: &SignalDatabase, codec: &mut SignalCodec) -> Result<()> {
    let message = db
        .get_message_by_name("megasquirt_dash0")
        .context("megasquirt_dash0 missing")?;
    let mut desired = SignalValues::new();
    desired.insert("rpm".to_string(), f64::from(0x1234));
    let encoded = codec.encode_message(message, &desired)?;
    ensure!(
        encoded.payload == [0x00, 0x00, 0x12, 0x34, 0x00, 0x00, 0x00, 0x00],
        "rpm 0x1234 encoded as {:02X?}",
        encoded.payload
    );
    log::info!("SELFTEST endianness ok");
    Ok(())
}

fn check_clamp(db: &SignalDatabase, codec: &mut SignalCodec) -> Result<()> {
    let mut desired = SignalValues::new();
    desired.insert("map".to_string(), 9999.0);
    let built = FrameBuilder::new(db).build(codec, &desired)?;
    let used = built.used.get("map").copied().unwrap_or_default();
    ensure!((used - 3276.7).abs() < 1e-6, "map 9999 sent as {}", used);
    let record = built
        .clamped_by_signal()
        .get("map")
        .copied()
        .context("map clamp not recorded")?;
    ensure!(record.requested == 9999.0, "clamp record {:?}", record);
    log::info!("SELFTEST clamp ok: map 9999 -> {:.1}", used);
    Ok(())
}

fn check_scheduler() -> Result<()> {
    let clock = ManualClock::new();
    let mut scheduler = FixedRateScheduler::with_clock(50.0, Arc::new(clock.clone()))?;
    scheduler.start();
    for _ in 0..3 {
        scheduler.wait_next();
    }
    ensure!(
        clock.elapsed() == Duration::from_millis(60),
        "3 ticks at 50 Hz took {:?}",
        clock.elapsed()
    );

    // A stall is followed by exactly one period, not a burst
    clock.advance(Duration::from_millis(100));
    let before = clock.now();
    scheduler.wait_next();
    scheduler.wait_next();
    ensure!(
        clock.now() - before == Duration::from_millis(20),
        "late tick was caught up"
    );
    log::info!("SELFTEST scheduler ok");
    Ok(())
}

fn check_virtual_bus() -> Result<()> {
    let bus = VirtualBus::new();
    let tx = bus.attach("selftest");
    let rx = bus.attach("selftest");
    tx.open()?;
    rx.open()?;
    let frame = CanFrame::new(0x5E8, vec![0, 0, 0x12, 0x34, 0, 0, 0, 0], false);
    ensure!(tx.send(&frame), "virtual send failed");
    let received = rx
        .receive(Duration::from_millis(100))
        .context("virtual frame not received")?;
    ensure!(received == frame, "virtual loopback mangled {}", received);
    tx.close();
    rx.close();
    log::info!("SELFTEST virtual bus ok");
    Ok(())
}

/// Run every check; the first failure aborts
pub fn run() -> Result<()> {
    let mut codec = SignalCodec::new();
    let db = check_layout()?;
    check_endianness(&db, &mut codec)?;
    check_clamp(&db, &mut codec)?;
    check_scheduler()?;
    check_virtual_bus()?;
    ensure!(
        codec.encode_error_count() == 0,
        "{} encode errors during self-test",
        codec.encode_error_count()
    );
    log::info!("SELFTEST passed");
    Ok(())
}
