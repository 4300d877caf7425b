//! SLCAN (serial-line CAN) transport
//!
//! Talks the Lawicel ASCII protocol used by most USB-serial CAN dongles:
//!
//! ```text
//! t5E880000123400000000\r  standard frame: 3-hex ID, 1-hex DLC, data
//! T18FEF1002AABB\r         extended frame: 8-hex ID, 1-hex DLC, data
//! ```
//!
//! Commands are acknowledged with `\r` and rejected with a bell (`0x07`).

use super::{CanTransport, TransportError};
use crate::types::{CanFrame, MAX_DLC, MAX_EXTENDED_ID, MAX_STANDARD_ID};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default serial line speed
pub const DEFAULT_SERIAL_BAUD: u32 = 115_200;

/// Longest line kept while waiting for a terminator
const MAX_LINE: usize = 96;

/// Receive polls the port in slices of this length
const RECEIVE_SLICE: Duration = Duration::from_millis(10);

/// Wait for a command acknowledgement
const ACK_TIMEOUT: Duration = Duration::from_millis(50);

/// Drain window for commands that send no acknowledgement
const NO_ACK_TIMEOUT: Duration = Duration::from_millis(10);

const BELL: u8 = 0x07;

/// SLCAN `Sx` command for a nominal bitrate
pub fn bitrate_command(bitrate: u32) -> Option<&'static str> {
    match bitrate {
        10_000 => Some("S0"),
        20_000 => Some("S1"),
        50_000 => Some("S2"),
        100_000 => Some("S3"),
        125_000 => Some("S4"),
        250_000 => Some("S5"),
        500_000 => Some("S6"),
        800_000 => Some("S7"),
        1_000_000 => Some("S8"),
        _ => None,
    }
}

/// Bitrates with an `Sx` command, ascending
pub fn supported_bitrates() -> Vec<u32> {
    vec![
        10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
    ]
}

/// Render a frame as an SLCAN transmit command (without the `\r`)
pub fn format_frame(frame: &CanFrame) -> Result<String, TransportError> {
    let dlc = frame.data.len();
    if dlc > MAX_DLC {
        return Err(TransportError::Protocol(format!(
            "SLCAN payload too long: {}",
            dlc
        )));
    }

    let mut line = if frame.is_extended {
        if frame.can_id > MAX_EXTENDED_ID {
            return Err(TransportError::Protocol(format!(
                "SLCAN extended ID out of range: 0x{:X}",
                frame.can_id
            )));
        }
        format!("T{:08X}{:X}", frame.can_id, dlc)
    } else {
        if frame.can_id > MAX_STANDARD_ID {
            return Err(TransportError::Protocol(format!(
                "SLCAN standard ID out of range: 0x{:X}",
                frame.can_id
            )));
        }
        format!("t{:03X}{:X}", frame.can_id, dlc)
    };

    for byte in &frame.data {
        line.push_str(&format!("{:02X}", byte));
    }
    Ok(line)
}

fn parse_hex(bytes: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(bytes).ok()?;
    u32::from_str_radix(text, 16).ok()
}

/// Parse one received SLCAN line (terminator optional)
///
/// Returns `None` for anything that is not a well-formed data frame.
pub fn parse_frame(line: &[u8]) -> Option<CanFrame> {
    let line = line.trim_ascii();
    if line.contains(&BELL) {
        return None;
    }

    let (is_extended, id_len, max_id) = match line.first()? {
        b't' => (false, 3, MAX_STANDARD_ID),
        b'T' => (true, 8, MAX_EXTENDED_ID),
        _ => return None,
    };

    let dlc_at = 1 + id_len;
    if line.len() <= dlc_at {
        return None;
    }

    let can_id = parse_hex(&line[1..dlc_at])?;
    if can_id > max_id {
        return None;
    }

    let dlc = parse_hex(&line[dlc_at..dlc_at + 1])? as usize;
    if dlc > MAX_DLC {
        return None;
    }

    let data_at = dlc_at + 1;
    if line.len() < data_at + dlc * 2 {
        return None;
    }

    let data = line[data_at..data_at + dlc * 2]
        .chunks(2)
        .map(|pair| parse_hex(pair).map(|b| b as u8))
        .collect::<Option<Vec<u8>>>()?;

    Some(CanFrame::new(can_id, data, is_extended))
}

/// Pick a serial port for an SLCAN adapter
///
/// Prefers `/dev/ttyACM0`, then `/dev/ttyACM1`, then the first USB serial
/// port the system reports.
pub fn detect_port() -> Option<String> {
    for candidate in ["/dev/ttyACM0", "/dev/ttyACM1"] {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
    }

    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .find(|p| matches!(p.port_type, SerialPortType::UsbPort(_)))
            .map(|p| p.port_name),
        Err(e) => {
            log::debug!("Serial port enumeration failed: {}", e);
            None
        }
    }
}

struct SlcanLink {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SlcanLink {
    /// Read until `\r` or timeout; returns whatever arrived
    fn read_response(&mut self, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut response = Vec::new();
        let mut byte = [0u8; 1];

        while response.len() < 32 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if self.port.set_timeout(remaining).is_err() {
                break;
            }
            match self.port.read(&mut byte) {
                Ok(1) => {
                    response.push(byte[0]);
                    if byte[0] == b'\r' || byte[0] == BELL {
                        break;
                    }
                }
                Ok(_) => break,
                Err(_) => break,
            }
        }
        response
    }

    fn write_command(&mut self, command: &str, expect_ack: bool) -> Result<(), TransportError> {
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(b"\r")?;
        self.port.flush()?;

        let timeout = if expect_ack { ACK_TIMEOUT } else { NO_ACK_TIMEOUT };
        let response = self.read_response(timeout);
        if response.contains(&BELL) {
            return Err(TransportError::Protocol(format!(
                "SLCAN error response to {}",
                command
            )));
        }
        Ok(())
    }

    /// Close, set the bitrate (if any), then open the channel
    fn handshake(&mut self, bitrate_cmd: Option<&str>) -> Result<(), TransportError> {
        self.write_command("C", false)?;
        if let Some(cmd) = bitrate_cmd {
            self.write_command(cmd, true)?;
        }
        self.write_command("O", true)
    }

    /// Take one complete line from the buffer, if any
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\r' || b == BELL)?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Pull whatever arrives within `slice` into the buffer
    fn fill(&mut self, slice: Duration) -> std::io::Result<()> {
        self.port.set_timeout(slice)?;
        let mut buf = [0u8; 64];
        match self.port.read(&mut buf) {
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                if self.pending.len() > MAX_LINE * 4 && !self.pending.contains(&b'\r') {
                    self.pending.clear();
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// SLCAN adapter on a serial port
///
/// All port I/O goes through one mutex so a frame being written is never
/// interleaved with a read. Receivers hold the lock only for short slices.
pub struct SlcanTransport {
    port_name: String,
    serial_baud: u32,
    bitrate: u32,
    skip_bitrate: bool,
    link: Mutex<Option<SlcanLink>>,
    tx_errors: AtomicU64,
}

impl SlcanTransport {
    pub fn new(port_name: impl Into<String>, serial_baud: u32, bitrate: u32, skip_bitrate: bool) -> Self {
        Self {
            port_name: port_name.into(),
            serial_baud,
            bitrate,
            skip_bitrate,
            link: Mutex::new(None),
            tx_errors: AtomicU64::new(0),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn lock(&self) -> MutexGuard<'_, Option<SlcanLink>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count_error(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl CanTransport for SlcanTransport {
    fn open(&self) -> Result<(), TransportError> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }

        let bitrate_cmd = bitrate_command(self.bitrate);
        if bitrate_cmd.is_none() {
            if self.skip_bitrate {
                log::warn!(
                    "Unsupported SLCAN bitrate {}; skipping bitrate setup",
                    self.bitrate
                );
            } else {
                return Err(TransportError::Unavailable(format!(
                    "unsupported SLCAN bitrate {} (supported: {:?})",
                    self.bitrate,
                    supported_bitrates()
                )));
            }
        }

        let port = serialport::new(&self.port_name, self.serial_baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                TransportError::Unavailable(format!(
                    "failed to open SLCAN port {}: {}",
                    self.port_name, e
                ))
            })?;

        let mut link = SlcanLink {
            port,
            pending: Vec::with_capacity(MAX_LINE),
        };
        if let Err(e) = link.port.clear(ClearBuffer::All) {
            log::debug!("Could not clear SLCAN buffers on {}: {}", self.port_name, e);
        }

        if let Err(e) = link.handshake(bitrate_cmd) {
            return Err(TransportError::Unavailable(format!(
                "SLCAN handshake failed on {}: {}",
                self.port_name, e
            )));
        }

        log::info!(
            "SLCAN channel open on {} (serial {} baud, bitrate {})",
            self.port_name,
            self.serial_baud,
            self.bitrate
        );
        self.tx_errors.store(0, Ordering::Relaxed);
        *guard = Some(link);
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> bool {
        let line = match format_frame(frame) {
            Ok(line) => line,
            Err(e) => {
                self.count_error();
                log::warn!("SLCAN send rejected (id=0x{:X}): {}", frame.can_id, e);
                return false;
            }
        };

        let mut guard = self.lock();
        let Some(link) = guard.as_mut() else {
            self.count_error();
            return false;
        };

        let result = link
            .port
            .write_all(line.as_bytes())
            .and_then(|_| link.port.write_all(b"\r"))
            .and_then(|_| link.port.flush());

        match result {
            Ok(()) => true,
            Err(e) => {
                self.count_error();
                log::warn!(
                    "SLCAN send failed (port={} id=0x{:X}): {}",
                    self.port_name,
                    frame.can_id,
                    e
                );
                false
            }
        }
    }

    fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut guard = self.lock();
                let link = guard.as_mut()?;

                while let Some(line) = link.take_line() {
                    if line.contains(&BELL) {
                        log::warn!("SLCAN error response while receiving");
                        continue;
                    }
                    if let Some(frame) = parse_frame(&line) {
                        return Some(frame);
                    }
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }
                if let Err(e) = link.fill(remaining.min(RECEIVE_SLICE)) {
                    log::warn!("SLCAN receive failed on {}: {}", self.port_name, e);
                    return None;
                }
            }
            // Let a waiting sender take the lock between slices
            std::thread::yield_now();
        }
    }

    fn close(&self) {
        let mut guard = self.lock();
        if let Some(mut link) = guard.take() {
            if let Err(e) = link.write_command("C", false) {
                log::debug!("SLCAN close command failed on {}: {}", self.port_name, e);
            }
            log::info!("SLCAN channel closed on {}", self.port_name);
        }
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn state(&self) -> Option<String> {
        self.is_open().then(|| "SLCAN".to_string())
    }

    fn tx_errors(&self) -> u64 {
        self.tx_errors.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        format!("slcan:{}@{}", self.port_name, self.serial_baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_standard_frame() {
        let frame = CanFrame::new(0x5E8, vec![0x00, 0x00, 0x12, 0x34, 0x00, 0x00, 0x00, 0x00], false);
        assert_eq!(format_frame(&frame).unwrap(), "t5E880000123400000000");
    }

    #[test]
    fn test_format_extended_frame() {
        let frame = CanFrame::new(0x18FEF100, vec![0xAA, 0xBB], true);
        assert_eq!(format_frame(&frame).unwrap(), "T18FEF1002AABB");
    }

    #[test]
    fn test_format_empty_payload() {
        let frame = CanFrame::new(0x001, Vec::new(), false);
        assert_eq!(format_frame(&frame).unwrap(), "t0010");
    }

    #[test]
    fn test_format_rejects_out_of_range() {
        assert!(format_frame(&CanFrame::new(0x800, vec![], false)).is_err());
        assert!(format_frame(&CanFrame::new(0x2000_0000, vec![], true)).is_err());
        assert!(format_frame(&CanFrame::new(0x100, vec![0; 9], false)).is_err());
    }

    #[test]
    fn test_parse_standard_frame() {
        let frame = parse_frame(b"t5E880000123400000000\r").unwrap();
        assert_eq!(frame.can_id, 0x5E8);
        assert!(!frame.is_extended);
        assert_eq!(frame.data, vec![0x00, 0x00, 0x12, 0x34, 0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_extended_frame() {
        let frame = parse_frame(b"T18FEF1002aabb").unwrap();
        assert_eq!(frame.can_id, 0x18FEF100);
        assert!(frame.is_extended);
        assert_eq!(frame.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_ignores_trailing_timestamp() {
        let frame = parse_frame(b"t1232ABCD1F2E").unwrap();
        assert_eq!(frame.data, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_frame(b"").is_none());
        assert!(parse_frame(b"\x07").is_none());
        assert!(parse_frame(b"z").is_none());
        assert!(parse_frame(b"t12").is_none());
        assert!(parse_frame(b"t1239").is_none());
        assert!(parse_frame(b"t1232AB").is_none());
        assert!(parse_frame(b"t12G1AA").is_none());
        assert!(parse_frame(b"t1231ZZ").is_none());
        assert!(parse_frame(b"T3FFFFFFF0").is_none());
    }

    #[test]
    fn test_format_parse_inverse() {
        let frames = [
            CanFrame::new(0x7FF, vec![1, 2, 3], false),
            CanFrame::new(0x1FFF_FFFF, vec![0xFF; 8], true),
            CanFrame::new(0x0, vec![], false),
        ];
        for frame in frames {
            let line = format_frame(&frame).unwrap();
            assert_eq!(parse_frame(line.as_bytes()), Some(frame));
        }
    }

    #[test]
    fn test_bitrate_map() {
        assert_eq!(bitrate_command(10_000), Some("S0"));
        assert_eq!(bitrate_command(500_000), Some("S6"));
        assert_eq!(bitrate_command(1_000_000), Some("S8"));
        assert_eq!(bitrate_command(83_333), None);
        assert_eq!(supported_bitrates().len(), 9);
        for rate in supported_bitrates() {
            assert!(bitrate_command(rate).is_some());
        }
    }

    #[test]
    fn test_unsupported_bitrate_fails_before_port_access() {
        let transport = SlcanTransport::new("/dev/does-not-exist", DEFAULT_SERIAL_BAUD, 33_333, false);
        assert!(matches!(transport.open(), Err(TransportError::Unavailable(_))));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_send_when_closed_counts_error() {
        let transport = SlcanTransport::new("/dev/does-not-exist", DEFAULT_SERIAL_BAUD, 500_000, false);
        assert!(!transport.send(&CanFrame::new(0x5E8, vec![0; 8], false)));
        assert_eq!(transport.tx_errors(), 1);
        assert!(transport.receive(Duration::from_millis(1)).is_none());
        assert_eq!(transport.state(), None);
        transport.close();
    }
}
