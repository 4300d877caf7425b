//! Native SocketCAN transport (Linux only)
//!
//! On other platforms the type still exists so configuration and factory code
//! stay portable, but `open` always reports the link as unavailable.

use super::{CanTransport, TransportError};
use crate::types::CanFrame;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(target_os = "linux")]
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId};
#[cfg(target_os = "linux")]
use std::sync::{Arc, RwLock};

/// A kernel CAN interface such as `can0` or `vcan0`
pub struct NativeTransport {
    iface: String,
    #[cfg(target_os = "linux")]
    socket: RwLock<Option<Arc<CanSocket>>>,
    tx_errors: AtomicU64,
}

impl NativeTransport {
    pub fn new(iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            #[cfg(target_os = "linux")]
            socket: RwLock::new(None),
            tx_errors: AtomicU64::new(0),
        }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    fn sysfs_dir(&self) -> PathBuf {
        PathBuf::from("/sys/class/net").join(&self.iface)
    }

    /// Map the kernel operstate to a bus state label
    fn operstate(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.sysfs_dir().join("operstate")).ok()?;
        Some(operstate_label(raw.trim()))
    }

    #[cfg(target_os = "linux")]
    fn current(&self) -> Option<Arc<CanSocket>> {
        self.socket
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn operstate_label(operstate: &str) -> String {
    match operstate {
        "up" | "unknown" => "ERROR_ACTIVE".to_string(),
        "down" | "lowerlayerdown" => "BUS_OFF".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

#[cfg(target_os = "linux")]
fn to_socket_frame(frame: &CanFrame) -> Option<socketcan::CanFrame> {
    let id = if frame.is_extended {
        Id::Extended(ExtendedId::new(frame.can_id)?)
    } else {
        Id::Standard(StandardId::new(u16::try_from(frame.can_id).ok()?)?)
    };
    socketcan::CanFrame::new(id, &frame.data)
}

#[cfg(target_os = "linux")]
fn from_socket_frame(frame: &socketcan::CanFrame) -> CanFrame {
    CanFrame {
        can_id: Frame::raw_id(frame),
        data: EmbeddedFrame::data(frame).to_vec(),
        is_extended: EmbeddedFrame::is_extended(frame),
        is_error_frame: matches!(frame, socketcan::CanFrame::Error(_)),
        is_remote_frame: matches!(frame, socketcan::CanFrame::Remote(_)),
    }
}

#[cfg(target_os = "linux")]
fn run_ip_link(iface: &str, updown: &str) -> Result<(), TransportError> {
    let status = std::process::Command::new("ip")
        .args(["link", "set", iface, updown])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(TransportError::Protocol(format!(
            "`ip link set {} {}` exited with {}",
            iface, updown, status
        )))
    }
}

impl CanTransport for NativeTransport {
    #[cfg(target_os = "linux")]
    fn open(&self) -> Result<(), TransportError> {
        let mut slot = self
            .socket
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        if !self.sysfs_dir().exists() {
            return Err(TransportError::Unavailable(format!(
                "CAN interface {} does not exist",
                self.iface
            )));
        }
        let socket = CanSocket::open(&self.iface).map_err(|e| {
            TransportError::Unavailable(format!("failed to open {}: {}", self.iface, e))
        })?;
        log::info!("SocketCAN interface {} open", self.iface);
        self.tx_errors.store(0, Ordering::Relaxed);
        *slot = Some(Arc::new(socket));
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn open(&self) -> Result<(), TransportError> {
        Err(TransportError::Unavailable(format!(
            "native CAN interface {} requires Linux SocketCAN",
            self.iface
        )))
    }

    #[cfg(target_os = "linux")]
    fn send(&self, frame: &CanFrame) -> bool {
        let Some(socket) = self.current() else {
            self.tx_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let Some(out) = to_socket_frame(frame) else {
            self.tx_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("Invalid CAN frame for {}: {}", self.iface, frame);
            return false;
        };
        match socket.write_frame(&out) {
            Ok(()) => true,
            Err(e) => {
                self.tx_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "CAN send failed (iface={} id=0x{:X}): {}",
                    self.iface,
                    frame.can_id,
                    e
                );
                false
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn send(&self, _frame: &CanFrame) -> bool {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
        false
    }

    #[cfg(target_os = "linux")]
    fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        let socket = self.current()?;
        match socket.read_frame_timeout(timeout) {
            Ok(frame) => Some(from_socket_frame(&frame)),
            Err(e) => {
                if !matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) {
                    log::warn!("CAN receive failed (iface={}): {}", self.iface, e);
                }
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        std::thread::sleep(timeout);
        None
    }

    fn close(&self) {
        #[cfg(target_os = "linux")]
        {
            let mut slot = self
                .socket
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.take().is_some() {
                log::info!("SocketCAN interface {} closed", self.iface);
            }
        }
    }

    fn is_open(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.current().is_some()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    fn state(&self) -> Option<String> {
        if !self.is_open() {
            return None;
        }
        self.operstate()
    }

    fn tx_errors(&self) -> u64 {
        self.tx_errors.load(Ordering::Relaxed)
    }

    #[cfg(target_os = "linux")]
    fn hard_reset(&self) -> Result<(), TransportError> {
        log::warn!("Cycling CAN interface {} (down/up)", self.iface);
        run_ip_link(&self.iface, "down")?;
        run_ip_link(&self.iface, "up")
    }

    fn describe(&self) -> String {
        format!("native:{}", self.iface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operstate_labels() {
        assert_eq!(operstate_label("up"), "ERROR_ACTIVE");
        assert_eq!(operstate_label("unknown"), "ERROR_ACTIVE");
        assert_eq!(operstate_label("down"), "BUS_OFF");
        assert_eq!(operstate_label("dormant"), "DORMANT");
    }

    #[test]
    fn test_missing_interface_unavailable() {
        let transport = NativeTransport::new("nosuchcan42");
        assert!(matches!(transport.open(), Err(TransportError::Unavailable(_))));
        assert!(!transport.is_open());
        assert!(!transport.send(&CanFrame::new(0x5E8, vec![0; 8], false)));
        assert_eq!(transport.tx_errors(), 1);
        assert_eq!(transport.state(), None);
        transport.close();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_frame_conversion() {
        let frame = CanFrame::new(0x5E8, vec![0, 0, 0x12, 0x34], false);
        let socket_frame = to_socket_frame(&frame).unwrap();
        assert_eq!(from_socket_frame(&socket_frame), frame);

        let ext = CanFrame::new(0x18FEF100, vec![0xFF], true);
        assert_eq!(from_socket_frame(&to_socket_frame(&ext).unwrap()), ext);

        assert!(to_socket_frame(&CanFrame::new(0x800, vec![], false)).is_none());
        assert!(to_socket_frame(&CanFrame::new(0x100, vec![0; 9], false)).is_none());
    }
}
