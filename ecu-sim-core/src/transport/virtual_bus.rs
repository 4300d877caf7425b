//! In-process virtual CAN bus
//!
//! A [`VirtualBus`] is a hub of named channels. Every open handle on a channel
//! receives every frame sent on that channel, including its own.
//!
//! Each handle buffers at most [`RX_QUEUE_DEPTH`] frames. A handle that never
//! reads (a sender nobody drains) loses the overflow instead of growing.

use super::{CanTransport, TransportError};
use crate::types::CanFrame;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Frames buffered per handle before new ones are dropped
pub const RX_QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
struct HubState {
    next_handle: u64,
    channels: HashMap<String, Vec<(u64, SyncSender<CanFrame>)>>,
    offline: HashSet<String>,
}

/// Hub shared by all virtual transports of one process (or test)
#[derive(Clone, Default)]
pub struct VirtualBus {
    state: Arc<Mutex<HubState>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a (closed) transport on a channel
    pub fn attach(&self, channel: &str) -> VirtualTransport {
        let id = {
            let mut state = self.lock();
            state.next_handle += 1;
            state.next_handle
        };
        VirtualTransport {
            hub: self.clone(),
            channel: channel.to_string(),
            id,
            rx: Mutex::new(None),
            open: AtomicBool::new(false),
            tx_errors: AtomicU64::new(0),
        }
    }

    /// Number of open handles on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, |subs| subs.len())
    }

    /// Simulate a dead bus: sends and opens on the channel fail until cleared
    pub fn set_offline(&self, channel: &str, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert(channel.to_string());
        } else {
            state.offline.remove(channel);
        }
    }

    fn is_offline(&self, channel: &str) -> bool {
        self.lock().offline.contains(channel)
    }

    fn subscribe(&self, channel: &str, id: u64, tx: SyncSender<CanFrame>) {
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
    }

    fn unsubscribe(&self, channel: &str, id: u64) {
        let mut state = self.lock();
        if let Some(subs) = state.channels.get_mut(channel) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                state.channels.remove(channel);
            }
        }
    }

    fn broadcast(&self, channel: &str, frame: &CanFrame) -> bool {
        let mut state = self.lock();
        if state.offline.contains(channel) {
            return false;
        }
        if let Some(subs) = state.channels.get_mut(channel) {
            subs.retain(|(_, tx)| match tx.try_send(frame.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
        true
    }
}

/// One handle on a [`VirtualBus`] channel
pub struct VirtualTransport {
    hub: VirtualBus,
    channel: String,
    id: u64,
    rx: Mutex<Option<Receiver<CanFrame>>>,
    open: AtomicBool,
    tx_errors: AtomicU64,
}

impl VirtualTransport {
    fn rx(&self) -> MutexGuard<'_, Option<Receiver<CanFrame>>> {
        self.rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl CanTransport for VirtualTransport {
    fn open(&self) -> Result<(), TransportError> {
        let mut rx = self.rx();
        if rx.is_some() {
            return Ok(());
        }
        if self.hub.is_offline(&self.channel) {
            return Err(TransportError::Unavailable(format!(
                "virtual channel {} is offline",
                self.channel
            )));
        }
        let (tx, new_rx) = mpsc::sync_channel(RX_QUEUE_DEPTH);
        self.hub.subscribe(&self.channel, self.id, tx);
        *rx = Some(new_rx);
        self.open.store(true, Ordering::Release);
        self.tx_errors.store(0, Ordering::Relaxed);
        log::debug!("Virtual handle {} joined channel {}", self.id, self.channel);
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> bool {
        if !self.is_open() || !self.hub.broadcast(&self.channel, frame) {
            self.tx_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        let rx = self.rx();
        let receiver = rx.as_ref()?;
        match receiver.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn close(&self) {
        let mut rx = self.rx();
        if rx.take().is_some() {
            self.open.store(false, Ordering::Release);
            self.hub.unsubscribe(&self.channel, self.id);
            log::debug!("Virtual handle {} left channel {}", self.id, self.channel);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn state(&self) -> Option<String> {
        if !self.is_open() {
            return None;
        }
        if self.hub.is_offline(&self.channel) {
            Some("BUS_OFF".to_string())
        } else {
            Some("ERROR_ACTIVE".to_string())
        }
    }

    fn tx_errors(&self) -> u64 {
        self.tx_errors.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        format!("virtual:{}", self.channel)
    }
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        self.close();
    }
}
