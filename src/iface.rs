pub mod hdlc;

use core::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hash::{Sha256Hash, TruncatedHash};
use crate::packet::MTU;

/// Interfaces are addressed internally by a truncated hash, like every other
/// entity. The id is derived from a registration counter and never leaves
/// the process.
pub type IfaceId = TruncatedHash;

/// Hints an interface publishes about itself. The engine only transmits on
/// `tx` interfaces and only expects frames from `rx` interfaces; `bitrate`
/// is informational (bits per second).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct IfaceInfo {
    pub rx: bool,
    pub tx: bool,
    pub mtu: usize,
    pub bitrate: u64,
}

impl Default for IfaceInfo {
    fn default() -> Self {
        Self { rx: true, tx: true, mtu: MTU, bitrate: 1_000_000 }
    }
}

/// One HDLC frame received by an interface, tagged with its origin.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub iface: IfaceId,
    pub frame: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TxTarget {
    /// Every transmit-capable interface, optionally excluding the one a
    /// packet arrived on.
    Broadcast { except: Option<IfaceId> },
    Direct(IfaceId),
}

/// The engine half of a registered interface: where to push received frames
/// and where framed outbound bytes arrive.
pub struct IfacePort {
    pub id: IfaceId,
    pub info: IfaceInfo,
    pub rx_sender: mpsc::Sender<RxFrame>,
    pub tx_receiver: mpsc::Receiver<Vec<u8>>,
    pub stop: CancellationToken,
}

impl IfacePort {
    /// Hands one received frame to the engine. Drops the frame when the
    /// engine queue is saturated; unreliable links already imply loss.
    pub fn deliver(&self, frame: Vec<u8>) {
        let message = RxFrame { iface: self.id, frame };
        if let Err(err) = self.rx_sender.try_send(message) {
            log::warn!("iface {}: inbound queue full, dropping frame ({})", self.id, err);
        }
    }
}

struct RegisteredIface {
    id: IfaceId,
    info: IfaceInfo,
    tx_sender: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
}

/// Registry of attached interfaces and the fan-out point for outbound
/// frames. Frame dispatch is non-blocking; a full interface queue counts as
/// a failed transmission on that interface.
pub struct IfaceManager {
    counter: usize,
    rx_sender: mpsc::Sender<RxFrame>,
    ifaces: Vec<RegisteredIface>,
    tx_queue_capacity: usize,
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct DispatchOutcome {
    pub matched: usize,
    pub sent: usize,
    pub failed: usize,
}

impl IfaceManager {
    pub fn new(rx_sender: mpsc::Sender<RxFrame>, tx_queue_capacity: usize) -> Self {
        Self { counter: 0, rx_sender, ifaces: Vec::new(), tx_queue_capacity }
    }

    pub fn attach(&mut self, info: IfaceInfo) -> IfacePort {
        self.counter += 1;
        let id = TruncatedHash::from_full(&Sha256Hash::of(&self.counter.to_le_bytes()));
        let (tx_sender, tx_receiver) = mpsc::channel(self.tx_queue_capacity);
        let stop = CancellationToken::new();

        log::debug!("iface: attached {}", id);
        self.ifaces.push(RegisteredIface { id, info, tx_sender, stop: stop.clone() });

        IfacePort { id, info, rx_sender: self.rx_sender.clone(), tx_receiver, stop }
    }

    pub fn detach(&mut self, id: &IfaceId) {
        self.ifaces.retain(|iface| {
            if iface.id == *id {
                iface.stop.cancel();
                false
            } else {
                true
            }
        });
    }

    pub fn cleanup(&mut self) {
        self.ifaces.retain(|iface| !iface.stop.is_cancelled());
    }

    pub fn iface_mtu(&self, id: &IfaceId) -> Option<usize> {
        self.ifaces.iter().find(|iface| iface.id == *id).map(|iface| iface.info.mtu)
    }

    /// Queues an already HDLC-framed buffer on every interface the target
    /// selects.
    pub fn dispatch(&self, target: TxTarget, frame: &[u8]) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for iface in &self.ifaces {
            let selected = match target {
                TxTarget::Broadcast { except } => except != Some(iface.id),
                TxTarget::Direct(id) => id == iface.id,
            };
            if !selected || !iface.info.tx || iface.stop.is_cancelled() {
                continue;
            }

            outcome.matched += 1;
            match iface.tx_sender.try_send(frame.to_vec()) {
                Ok(()) => outcome.sent += 1,
                Err(err) => {
                    outcome.failed += 1;
                    log::warn!("iface {}: cannot queue outbound frame ({})", iface.id, err);
                }
            }
        }
        outcome
    }
}

impl fmt::Debug for IfaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfaceManager").field("ifaces", &self.ifaces.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::{IfaceInfo, IfaceManager, TxTarget};

    #[test]
    fn broadcast_skips_source_interface() {
        let (rx_sender, _rx_receiver) = mpsc::channel(8);
        let mut manager = IfaceManager::new(rx_sender, 8);

        let mut first = manager.attach(IfaceInfo::default());
        let mut second = manager.attach(IfaceInfo::default());

        let outcome =
            manager.dispatch(TxTarget::Broadcast { except: Some(first.id) }, &[1, 2, 3]);
        assert_eq!(outcome.sent, 1);
        assert!(first.tx_receiver.try_recv().is_err());
        assert_eq!(second.tx_receiver.try_recv().expect("frame queued"), vec![1, 2, 3]);
    }

    #[test]
    fn direct_dispatch_hits_exactly_one() {
        let (rx_sender, _rx_receiver) = mpsc::channel(8);
        let mut manager = IfaceManager::new(rx_sender, 8);

        let mut first = manager.attach(IfaceInfo::default());
        let mut second = manager.attach(IfaceInfo::default());

        let outcome = manager.dispatch(TxTarget::Direct(second.id), &[9]);
        assert_eq!(outcome, super::DispatchOutcome { matched: 1, sent: 1, failed: 0 });
        assert!(first.tx_receiver.try_recv().is_err());
        assert_eq!(second.tx_receiver.try_recv().expect("frame queued"), vec![9]);
    }

    #[test]
    fn receive_only_interfaces_never_transmit() {
        let (rx_sender, _rx_receiver) = mpsc::channel(8);
        let mut manager = IfaceManager::new(rx_sender, 8);

        let mut port = manager.attach(IfaceInfo { tx: false, ..Default::default() });
        let outcome = manager.dispatch(TxTarget::Broadcast { except: None }, &[7]);
        assert_eq!(outcome.matched, 0);
        assert!(port.tx_receiver.try_recv().is_err());
    }
}
