pub mod announces;
pub mod engine;
pub mod inbound;
pub mod jobs;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_bytes::ByteBuf;
use tokio::sync::{broadcast, Mutex};

use crate::destination::link::{Link, LinkEventData, LinkId};
use crate::destination::{
    DestinationName, GroupInputDestination, SingleInputDestination,
};
use crate::error::CoreError;
use crate::hash::{Sha256Hash, TruncatedHash};
use crate::iface::{IfaceId, IfaceManager, TxTarget};
use crate::iface::hdlc;
use crate::identity::{Identity, KnownDestinations, PrivateIdentity};
use crate::packet::{Packet, PacketContext, PacketKind};
use crate::receipt::{PacketReceipt, ReceiptEvent};
use crate::resource::{ResourceEvent, ResourceManager};

pub use engine::Transport;

/// Bound on the duplicate-suppression list; oldest hashes fall out first.
pub const PACKET_HASHLIST_CAPACITY: usize = 1_000_000;
/// Bound on the cached-packet store serving cache requests.
pub const PACKET_CACHE_CAPACITY: usize = 1_000;
pub const JOB_INTERVAL: Duration = Duration::from_millis(250);
pub const RECEIPT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Announces older than this many hops are not rebroadcast.
pub const ANNOUNCE_MAX_HOPS: u8 = 128;

pub const KNOWN_DESTINATIONS_FILE: &str = "known_destinations";
pub const PACKET_HASHLIST_FILE: &str = "packet_hashlist";

/// Engine construction parameters. The identity names this node when it
/// forwards announces for others.
pub struct TransportConfig {
    pub name: String,
    pub identity: PrivateIdentity,
    /// Rebroadcast validated announces on the other interfaces.
    pub retransmit: bool,
    pub iface_rx_queue: usize,
    pub iface_tx_queue: usize,
}

impl TransportConfig {
    pub fn new(name: &str, identity: PrivateIdentity) -> Self {
        Self {
            name: name.to_string(),
            identity,
            retransmit: false,
            iface_rx_queue: 256,
            iface_tx_queue: 128,
        }
    }
}

/// Bounded first-in first-out hash set used for duplicate suppression.
pub struct PacketHashList {
    capacity: usize,
    set: HashSet<Sha256Hash>,
    order: VecDeque<Sha256Hash>,
}

impl PacketHashList {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, set: HashSet::new(), order: VecDeque::new() }
    }

    /// Returns true when the hash was not present.
    pub fn insert(&mut self, hash: &Sha256Hash) -> bool {
        if self.set.contains(hash) {
            return false;
        }
        if self.set.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(*hash);
        self.order.push_back(*hash);
        true
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.set.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CoreError> {
        let hashes: Vec<ByteBuf> = self
            .order
            .iter()
            .map(|hash| ByteBuf::from(hash.as_slice().to_vec()))
            .collect();
        let encoded = rmp_serde::to_vec(&hashes).map_err(|_| CoreError::Io)?;
        std::fs::write(path, encoded).map_err(|_| CoreError::Io)
    }

    pub fn load<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, CoreError> {
        let data = std::fs::read(path).map_err(|_| CoreError::Io)?;
        let hashes: Vec<ByteBuf> =
            rmp_serde::from_slice(&data).map_err(|_| CoreError::Malformed)?;
        let mut list = Self::new(capacity);
        for hash in hashes {
            if let Ok(hash) = Sha256Hash::from_slice(&hash) {
                list.insert(&hash);
            }
        }
        Ok(list)
    }
}

/// Small bounded store of raw packets for cache requests; holds resource
/// proofs so a sender that missed one can ask again.
pub struct PacketCache {
    capacity: usize,
    packets: HashMap<Sha256Hash, Vec<u8>>,
    order: VecDeque<Sha256Hash>,
}

impl PacketCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, packets: HashMap::new(), order: VecDeque::new() }
    }

    pub fn store(&mut self, hash: Sha256Hash, raw: Vec<u8>) {
        if self.packets.contains_key(&hash) {
            return;
        }
        if self.packets.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.packets.remove(&oldest);
            }
        }
        self.packets.insert(hash, raw);
        self.order.push_back(hash);
    }

    pub fn get(&self, hash: &Sha256Hash) -> Option<&Vec<u8>> {
        self.packets.get(hash)
    }
}

/// Packets worth keeping for later cache requests.
pub fn should_cache(packet: &Packet) -> bool {
    packet.context == PacketContext::ResourceProof
}

/// What the engine remembers about the latest valid announce per
/// destination.
#[derive(Debug, Clone)]
pub struct AnnounceRecord {
    pub first_seen: u64,
    pub packet_hash: Sha256Hash,
    pub hops: u8,
    pub iface: IfaceId,
    pub emitted: u64,
}

/// Aspect-filtered observer invoked on every validated announce. A `None`
/// filter observes everything; a dotted name such as `"example.fruits"`
/// restricts dispatch to announces whose destination matches that name under
/// the announced identity.
pub trait AnnounceHandler: Send + Sync {
    fn aspect_filter(&self) -> Option<String>;
    fn received_announce(
        &self,
        destination: &TruncatedHash,
        identity: &Identity,
        app_data: &[u8],
    );
}

#[derive(Debug, Clone)]
pub struct AnnounceEvent {
    pub destination: TruncatedHash,
    pub identity: Identity,
    pub app_data: Vec<u8>,
    pub hops: u8,
    pub iface: IfaceId,
}

/// Decrypted application data delivered to a registered destination or over
/// a link.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub destination: TruncatedHash,
    pub context: PacketContext,
    pub data: Vec<u8>,
    pub link_id: Option<LinkId>,
}

pub(crate) struct Router {
    pub(crate) config: TransportConfig,
    pub(crate) ifaces: IfaceManager,
    pub(crate) in_destinations: HashMap<TruncatedHash, Arc<Mutex<SingleInputDestination>>>,
    pub(crate) group_destinations: HashMap<TruncatedHash, Arc<Mutex<GroupInputDestination>>>,
    pub(crate) plain_destinations: HashSet<TruncatedHash>,
    pub(crate) known: KnownDestinations,
    pub(crate) announces: HashMap<TruncatedHash, AnnounceRecord>,
    pub(crate) handlers: Vec<Arc<dyn AnnounceHandler>>,
    pub(crate) pending_links: HashMap<LinkId, Arc<Mutex<Link>>>,
    pub(crate) active_links: HashMap<LinkId, Arc<Mutex<Link>>>,
    pub(crate) receipts: Vec<PacketReceipt>,
    pub(crate) seen: PacketHashList,
    pub(crate) cache: PacketCache,
    pub(crate) resources: ResourceManager,
    pub(crate) announce_tx: broadcast::Sender<AnnounceEvent>,
    pub(crate) link_event_tx: broadcast::Sender<LinkEventData>,
    pub(crate) message_tx: broadcast::Sender<InboundMessage>,
    pub(crate) receipt_tx: broadcast::Sender<ReceiptEvent>,
    pub(crate) resource_tx: broadcast::Sender<ResourceEvent>,
    pub(crate) last_receipt_check: Instant,
}

impl Router {
    /// Serializes, frames and queues a packet, recording it in the packet
    /// cache and receipt table as its type demands. Returns the packet hash
    /// when a receipt was created.
    pub(crate) fn transmit(
        &mut self,
        packet: &Packet,
        target: TxTarget,
        create_receipt: bool,
        receipt_timeout: Option<Duration>,
    ) -> Result<Option<Sha256Hash>, CoreError> {
        let bytes = packet.to_bytes()?;
        let frame = hdlc::encode(&bytes);

        let outcome = self.ifaces.dispatch(target, &frame);
        if outcome.sent == 0 {
            log::debug!(
                "tp({}): no interface accepted packet for {}",
                self.config.name,
                packet.destination
            );
            return Err(CoreError::NoInterface);
        }

        let hash = packet.hash();
        if should_cache(packet) {
            self.cache.store(hash, bytes);
        }

        if create_receipt && packet.header.packet_kind == PacketKind::Data {
            let timeout =
                receipt_timeout.unwrap_or(crate::receipt::TIMEOUT_PER_HOP);
            self.receipts.push(PacketReceipt::new(packet, timeout));
            return Ok(Some(hash));
        }
        Ok(None)
    }

    /// Direct transmission towards a link's interface, broadcast when the
    /// link never learned one.
    pub(crate) fn link_target(link: &Link) -> TxTarget {
        match link.attached_iface() {
            Some(iface) => TxTarget::Direct(iface),
            None => TxTarget::Broadcast { except: None },
        }
    }

    /// Emits queued resource events to subscribers.
    pub(crate) fn flush_resource_events(&mut self) {
        for event in self.resources.drain_events() {
            let _ = self.resource_tx.send(event);
        }
    }

    /// Hop distance to a destination learned from its announces.
    pub(crate) fn hops_to(&self, destination: &TruncatedHash) -> Option<u8> {
        self.announces.get(destination).map(|record| record.hops)
    }

    pub(crate) fn expected_address_for_filter(
        filter: &str,
        identity: &Identity,
    ) -> Option<TruncatedHash> {
        DestinationName::from_dotted(filter)
            .ok()
            .map(|name| name.single_address(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::{PacketCache, PacketHashList};
    use crate::hash::Sha256Hash;

    #[test]
    fn hashlist_deduplicates_and_evicts_in_order() {
        let mut list = PacketHashList::new(2);
        let first = Sha256Hash::of(b"one");
        let second = Sha256Hash::of(b"two");
        let third = Sha256Hash::of(b"three");

        assert!(list.insert(&first));
        assert!(!list.insert(&first));
        assert!(list.insert(&second));
        assert!(list.insert(&third));

        // Oldest entry fell out, so it is accepted again.
        assert!(!list.contains(&first));
        assert!(list.contains(&second));
        assert!(list.contains(&third));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn hashlist_persistence_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("packet_hashlist");

        let mut list = PacketHashList::new(16);
        list.insert(&Sha256Hash::of(b"a"));
        list.insert(&Sha256Hash::of(b"b"));
        list.save(&path).expect("save");

        let restored = PacketHashList::load(&path, 16).expect("load");
        assert_eq!(restored.len(), 2);
        assert!(restored.contains(&Sha256Hash::of(b"a")));
        assert!(restored.contains(&Sha256Hash::of(b"b")));
    }

    #[test]
    fn cache_is_bounded() {
        let mut cache = PacketCache::new(2);
        cache.store(Sha256Hash::of(b"one"), vec![1]);
        cache.store(Sha256Hash::of(b"two"), vec![2]);
        cache.store(Sha256Hash::of(b"three"), vec![3]);

        assert!(cache.get(&Sha256Hash::of(b"one")).is_none());
        assert_eq!(cache.get(&Sha256Hash::of(b"three")), Some(&vec![3]));
    }
}
