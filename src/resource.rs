pub mod receiver;
pub mod sender;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::destination::link::{Link, LinkId};
use crate::error::CoreError;
use crate::hash::{Sha256Hash, HASH_SIZE};
use crate::packet::{Packet, PacketContext, PacketKind, MDU};

pub use receiver::IncomingResource;
pub use sender::OutgoingResource;

/// Parts a receiver asks for per request round.
pub const WINDOW: usize = 4;
pub const WINDOW_MIN: usize = 1;
pub const WINDOW_MAX: usize = 10;
pub const WINDOW_FLEXIBILITY: usize = 4;

pub const MAP_HASH_SIZE: usize = 4;
/// Stream nonce and map-hash salt size.
pub const SALT_SIZE: usize = 4;
/// Part payload size: parts ride in unencrypted RESOURCE packets, the stream
/// itself having been encrypted up front.
pub const SDU: usize = MDU;

/// Resources above this size transfer as consecutive segments sharing one
/// original hash. Also the ceiling for auto-compression.
pub const MAX_EFFICIENT_SIZE: usize = 16 * 1024 * 1024;
pub const AUTO_COMPRESS_MAX_SIZE: usize = MAX_EFFICIENT_SIZE;

pub const MAX_RETRIES: u8 = 5;
pub const SENDER_GRACE_TIME_MS: u64 = 10_000;
pub const RETRY_GRACE_TIME_MS: u64 = 250;
pub const TIMEOUT_FACTOR: u32 = 3;

/// Serialized advertisement overhead outside the hashmap chunk.
pub const ADVERTISEMENT_OVERHEAD: usize = 134;
/// Hashmap entries one advertisement (or hashmap update) can carry.
pub const HASHMAP_MAX_LEN: usize =
    (crate::packet::ENCRYPTED_MDU - ADVERTISEMENT_OVERHEAD) / MAP_HASH_SIZE;
/// Window of recent map hashes the sender checks for collisions during
/// preparation; a collision forces a re-salt.
pub const COLLISION_GUARD_SIZE: usize = 2 * WINDOW_MAX + HASHMAP_MAX_LEN;

pub const HASHMAP_IS_NOT_EXHAUSTED: u8 = 0x00;
pub const HASHMAP_IS_EXHAUSTED: u8 = 0xFF;

const FLAG_ENCRYPTED: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x02;
const FLAG_SPLIT: u8 = 0x04;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub enum ResourceStatus {
    None = 0x00,
    Queued = 0x01,
    Advertised = 0x02,
    Transferring = 0x03,
    AwaitingProof = 0x04,
    Assembling = 0x05,
    Complete = 0x06,
    Failed = 0x07,
    Corrupt = 0x08,
}

/// How a link treats unsolicited resource advertisements.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResourceStrategy {
    AcceptNone,
    AcceptApp,
    AcceptAll,
}

/// Consulted for `AcceptApp`: return true to accept the transfer.
pub type ResourceAcceptPredicate =
    Arc<dyn Fn(&ResourceAdvertisement) -> bool + Send + Sync>;

//***************************************************************************//

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_size: u64,
    pub data_size: u64,
    pub parts: u32,
    pub hash: Sha256Hash,
    pub random_hash: [u8; SALT_SIZE],
    pub original_hash: Sha256Hash,
    pub segment_index: u32,
    pub total_segments: u32,
    pub flags: u8,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdvertisementFrame {
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    data_size: u64,
    #[serde(rename = "n")]
    parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "r", with = "serde_bytes")]
    random_hash: Vec<u8>,
    #[serde(rename = "o", with = "serde_bytes")]
    original_hash: Vec<u8>,
    #[serde(rename = "i")]
    segment_index: u32,
    #[serde(rename = "l")]
    total_segments: u32,
    #[serde(rename = "f")]
    flags: u8,
    #[serde(rename = "m", with = "serde_bytes")]
    hashmap: Vec<u8>,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, CoreError> {
        let frame = AdvertisementFrame {
            transfer_size: self.transfer_size,
            data_size: self.data_size,
            parts: self.parts,
            hash: self.hash.as_slice().to_vec(),
            random_hash: self.random_hash.to_vec(),
            original_hash: self.original_hash.as_slice().to_vec(),
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            flags: self.flags,
            hashmap: self.hashmap.clone(),
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| CoreError::Malformed)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, CoreError> {
        let frame: AdvertisementFrame =
            rmp_serde::from_slice(data).map_err(|_| CoreError::Malformed)?;
        if frame.random_hash.len() < SALT_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let mut random_hash = [0u8; SALT_SIZE];
        random_hash.copy_from_slice(&frame.random_hash[..SALT_SIZE]);
        Ok(Self {
            transfer_size: frame.transfer_size,
            data_size: frame.data_size,
            parts: frame.parts,
            hash: Sha256Hash::from_slice(&frame.hash)?,
            random_hash,
            original_hash: Sha256Hash::from_slice(&frame.original_hash)?,
            segment_index: frame.segment_index,
            total_segments: frame.total_segments,
            flags: frame.flags,
            hashmap: frame.hashmap,
        })
    }

    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn split(&self) -> bool {
        self.flags & FLAG_SPLIT != 0
    }

    pub fn make_flags(encrypted: bool, compressed: bool, split: bool) -> u8 {
        (encrypted as u8) | (compressed as u8) << 1 | (split as u8) << 2
    }
}

//***************************************************************************//

/// `RESOURCE_REQ` payload: exhausted flag, optionally the last known map
/// hash, the resource hash, then the wanted map hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRequest {
    pub hashmap_exhausted: bool,
    pub last_map_hash: Option<[u8; MAP_HASH_SIZE]>,
    pub resource_hash: Sha256Hash,
    pub wanted: Vec<[u8; MAP_HASH_SIZE]>,
}

impl PartRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + MAP_HASH_SIZE + HASH_SIZE + self.wanted.len() * MAP_HASH_SIZE,
        );
        if self.hashmap_exhausted {
            out.push(HASHMAP_IS_EXHAUSTED);
            out.extend_from_slice(&self.last_map_hash.unwrap_or([0u8; MAP_HASH_SIZE]));
        } else {
            out.push(HASHMAP_IS_NOT_EXHAUSTED);
        }
        out.extend_from_slice(self.resource_hash.as_slice());
        for hash in &self.wanted {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.is_empty() {
            return Err(CoreError::InvalidLength);
        }
        let hashmap_exhausted = data[0] == HASHMAP_IS_EXHAUSTED;
        let mut offset = 1;

        let last_map_hash = if hashmap_exhausted {
            if data.len() < offset + MAP_HASH_SIZE {
                return Err(CoreError::InvalidLength);
            }
            let mut last = [0u8; MAP_HASH_SIZE];
            last.copy_from_slice(&data[offset..offset + MAP_HASH_SIZE]);
            offset += MAP_HASH_SIZE;
            Some(last)
        } else {
            None
        };

        if data.len() < offset + HASH_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let resource_hash = Sha256Hash::from_slice(&data[offset..offset + HASH_SIZE])?;
        offset += HASH_SIZE;

        let mut wanted = Vec::new();
        while offset + MAP_HASH_SIZE <= data.len() {
            let mut entry = [0u8; MAP_HASH_SIZE];
            entry.copy_from_slice(&data[offset..offset + MAP_HASH_SIZE]);
            wanted.push(entry);
            offset += MAP_HASH_SIZE;
        }

        Ok(Self { hashmap_exhausted, last_map_hash, resource_hash, wanted })
    }
}

/// `RESOURCE_HMU` payload: `resource_hash ‖ msgpack([segment, hashmap])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashmapUpdate {
    pub resource_hash: Sha256Hash,
    pub segment: u32,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HashmapUpdateFrame(u32, ByteBuf);

impl HashmapUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::with_capacity(HASH_SIZE + 8 + self.hashmap.len());
        out.extend_from_slice(self.resource_hash.as_slice());
        let frame =
            rmp_serde::to_vec(&HashmapUpdateFrame(self.segment, ByteBuf::from(self.hashmap.clone())))
                .map_err(|_| CoreError::Malformed)?;
        out.extend_from_slice(&frame);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < HASH_SIZE + 1 {
            return Err(CoreError::InvalidLength);
        }
        let resource_hash = Sha256Hash::from_slice(&data[..HASH_SIZE])?;
        let frame: HashmapUpdateFrame =
            rmp_serde::from_slice(&data[HASH_SIZE..]).map_err(|_| CoreError::Malformed)?;
        Ok(Self { resource_hash, segment: frame.0, hashmap: frame.1.into_vec() })
    }
}

/// `RESOURCE_PRF` payload: `resource_hash ‖ SHA-256(data ‖ resource_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProofPayload {
    pub resource_hash: Sha256Hash,
    pub proof: Sha256Hash,
}

impl ResourceProofPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_SIZE * 2);
        out.extend_from_slice(self.resource_hash.as_slice());
        out.extend_from_slice(self.proof.as_slice());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < HASH_SIZE * 2 {
            return Err(CoreError::InvalidLength);
        }
        Ok(Self {
            resource_hash: Sha256Hash::from_slice(&data[..HASH_SIZE])?,
            proof: Sha256Hash::from_slice(&data[HASH_SIZE..])?,
        })
    }
}

//***************************************************************************//

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub resource: Sha256Hash,
    pub link_id: LinkId,
    pub kind: ResourceEventKind,
}

#[derive(Debug, Clone)]
pub enum ResourceEventKind {
    /// An inbound transfer was accepted and requests are flowing.
    Started {
        transfer_size: u64,
        data_size: u64,
        parts: usize,
        segment_index: u32,
        total_segments: u32,
    },
    Progress {
        received_parts: usize,
        total_parts: usize,
        received_bytes: u64,
        total_bytes: u64,
    },
    SegmentComplete {
        segment_index: u32,
        total_segments: u32,
    },
    /// Final (or only) segment assembled and proven; carries the data.
    Complete { data: Vec<u8> },
    Corrupt,
    Failed,
    SentProgress { sent_parts: usize, total_parts: usize },
    OutboundSegmentComplete { segment_index: u32, total_segments: u32 },
    OutboundComplete,
    OutboundFailed,
}

/// Work the periodic jobs pass asks the engine to perform.
pub enum TickAction {
    /// Re-send a stored advertisement packet.
    Resend { link_id: LinkId, packet: Packet },
    /// Receiver retry; the engine builds the request with
    /// [`ResourceManager::build_retry_request`] while holding the link.
    RetryRequest { link_id: LinkId, resource: Sha256Hash },
    /// Sender waiting for the final proof asks the peer's packet cache.
    RequestProofCache { link_id: LinkId, proof_packet_hash: Sha256Hash },
    /// The transfer failed; `initiator` selects whether RESOURCE_ICL is due.
    Cancelled { link_id: LinkId, resource: Sha256Hash, initiator: bool },
}

/// Builds a link-addressed packet for resource traffic. Parts and resource
/// proofs stay plaintext (the stream is pre-encrypted, the proof must be
/// cacheable); everything else rides inside the link envelope.
pub fn build_link_packet(
    link: &Link,
    kind: PacketKind,
    context: PacketContext,
    payload: &[u8],
) -> Result<Packet, CoreError> {
    let plaintext_context = context == PacketContext::Resource
        || (kind == PacketKind::Proof && context == PacketContext::ResourceProof)
        || context == PacketContext::CacheRequest;
    if plaintext_context {
        link.plain_packet(kind, context, payload)
    } else {
        let mut packet = link.control_packet(context, payload)?;
        packet.header.packet_kind = kind;
        Ok(packet)
    }
}

struct QueuedOutgoing {
    link_id: LinkId,
    data: Vec<u8>,
    auto_compress: bool,
}

/// Book-keeper for all transfers in flight across all links. Owned by the
/// transport engine; every method that emits packets borrows the link so the
/// packets carry the right session keys.
#[derive(Default)]
pub struct ResourceManager {
    outgoing: HashMap<Sha256Hash, OutgoingResource>,
    incoming: HashMap<Sha256Hash, IncomingResource>,
    /// Reassembly buffers for split transfers, keyed by original hash.
    segments: HashMap<Sha256Hash, Vec<u8>>,
    queued: Vec<QueuedOutgoing>,
    events: Vec<ResourceEvent>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain_events(&mut self) -> Vec<ResourceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    fn link_busy(&self, link_id: &LinkId) -> bool {
        self.outgoing
            .values()
            .any(|resource| resource.link_id() == link_id && resource.active())
    }

    /// Starts (or queues) an outbound transfer. Returns the advertisement
    /// packet when the transfer starts immediately.
    pub fn start_outgoing(
        &mut self,
        link: &Link,
        data: Vec<u8>,
        auto_compress: bool,
    ) -> Result<(Sha256Hash, Option<Packet>), CoreError> {
        if self.link_busy(link.id()) {
            log::debug!("resource: link {} busy, queueing transfer", link.id());
            let placeholder = Sha256Hash::of(&data);
            self.queued.push(QueuedOutgoing {
                link_id: *link.id(),
                data,
                auto_compress,
            });
            return Ok((placeholder, None));
        }

        let resource = OutgoingResource::prepare_first(link, data, auto_compress)?;
        let hash = *resource.hash();
        let advertisement = resource.advertisement_packet();
        self.outgoing.insert(hash, resource);
        Ok((hash, Some(advertisement)))
    }

    /// Pops the next queued transfer for a link whose outgoing slot freed up.
    pub fn dequeue_next(&mut self, link: &Link) -> Option<Packet> {
        if self.link_busy(link.id()) {
            return None;
        }
        let index = self.queued.iter().position(|entry| entry.link_id == *link.id())?;
        let entry = self.queued.remove(index);
        match OutgoingResource::prepare_first(link, entry.data, entry.auto_compress) {
            Ok(resource) => {
                let advertisement = resource.advertisement_packet();
                self.outgoing.insert(*resource.hash(), resource);
                Some(advertisement)
            }
            Err(err) => {
                log::warn!("resource: could not start queued transfer ({})", err);
                None
            }
        }
    }

    /// Receiver side: accept an advertisement and produce the first request.
    pub fn accept(
        &mut self,
        link: &Link,
        advertisement: &ResourceAdvertisement,
    ) -> Vec<Packet> {
        let mut receiver = match IncomingResource::accept(advertisement, *link.id(), link.rtt())
        {
            Ok(receiver) => receiver,
            Err(err) => {
                log::debug!("resource: dropping advertisement ({})", err);
                return Vec::new();
            }
        };

        self.events.push(ResourceEvent {
            resource: advertisement.hash,
            link_id: *link.id(),
            kind: ResourceEventKind::Started {
                transfer_size: advertisement.transfer_size,
                data_size: advertisement.data_size,
                parts: advertisement.parts as usize,
                segment_index: advertisement.segment_index,
                total_segments: advertisement.total_segments,
            },
        });

        let request = receiver.next_request();
        let packets = self.request_to_packets(link, request);
        self.incoming.insert(advertisement.hash, receiver);
        packets
    }

    /// Sender side: serve a part request.
    pub fn handle_request(&mut self, link: &Link, plaintext: &[u8]) -> Vec<Packet> {
        let Ok(request) = PartRequest::decode(plaintext) else {
            log::debug!("resource: malformed part request dropped");
            return Vec::new();
        };
        let Some(resource) = self.outgoing.get_mut(&request.resource_hash) else {
            return Vec::new();
        };
        let (packets, progress) = resource.serve_request(link, &request);
        if let Some(kind) = progress {
            self.events.push(ResourceEvent {
                resource: request.resource_hash,
                link_id: *link.id(),
                kind,
            });
        }
        packets
    }

    /// Receiver side: extend the hashmap and keep requesting.
    pub fn handle_hashmap_update(&mut self, link: &Link, plaintext: &[u8]) -> Vec<Packet> {
        let Ok(update) = HashmapUpdate::decode(plaintext) else {
            log::debug!("resource: malformed hashmap update dropped");
            return Vec::new();
        };
        let Some(receiver) = self.incoming.get_mut(&update.resource_hash) else {
            return Vec::new();
        };
        receiver.apply_hashmap_update(&update);
        let request = receiver.next_request();
        self.request_to_packets(link, request)
    }

    /// Receiver side: one RESOURCE part arrived.
    pub fn handle_part(&mut self, link: &Link, part: &[u8]) -> Vec<Packet> {
        let mut matched: Option<Sha256Hash> = None;
        let mut outcome = receiver::PartOutcome::NoMatch;

        for (hash, resource) in self.incoming.iter_mut() {
            if resource.link_id() != link.id() {
                continue;
            }
            let result = resource.receive_part(part, link);
            if !matches!(result, receiver::PartOutcome::NoMatch) {
                matched = Some(*hash);
                outcome = result;
                break;
            }
        }

        let Some(hash) = matched else {
            return Vec::new();
        };

        match outcome {
            receiver::PartOutcome::NoMatch => Vec::new(),
            receiver::PartOutcome::Progress { request_more, progress } => {
                if let Some(kind) = progress {
                    self.events.push(ResourceEvent { resource: hash, link_id: *link.id(), kind });
                }
                if request_more {
                    if let Some(receiver) = self.incoming.get_mut(&hash) {
                        let request = receiver.next_request();
                        return self.request_to_packets(link, request);
                    }
                }
                Vec::new()
            }
            receiver::PartOutcome::Assembled { data, proof } => {
                match self.incoming.remove(&hash) {
                    Some(receiver) => self.conclude_incoming(link, receiver, data, proof),
                    None => Vec::new(),
                }
            }
            receiver::PartOutcome::Corrupt => {
                self.incoming.remove(&hash);
                self.events.push(ResourceEvent {
                    resource: hash,
                    link_id: *link.id(),
                    kind: ResourceEventKind::Corrupt,
                });
                Vec::new()
            }
        }
    }

    fn conclude_incoming(
        &mut self,
        link: &Link,
        receiver: IncomingResource,
        data: Vec<u8>,
        proof: ResourceProofPayload,
    ) -> Vec<Packet> {
        let mut packets = Vec::new();
        match build_link_packet(
            link,
            PacketKind::Proof,
            PacketContext::ResourceProof,
            &proof.encode(),
        ) {
            Ok(packet) => packets.push(packet),
            Err(err) => log::warn!("resource: could not build proof packet ({})", err),
        }

        if receiver.split() {
            let buffer = self.segments.entry(*receiver.original_hash()).or_default();
            buffer.extend_from_slice(&data);
            if receiver.segment_index() >= receiver.total_segments() {
                let assembled = self
                    .segments
                    .remove(receiver.original_hash())
                    .unwrap_or_default();
                self.events.push(ResourceEvent {
                    resource: *receiver.original_hash(),
                    link_id: *link.id(),
                    kind: ResourceEventKind::Complete { data: assembled },
                });
            } else {
                self.events.push(ResourceEvent {
                    resource: *receiver.original_hash(),
                    link_id: *link.id(),
                    kind: ResourceEventKind::SegmentComplete {
                        segment_index: receiver.segment_index(),
                        total_segments: receiver.total_segments(),
                    },
                });
            }
        } else {
            self.events.push(ResourceEvent {
                resource: *receiver.hash(),
                link_id: *link.id(),
                kind: ResourceEventKind::Complete { data },
            });
        }
        packets
    }

    /// Sender side: a RESOURCE_PRF arrived.
    pub fn handle_proof(&mut self, link: &Link, payload: &[u8]) -> Vec<Packet> {
        let Ok(proof) = ResourceProofPayload::decode(payload) else {
            return Vec::new();
        };
        let Some(resource) = self.outgoing.get_mut(&proof.resource_hash) else {
            return Vec::new();
        };
        if !resource.validate_proof(&proof) {
            log::debug!("resource {}: proof mismatch ignored", proof.resource_hash);
            return Vec::new();
        }

        let Some(finished) = self.outgoing.remove(&proof.resource_hash) else {
            return Vec::new();
        };
        let mut packets = Vec::new();

        if finished.segment_index() < finished.total_segments() {
            self.events.push(ResourceEvent {
                resource: proof.resource_hash,
                link_id: *link.id(),
                kind: ResourceEventKind::OutboundSegmentComplete {
                    segment_index: finished.segment_index(),
                    total_segments: finished.total_segments(),
                },
            });
            match finished.prepare_next_segment(link) {
                Ok(Some(next)) => {
                    packets.push(next.advertisement_packet());
                    self.outgoing.insert(*next.hash(), next);
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("resource: next segment preparation failed ({})", err);
                    self.events.push(ResourceEvent {
                        resource: proof.resource_hash,
                        link_id: *link.id(),
                        kind: ResourceEventKind::OutboundFailed,
                    });
                }
            }
        } else {
            self.events.push(ResourceEvent {
                resource: proof.resource_hash,
                link_id: *link.id(),
                kind: ResourceEventKind::OutboundComplete,
            });
            if let Some(advertisement) = self.dequeue_next(link) {
                packets.push(advertisement);
            }
        }
        packets
    }

    /// RESOURCE_ICL / RESOURCE_RCL: the peer abandoned a transfer. Only
    /// transfers riding the announcing link are affected.
    pub fn handle_cancel(&mut self, link_id: &LinkId, plaintext: &[u8]) {
        let Ok(hash) = Sha256Hash::from_slice(plaintext) else {
            return;
        };
        if self
            .incoming
            .get(&hash)
            .is_some_and(|resource| resource.link_id() == link_id)
        {
            self.incoming.remove(&hash);
            self.events.push(ResourceEvent {
                resource: hash,
                link_id: *link_id,
                kind: ResourceEventKind::Failed,
            });
        }
        if self
            .outgoing
            .get(&hash)
            .is_some_and(|resource| resource.link_id() == link_id)
        {
            self.outgoing.remove(&hash);
            self.events.push(ResourceEvent {
                resource: hash,
                link_id: *link_id,
                kind: ResourceEventKind::OutboundFailed,
            });
        }
    }

    /// Drops every transfer riding a link that just died.
    pub fn cancel_for_link(&mut self, link_id: &LinkId) {
        let incoming: Vec<Sha256Hash> = self
            .incoming
            .iter()
            .filter(|(_, resource)| resource.link_id() == link_id)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in incoming {
            self.incoming.remove(&hash);
            self.events.push(ResourceEvent {
                resource: hash,
                link_id: *link_id,
                kind: ResourceEventKind::Failed,
            });
        }

        let outgoing: Vec<Sha256Hash> = self
            .outgoing
            .iter()
            .filter(|(_, resource)| resource.link_id() == link_id)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in outgoing {
            self.outgoing.remove(&hash);
            self.events.push(ResourceEvent {
                resource: hash,
                link_id: *link_id,
                kind: ResourceEventKind::OutboundFailed,
            });
        }

        self.queued.retain(|entry| entry.link_id != *link_id);
    }

    /// Periodic pass over all transfers; returns work for the engine.
    pub fn tick(&mut self, now: Instant) -> Vec<TickAction> {
        let mut actions = Vec::new();

        let mut failed_outgoing = Vec::new();
        for (hash, resource) in self.outgoing.iter_mut() {
            match resource.on_tick(now) {
                sender::SenderTick::None => {}
                sender::SenderTick::ResendAdvertisement(packet) => {
                    actions.push(TickAction::Resend {
                        link_id: *resource.link_id(),
                        packet,
                    });
                }
                sender::SenderTick::QueryProofCache(proof_packet_hash) => {
                    actions.push(TickAction::RequestProofCache {
                        link_id: *resource.link_id(),
                        proof_packet_hash,
                    });
                }
                sender::SenderTick::Failed => failed_outgoing.push(*hash),
            }
        }
        for hash in failed_outgoing {
            if let Some(resource) = self.outgoing.remove(&hash) {
                self.events.push(ResourceEvent {
                    resource: hash,
                    link_id: *resource.link_id(),
                    kind: ResourceEventKind::OutboundFailed,
                });
                actions.push(TickAction::Cancelled {
                    link_id: *resource.link_id(),
                    resource: hash,
                    initiator: true,
                });
            }
        }

        let mut failed_incoming = Vec::new();
        for (hash, resource) in self.incoming.iter_mut() {
            match resource.on_tick(now) {
                receiver::ReceiverTick::None => {}
                receiver::ReceiverTick::Retry => {
                    actions.push(TickAction::RetryRequest {
                        link_id: *resource.link_id(),
                        resource: *hash,
                    });
                }
                receiver::ReceiverTick::Failed => failed_incoming.push(*hash),
            }
        }
        for hash in failed_incoming {
            if let Some(resource) = self.incoming.remove(&hash) {
                self.events.push(ResourceEvent {
                    resource: hash,
                    link_id: *resource.link_id(),
                    kind: ResourceEventKind::Failed,
                });
                actions.push(TickAction::Cancelled {
                    link_id: *resource.link_id(),
                    resource: hash,
                    initiator: false,
                });
            }
        }

        actions
    }

    /// Builds the retry request a `RetryRequest` tick asked for.
    pub fn build_retry_request(
        &mut self,
        resource: &Sha256Hash,
        link: &Link,
    ) -> Option<Packet> {
        let receiver = self.incoming.get_mut(resource)?;
        let request = receiver.retry_request();
        self.request_to_packets(link, request).into_iter().next()
    }

    fn request_to_packets(&self, link: &Link, request: Option<PartRequest>) -> Vec<Packet> {
        let Some(request) = request else {
            return Vec::new();
        };
        match build_link_packet(
            link,
            PacketKind::Data,
            PacketContext::ResourceRequest,
            &request.encode(),
        ) {
            Ok(packet) => vec![packet],
            Err(err) => {
                log::warn!("resource: could not build request packet ({})", err);
                Vec::new()
            }
        }
    }
}

/// Map hash of a part: leading bytes of `SHA-256(part ‖ salt)`.
pub fn map_hash(part: &[u8], salt: &[u8; SALT_SIZE]) -> [u8; MAP_HASH_SIZE] {
    let digest = Sha256Hash::of_parts(&[part, salt]);
    let mut out = [0u8; MAP_HASH_SIZE];
    out.copy_from_slice(&digest.as_slice()[..MAP_HASH_SIZE]);
    out
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand_core::OsRng;
    use tokio::sync::broadcast;

    use super::{
        map_hash, HashmapUpdate, PartRequest, ResourceAdvertisement, ResourceEventKind,
        ResourceManager, ResourceProofPayload, HASHMAP_MAX_LEN, MAP_HASH_SIZE, SALT_SIZE,
    };
    use crate::destination::link::{Link, LinkInbound};
    use crate::destination::{DestinationDesc, DestinationName};
    use crate::hash::Sha256Hash;
    use crate::identity::PrivateIdentity;
    use crate::packet::{Packet, PacketContext, PacketKind};

    fn established_links() -> (Link, Link) {
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("example", &["transfer"]).expect("valid name");
        let address = name.single_address(identity.as_identity());
        let desc = DestinationDesc { identity: *identity.as_identity(), address, name };
        let (event_tx, _) = broadcast::channel(64);

        let mut initiator = Link::new(desc.clone(), event_tx.clone());
        let request = initiator.request();
        let (mut responder, proof) =
            Link::from_request(&request, &identity, desc, event_tx).expect("valid request");
        let rtt = initiator.validate_proof(&proof).expect("valid proof");
        match responder.handle_packet(&rtt) {
            LinkInbound::Activated => {}
            _ => panic!("responder should activate"),
        }
        (initiator, responder)
    }

    /// Routes one link packet into the peer's resource manager, returning
    /// whatever the manager wants sent back.
    fn deliver(packet: &Packet, link: &mut Link, manager: &mut ResourceManager) -> Vec<Packet> {
        if packet.header.packet_kind == PacketKind::Proof
            && packet.context == PacketContext::ResourceProof
        {
            return manager.handle_proof(link, packet.data.as_slice());
        }
        match link.handle_packet(packet) {
            LinkInbound::Data { context, plaintext } => match context {
                PacketContext::Resource => manager.handle_part(link, &plaintext),
                PacketContext::ResourceAdvertisement => {
                    let advertisement = ResourceAdvertisement::unpack(&plaintext)
                        .expect("well-formed advertisement");
                    manager.accept(link, &advertisement)
                }
                PacketContext::ResourceRequest => manager.handle_request(link, &plaintext),
                PacketContext::ResourceHashUpdate => {
                    manager.handle_hashmap_update(link, &plaintext)
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    #[test]
    fn windowed_transfer_between_two_managers() {
        let (mut sender_link, mut receiver_link) = established_links();
        let mut sender_manager = ResourceManager::new();
        let mut receiver_manager = ResourceManager::new();

        let payload: Vec<u8> = (0..3000u32).map(|value| (value % 251) as u8).collect();
        let (_, advertisement) = sender_manager
            .start_outgoing(&sender_link, payload.clone(), true)
            .expect("transfer starts");

        let mut to_receiver: VecDeque<Packet> = VecDeque::new();
        let mut to_sender: VecDeque<Packet> = VecDeque::new();
        to_receiver.push_back(advertisement.expect("link idle, advertised immediately"));

        let mut rounds = 0;
        while !to_receiver.is_empty() || !to_sender.is_empty() {
            rounds += 1;
            assert!(rounds < 10_000, "transfer did not converge");

            if let Some(packet) = to_receiver.pop_front() {
                for reply in deliver(&packet, &mut receiver_link, &mut receiver_manager) {
                    to_sender.push_back(reply);
                }
            }
            if let Some(packet) = to_sender.pop_front() {
                for reply in deliver(&packet, &mut sender_link, &mut sender_manager) {
                    to_receiver.push_back(reply);
                }
            }
        }

        let received = receiver_manager
            .drain_events()
            .into_iter()
            .find_map(|event| match event.kind {
                ResourceEventKind::Complete { data } => Some(data),
                _ => None,
            })
            .expect("receiver concluded");
        assert_eq!(received, payload);

        assert!(sender_manager
            .drain_events()
            .iter()
            .any(|event| matches!(event.kind, ResourceEventKind::OutboundComplete)));

        // Both sides forget the transfer once it is proven.
        assert_eq!(sender_manager.outgoing_count(), 0);
        assert_eq!(receiver_manager.incoming_count(), 0);
    }

    #[test]
    fn cancel_drops_the_transfer_on_both_tables() {
        let (sender_link, _receiver_link) = established_links();
        let mut manager = ResourceManager::new();

        let (hash, advertisement) = manager
            .start_outgoing(&sender_link, vec![7u8; 512], true)
            .expect("transfer starts");
        assert!(advertisement.is_some());
        assert_eq!(manager.outgoing_count(), 1);

        manager.handle_cancel(sender_link.id(), hash.as_slice());
        assert_eq!(manager.outgoing_count(), 0);
        assert!(manager
            .drain_events()
            .iter()
            .any(|event| matches!(event.kind, ResourceEventKind::OutboundFailed)));
    }

    #[test]
    fn advertisement_msgpack_roundtrip() {
        let advertisement = ResourceAdvertisement {
            transfer_size: 123_456,
            data_size: 120_000,
            parts: 260,
            hash: Sha256Hash::of(b"resource"),
            random_hash: [9, 8, 7, 6],
            original_hash: Sha256Hash::of(b"original"),
            segment_index: 2,
            total_segments: 3,
            flags: ResourceAdvertisement::make_flags(true, true, true),
            hashmap: vec![0xAB; HASHMAP_MAX_LEN * MAP_HASH_SIZE],
        };

        let packed = advertisement.pack().expect("packs");
        let unpacked = ResourceAdvertisement::unpack(&packed).expect("unpacks");
        assert_eq!(unpacked, advertisement);
        assert!(unpacked.encrypted() && unpacked.compressed() && unpacked.split());
    }

    #[test]
    fn part_request_roundtrip_with_exhausted_hashmap() {
        let request = PartRequest {
            hashmap_exhausted: true,
            last_map_hash: Some([1, 2, 3, 4]),
            resource_hash: Sha256Hash::of(b"resource"),
            wanted: vec![[5, 5, 5, 5], [6, 6, 6, 6]],
        };
        let decoded = PartRequest::decode(&request.encode()).expect("decodes");
        assert_eq!(decoded, request);

        let plain = PartRequest {
            hashmap_exhausted: false,
            last_map_hash: None,
            resource_hash: Sha256Hash::of(b"resource"),
            wanted: vec![],
        };
        assert_eq!(PartRequest::decode(&plain.encode()).expect("decodes"), plain);
    }

    #[test]
    fn hashmap_update_roundtrip() {
        let update = HashmapUpdate {
            resource_hash: Sha256Hash::of(b"resource"),
            segment: 4,
            hashmap: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let decoded = HashmapUpdate::decode(&update.encode().expect("encodes"))
            .expect("decodes");
        assert_eq!(decoded, update);
    }

    #[test]
    fn proof_payload_roundtrip() {
        let proof = ResourceProofPayload {
            resource_hash: Sha256Hash::of(b"resource"),
            proof: Sha256Hash::of(b"proof"),
        };
        assert_eq!(
            ResourceProofPayload::decode(&proof.encode()).expect("decodes"),
            proof
        );
    }

    #[test]
    fn map_hash_depends_on_salt() {
        let part = [0x41u8; 64];
        let salted_one = map_hash(&part, &[0, 0, 0, 1]);
        let salted_two = map_hash(&part, &[0, 0, 0, 2]);
        assert_ne!(salted_one, salted_two);
        assert_eq!(salted_one.len(), MAP_HASH_SIZE);
        let _ = SALT_SIZE;
    }
}
