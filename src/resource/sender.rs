use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bzip2::read::BzEncoder;
use bzip2::Compression;
use rand_core::{OsRng, RngCore};

use crate::destination::link::{Link, LinkId};
use crate::error::CoreError;
use crate::hash::Sha256Hash;
use crate::packet::{
    DestinationKind, Header, Packet, PacketContext, PacketKind, PacketPayload,
};

use super::{
    build_link_packet, map_hash, PartRequest, ResourceAdvertisement, ResourceEventKind,
    ResourceProofPayload, ResourceStatus, AUTO_COMPRESS_MAX_SIZE, COLLISION_GUARD_SIZE,
    HASHMAP_MAX_LEN, MAP_HASH_SIZE, MAX_EFFICIENT_SIZE, MAX_RETRIES, SALT_SIZE,
    SDU, SENDER_GRACE_TIME_MS, TIMEOUT_FACTOR,
};

/// How long an unanswered advertisement sits before being re-sent.
const ADVERTISEMENT_TIMEOUT: Duration = Duration::from_secs(15);
/// Give up re-salting after this many full hashmap collisions.
const MAX_SALT_ATTEMPTS: usize = 8;

pub enum SenderTick {
    None,
    ResendAdvertisement(Packet),
    /// All parts sent, no proof: ask the peer's packet cache for the proof
    /// we can predict the hash of.
    QueryProofCache(Sha256Hash),
    Failed,
}

/// Data shared across the segments of a split transfer.
struct SegmentSource {
    data: Arc<Vec<u8>>,
    auto_compress: bool,
}

/// Sender side of one transfer segment.
pub struct OutgoingResource {
    link_id: LinkId,
    hash: Sha256Hash,
    random_hash: [u8; SALT_SIZE],
    original_hash: Sha256Hash,
    expected_proof: Sha256Hash,
    parts: Vec<Vec<u8>>,
    map_hashes: Vec<[u8; MAP_HASH_SIZE]>,
    sent: Vec<bool>,
    sent_parts: usize,
    transfer_size: u64,
    data_size: u64,
    compressed: bool,
    split: bool,
    segment_index: u32,
    total_segments: u32,
    status: ResourceStatus,
    advertisement: Packet,
    proof_packet_hash: Sha256Hash,
    adv_sent_at: Instant,
    last_activity: Instant,
    last_part_sent: Instant,
    retries_left: u8,
    rtt: Option<Duration>,
    fallback_rtt: Duration,
    source: Option<SegmentSource>,
}

impl OutgoingResource {
    /// Prepares the first (possibly only) segment of a transfer.
    pub fn prepare_first(
        link: &Link,
        data: Vec<u8>,
        auto_compress: bool,
    ) -> Result<Self, CoreError> {
        let total_size = data.len();
        if total_size <= MAX_EFFICIENT_SIZE {
            return Self::prepare_segment(link, &data, 1, 1, None, auto_compress, total_size, None);
        }

        let total_segments = ((total_size - 1) / MAX_EFFICIENT_SIZE + 1) as u32;
        let source = Arc::new(data);
        let segment = &source[..MAX_EFFICIENT_SIZE];
        Self::prepare_segment(
            link,
            segment,
            1,
            total_segments,
            None,
            auto_compress,
            total_size,
            Some(SegmentSource { data: source.clone(), auto_compress }),
        )
    }

    /// After a segment is proven, prepares its successor from the shared
    /// source buffer.
    pub fn prepare_next_segment(self, link: &Link) -> Result<Option<Self>, CoreError> {
        let Some(source) = self.source else {
            return Ok(None);
        };
        let next_index = self.segment_index + 1;
        if next_index > self.total_segments {
            return Ok(None);
        }

        let start = (next_index as usize - 1) * MAX_EFFICIENT_SIZE;
        let end = usize::min(next_index as usize * MAX_EFFICIENT_SIZE, source.data.len());
        if start >= end {
            return Ok(None);
        }
        let auto_compress = source.auto_compress;
        let total_size = source.data.len();
        let segment = source.data[start..end].to_vec();

        Self::prepare_segment(
            link,
            &segment,
            next_index,
            self.total_segments,
            Some(self.original_hash),
            auto_compress,
            total_size,
            Some(source),
        )
        .map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_segment(
        link: &Link,
        segment_data: &[u8],
        segment_index: u32,
        total_segments: u32,
        original_hash: Option<Sha256Hash>,
        auto_compress: bool,
        total_size: usize,
        source: Option<SegmentSource>,
    ) -> Result<Self, CoreError> {
        let (body, compressed) = compress_if_smaller(segment_data, auto_compress);

        // A throwaway nonce decorrelates the ciphertext of identical
        // payloads; it is unrelated to the advertised map-hash salt.
        let mut stream = Vec::with_capacity(SALT_SIZE + body.len());
        let mut nonce = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut nonce);
        stream.extend_from_slice(&nonce);
        stream.extend_from_slice(&body);

        let cipher_text = link.encrypt(&stream)?;
        let parts: Vec<Vec<u8>> =
            cipher_text.chunks(SDU).map(|chunk| chunk.to_vec()).collect();

        // The map-hash salt must keep every part hash unique within the
        // collision guard window; re-salt and retry on a clash.
        let mut random_hash = [0u8; SALT_SIZE];
        let mut map_hashes = Vec::with_capacity(parts.len());
        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > MAX_SALT_ATTEMPTS {
                log::error!("resource: could not find a collision-free salt, aborting");
                return Err(CoreError::Crypto);
            }
            OsRng.fill_bytes(&mut random_hash);

            map_hashes.clear();
            let mut guard: VecDeque<[u8; MAP_HASH_SIZE]> = VecDeque::new();
            let mut collided = false;
            for part in &parts {
                let entry = map_hash(part, &random_hash);
                if guard.contains(&entry) {
                    log::debug!("resource: map hash collision, re-salting");
                    collided = true;
                    break;
                }
                guard.push_back(entry);
                if guard.len() > COLLISION_GUARD_SIZE {
                    guard.pop_front();
                }
                map_hashes.push(entry);
            }
            if !collided {
                break;
            }
        }

        let hash = Sha256Hash::of_parts(&[segment_data, &random_hash]);
        let expected_proof = Sha256Hash::of_parts(&[segment_data, hash.as_slice()]);
        let original_hash = original_hash.unwrap_or(hash);

        let advertisement_record = ResourceAdvertisement {
            transfer_size: cipher_text.len() as u64,
            data_size: total_size as u64,
            parts: parts.len() as u32,
            hash,
            random_hash,
            original_hash,
            segment_index,
            total_segments,
            flags: ResourceAdvertisement::make_flags(true, compressed, total_segments > 1),
            hashmap: slice_hashmap(&map_hashes, 0),
        };
        let advertisement = build_link_packet(
            link,
            PacketKind::Data,
            PacketContext::ResourceAdvertisement,
            &advertisement_record.pack()?,
        )?;

        let proof_packet_hash = expected_proof_packet_hash(link, &hash, &expected_proof);

        let now = Instant::now();
        let sent = vec![false; parts.len()];
        log::debug!(
            "resource {}: prepared segment {}/{} with {} parts",
            hash,
            segment_index,
            total_segments,
            parts.len()
        );
        Ok(Self {
            link_id: *link.id(),
            hash,
            random_hash,
            original_hash,
            expected_proof,
            transfer_size: cipher_text.len() as u64,
            data_size: total_size as u64,
            parts,
            map_hashes,
            sent,
            sent_parts: 0,
            compressed,
            split: total_segments > 1,
            segment_index,
            total_segments,
            status: ResourceStatus::Advertised,
            advertisement,
            proof_packet_hash,
            adv_sent_at: now,
            last_activity: now,
            last_part_sent: now,
            retries_left: MAX_RETRIES,
            rtt: None,
            fallback_rtt: link.rtt(),
            source,
        })
    }

    pub fn advertisement_packet(&self) -> Packet {
        self.advertisement
    }

    /// Serves one part request; returns the packets to transmit and a
    /// progress event when parts went out.
    pub fn serve_request(
        &mut self,
        link: &Link,
        request: &PartRequest,
    ) -> (Vec<Packet>, Option<ResourceEventKind>) {
        if self.status == ResourceStatus::Failed || request.resource_hash != self.hash {
            return (Vec::new(), None);
        }

        let now = Instant::now();
        if self.rtt.is_none() {
            self.rtt = Some(now.duration_since(self.adv_sent_at));
        }
        if self.status == ResourceStatus::Advertised {
            self.status = ResourceStatus::Transferring;
        }
        self.retries_left = MAX_RETRIES;
        self.last_activity = now;

        let mut packets = Vec::new();
        let mut served = false;
        for wanted in &request.wanted {
            let Some(index) = self.map_hashes.iter().position(|entry| entry == wanted) else {
                continue;
            };
            match build_link_packet(
                link,
                PacketKind::Data,
                PacketContext::Resource,
                &self.parts[index],
            ) {
                Ok(packet) => {
                    packets.push(packet);
                    served = true;
                    self.last_part_sent = now;
                    if !self.sent[index] {
                        self.sent[index] = true;
                        self.sent_parts += 1;
                    }
                }
                Err(err) => log::warn!("resource: could not build part packet ({})", err),
            }
        }

        if request.hashmap_exhausted {
            if let Some(packet) = self.hashmap_update_for(link, request) {
                packets.push(packet);
                self.last_activity = now;
            }
        }

        if self.sent_parts == self.parts.len() {
            self.status = ResourceStatus::AwaitingProof;
            self.last_part_sent = now;
        }

        let progress = served.then(|| ResourceEventKind::SentProgress {
            sent_parts: self.sent_parts,
            total_parts: self.parts.len(),
        });
        (packets, progress)
    }

    fn hashmap_update_for(&self, link: &Link, request: &PartRequest) -> Option<Packet> {
        let last = request.last_map_hash?;
        let found = self.map_hashes.iter().position(|entry| *entry == last)?;
        let next_index = found + 1;
        if next_index % HASHMAP_MAX_LEN != 0 {
            log::debug!("resource {}: unaligned hashmap request ignored", self.hash);
            return None;
        }
        let segment = next_index / HASHMAP_MAX_LEN;
        if segment * HASHMAP_MAX_LEN >= self.map_hashes.len() {
            return None;
        }

        let update = super::HashmapUpdate {
            resource_hash: self.hash,
            segment: segment as u32,
            hashmap: slice_hashmap(&self.map_hashes, segment),
        };
        let payload = match update.encode() {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("resource: could not encode hashmap update ({})", err);
                return None;
            }
        };
        match build_link_packet(
            link,
            PacketKind::Data,
            PacketContext::ResourceHashUpdate,
            &payload,
        ) {
            Ok(packet) => Some(packet),
            Err(err) => {
                log::warn!("resource: could not build hashmap update ({})", err);
                None
            }
        }
    }

    /// True when the proof matches; the segment is complete.
    pub fn validate_proof(&mut self, proof: &ResourceProofPayload) -> bool {
        if proof.resource_hash != self.hash || proof.proof != self.expected_proof {
            return false;
        }
        self.status = ResourceStatus::Complete;
        true
    }

    pub fn on_tick(&mut self, now: Instant) -> SenderTick {
        match self.status {
            ResourceStatus::Advertised => {
                if now.duration_since(self.adv_sent_at) < ADVERTISEMENT_TIMEOUT {
                    return SenderTick::None;
                }
                if self.retries_left == 0 {
                    log::debug!("resource {}: no requests after advertisement", self.hash);
                    self.status = ResourceStatus::Failed;
                    return SenderTick::Failed;
                }
                self.retries_left -= 1;
                self.adv_sent_at = now;
                self.last_activity = now;
                SenderTick::ResendAdvertisement(self.advertisement)
            }
            ResourceStatus::Transferring => {
                let max_wait = self.rtt() * TIMEOUT_FACTOR * u32::from(MAX_RETRIES)
                    + Duration::from_millis(SENDER_GRACE_TIME_MS);
                if now.duration_since(self.last_activity) >= max_wait {
                    log::debug!("resource {}: timed out waiting for requests", self.hash);
                    self.status = ResourceStatus::Failed;
                    return SenderTick::Failed;
                }
                SenderTick::None
            }
            ResourceStatus::AwaitingProof => {
                let wait = self.rtt() * TIMEOUT_FACTOR
                    + Duration::from_millis(SENDER_GRACE_TIME_MS);
                if now.duration_since(self.last_part_sent) < wait {
                    return SenderTick::None;
                }
                if self.retries_left == 0 {
                    log::debug!("resource {}: timed out waiting for proof", self.hash);
                    self.status = ResourceStatus::Failed;
                    return SenderTick::Failed;
                }
                self.retries_left -= 1;
                self.last_part_sent = now;
                SenderTick::QueryProofCache(self.proof_packet_hash)
            }
            _ => SenderTick::None,
        }
    }

    fn rtt(&self) -> Duration {
        self.rtt.unwrap_or(self.fallback_rtt)
    }

    pub fn active(&self) -> bool {
        self.status < ResourceStatus::Complete
    }

    pub fn hash(&self) -> &Sha256Hash {
        &self.hash
    }

    pub fn original_hash(&self) -> &Sha256Hash {
        &self.original_hash
    }

    pub fn link_id(&self) -> &LinkId {
        &self.link_id
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn segment_index(&self) -> u32 {
        self.segment_index
    }

    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn sent_parts(&self) -> usize {
        self.sent_parts
    }

    pub fn transfer_size(&self) -> u64 {
        self.transfer_size
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_split(&self) -> bool {
        self.split
    }
}

fn compress_if_smaller(data: &[u8], auto_compress: bool) -> (Vec<u8>, bool) {
    if !auto_compress || data.len() >= AUTO_COMPRESS_MAX_SIZE {
        return (data.to_vec(), false);
    }
    let mut compressed = Vec::new();
    let mut encoder = BzEncoder::new(data, Compression::best());
    if encoder.read_to_end(&mut compressed).is_err() {
        return (data.to_vec(), false);
    }
    if compressed.len() < data.len() {
        (compressed, true)
    } else {
        (data.to_vec(), false)
    }
}

fn slice_hashmap(map_hashes: &[[u8; MAP_HASH_SIZE]], segment: usize) -> Vec<u8> {
    let start = segment * HASHMAP_MAX_LEN;
    let end = usize::min((segment + 1) * HASHMAP_MAX_LEN, map_hashes.len());
    let mut out = Vec::with_capacity((end.saturating_sub(start)) * MAP_HASH_SIZE);
    for entry in &map_hashes[start.min(end)..end] {
        out.extend_from_slice(entry);
    }
    out
}

/// The receiver's eventual proof packet is fully predictable; its hash keys
/// the peer's packet cache when the proof goes missing.
fn expected_proof_packet_hash(
    link: &Link,
    hash: &Sha256Hash,
    expected_proof: &Sha256Hash,
) -> Sha256Hash {
    let payload = ResourceProofPayload { resource_hash: *hash, proof: *expected_proof };
    let packet = Packet {
        header: Header {
            destination_kind: DestinationKind::Link,
            packet_kind: PacketKind::Proof,
            ..Default::default()
        },
        transport_id: None,
        destination: *link.id(),
        context: PacketContext::ResourceProof,
        data: PacketPayload::from_slice(&payload.encode()),
    };
    packet.hash()
}
