use std::io::Read;
use std::time::{Duration, Instant};

use bzip2::read::BzDecoder;

use crate::destination::link::{Link, LinkId};
use crate::error::CoreError;
use crate::hash::Sha256Hash;

use super::{
    map_hash, HashmapUpdate, PartRequest, ResourceAdvertisement, ResourceEventKind,
    ResourceProofPayload, ResourceStatus, COLLISION_GUARD_SIZE, HASHMAP_MAX_LEN,
    MAP_HASH_SIZE, MAX_RETRIES, RETRY_GRACE_TIME_MS, SALT_SIZE, SDU, TIMEOUT_FACTOR,
    WINDOW, WINDOW_FLEXIBILITY, WINDOW_MAX, WINDOW_MIN,
};

/// Upper bound on advertised part counts; anything larger than a maximally
/// split segment is hostile or corrupt.
const MAX_PARTS: usize = MAX_EFFICIENT_PARTS * 2;
const MAX_EFFICIENT_PARTS: usize = super::MAX_EFFICIENT_SIZE / SDU + 1;

pub enum PartOutcome {
    NoMatch,
    Progress {
        request_more: bool,
        progress: Option<ResourceEventKind>,
    },
    Assembled {
        data: Vec<u8>,
        proof: ResourceProofPayload,
    },
    Corrupt,
}

pub enum ReceiverTick {
    None,
    Retry,
    Failed,
}

/// Receiver side of one transfer segment.
pub struct IncomingResource {
    link_id: LinkId,
    hash: Sha256Hash,
    random_hash: [u8; SALT_SIZE],
    original_hash: Sha256Hash,
    parts: Vec<Option<Vec<u8>>>,
    hashmap: Vec<Option<[u8; MAP_HASH_SIZE]>>,
    hashmap_height: usize,
    /// Count of parts received in an unbroken run from index zero; callers
    /// can treat `parts[..consecutive_height]` as final.
    consecutive_height: usize,
    received_count: usize,
    received_bytes: u64,
    transfer_size: u64,
    data_size: u64,
    encrypted: bool,
    compressed: bool,
    split: bool,
    segment_index: u32,
    total_segments: u32,
    window: usize,
    window_max: usize,
    window_min: usize,
    outstanding: usize,
    waiting_for_hmu: bool,
    retries_left: u8,
    status: ResourceStatus,
    last_activity: Instant,
    req_sent: Instant,
    awaiting_first_part: bool,
    rtt: Option<Duration>,
    fallback_rtt: Duration,
}

impl IncomingResource {
    pub fn accept(
        advertisement: &ResourceAdvertisement,
        link_id: LinkId,
        link_rtt: Duration,
    ) -> Result<Self, CoreError> {
        let total_parts = advertisement.parts as usize;
        if total_parts == 0 || total_parts > MAX_PARTS {
            return Err(CoreError::InvalidLength);
        }

        let now = Instant::now();
        let mut receiver = Self {
            link_id,
            hash: advertisement.hash,
            random_hash: advertisement.random_hash,
            original_hash: advertisement.original_hash,
            parts: vec![None; total_parts],
            hashmap: vec![None; total_parts],
            hashmap_height: 0,
            consecutive_height: 0,
            received_count: 0,
            received_bytes: 0,
            transfer_size: advertisement.transfer_size,
            data_size: advertisement.data_size,
            encrypted: advertisement.encrypted(),
            compressed: advertisement.compressed(),
            split: advertisement.split(),
            segment_index: advertisement.segment_index,
            total_segments: advertisement.total_segments,
            window: WINDOW,
            window_max: WINDOW_MAX,
            window_min: WINDOW_MIN,
            outstanding: 0,
            waiting_for_hmu: false,
            retries_left: MAX_RETRIES,
            status: ResourceStatus::Transferring,
            last_activity: now,
            req_sent: now,
            awaiting_first_part: false,
            rtt: None,
            fallback_rtt: link_rtt,
        };
        receiver.apply_hashmap_segment(0, &advertisement.hashmap);
        Ok(receiver)
    }

    fn apply_hashmap_segment(&mut self, segment: usize, bytes: &[u8]) {
        for (offset, chunk) in bytes.chunks_exact(MAP_HASH_SIZE).enumerate() {
            let index = segment * HASHMAP_MAX_LEN + offset;
            if index >= self.hashmap.len() {
                break;
            }
            if self.hashmap[index].is_none() {
                self.hashmap_height += 1;
            }
            let mut entry = [0u8; MAP_HASH_SIZE];
            entry.copy_from_slice(chunk);
            self.hashmap[index] = Some(entry);
        }
    }

    pub fn apply_hashmap_update(&mut self, update: &HashmapUpdate) {
        if self.status == ResourceStatus::Failed {
            return;
        }
        self.apply_hashmap_segment(update.segment as usize, &update.hashmap);
        self.waiting_for_hmu = false;
        self.retries_left = MAX_RETRIES;
        self.last_activity = Instant::now();
    }

    /// Builds the next window of part requests, or flags hashmap exhaustion.
    /// Returns None when nothing is missing or an update is pending.
    pub fn next_request(&mut self) -> Option<PartRequest> {
        if self.status == ResourceStatus::Failed
            || self.waiting_for_hmu
            || self.received_count == self.parts.len()
        {
            return None;
        }

        let mut wanted = Vec::new();
        let mut exhausted = false;
        for index in self.consecutive_height..self.parts.len() {
            if wanted.len() >= self.window {
                break;
            }
            if self.parts[index].is_some() {
                continue;
            }
            match self.hashmap[index] {
                Some(entry) => wanted.push(entry),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let last_map_hash = if exhausted {
            self.waiting_for_hmu = true;
            self.hashmap_height
                .checked_sub(1)
                .and_then(|last| self.hashmap.get(last).copied().flatten())
        } else {
            None
        };

        self.outstanding = wanted.len();
        let now = Instant::now();
        self.last_activity = now;
        self.req_sent = now;
        self.awaiting_first_part = true;

        Some(PartRequest {
            hashmap_exhausted: exhausted,
            last_map_hash,
            resource_hash: self.hash,
            wanted,
        })
    }

    /// A retry shrinks the window before re-requesting; repeated timeouts
    /// also walk the ceiling down so the window stays adaptive.
    pub fn retry_request(&mut self) -> Option<PartRequest> {
        if self.window > self.window_min {
            self.window -= 1;
            if self.window_max > self.window_min {
                self.window_max -= 1;
                if self.window_max - self.window > WINDOW_FLEXIBILITY - 1 {
                    self.window_max -= 1;
                }
            }
        }
        self.waiting_for_hmu = false;
        self.next_request()
    }

    /// Feeds one raw RESOURCE part. The caller holds the link for the final
    /// assembly decryption.
    pub fn receive_part(&mut self, part: &[u8], link: &Link) -> PartOutcome {
        if self.status == ResourceStatus::Failed {
            return PartOutcome::NoMatch;
        }

        let part_hash = map_hash(part, &self.random_hash);
        let search_end =
            usize::min(self.consecutive_height + COLLISION_GUARD_SIZE, self.hashmap.len());
        let Some(index) = (self.consecutive_height..search_end)
            .find(|&candidate| self.hashmap[candidate] == Some(part_hash))
        else {
            return PartOutcome::NoMatch;
        };

        let now = Instant::now();
        self.last_activity = now;
        self.retries_left = MAX_RETRIES;
        if self.awaiting_first_part {
            self.awaiting_first_part = false;
            let measured = now.duration_since(self.req_sent);
            self.rtt = Some(self.rtt.map_or(measured, |rtt| rtt.max(measured)));
        }

        let mut progress = None;
        if self.parts[index].is_none() {
            self.received_bytes += part.len() as u64;
            self.received_count += 1;
            self.outstanding = self.outstanding.saturating_sub(1);
            self.parts[index] = Some(part.to_vec());

            while self.consecutive_height < self.parts.len()
                && self.parts[self.consecutive_height].is_some()
            {
                self.consecutive_height += 1;
            }

            progress = Some(ResourceEventKind::Progress {
                received_parts: self.received_count,
                total_parts: self.parts.len(),
                received_bytes: self.received_bytes,
                total_bytes: self.transfer_size,
            });
        }

        if self.received_count == self.parts.len() {
            return self.assemble(link);
        }

        if self.outstanding == 0 {
            // A fully served round earns a wider window.
            if self.window < self.window_max {
                self.window += 1;
                if self.window - self.window_min > WINDOW_FLEXIBILITY - 1 {
                    self.window_min += 1;
                }
            }
            return PartOutcome::Progress { request_more: true, progress };
        }

        PartOutcome::Progress { request_more: false, progress }
    }

    fn assemble(&mut self, link: &Link) -> PartOutcome {
        self.status = ResourceStatus::Assembling;

        let mut stream =
            Vec::with_capacity(self.parts.iter().map(|part| part.as_ref().map_or(0, Vec::len)).sum());
        for part in &self.parts {
            match part {
                Some(bytes) => stream.extend_from_slice(bytes),
                None => {
                    self.status = ResourceStatus::Failed;
                    return PartOutcome::Corrupt;
                }
            }
        }

        let plain = if self.encrypted {
            match link.decrypt(&stream) {
                Ok(plain) => plain,
                Err(_) => {
                    log::debug!("resource {}: stream decryption failed", self.hash);
                    self.status = ResourceStatus::Corrupt;
                    return PartOutcome::Corrupt;
                }
            }
        } else {
            stream
        };

        if plain.len() < SALT_SIZE {
            self.status = ResourceStatus::Corrupt;
            return PartOutcome::Corrupt;
        }
        let body = &plain[SALT_SIZE..];

        let data = if self.compressed {
            let mut decompressed = Vec::new();
            let mut decoder = BzDecoder::new(body);
            if decoder.read_to_end(&mut decompressed).is_err() {
                log::debug!("resource {}: decompression failed", self.hash);
                self.status = ResourceStatus::Corrupt;
                return PartOutcome::Corrupt;
            }
            decompressed
        } else {
            body.to_vec()
        };

        let computed = Sha256Hash::of_parts(&[&data, &self.random_hash]);
        if computed != self.hash {
            log::debug!("resource {}: hash mismatch after assembly", self.hash);
            self.status = ResourceStatus::Corrupt;
            return PartOutcome::Corrupt;
        }

        self.status = ResourceStatus::Complete;
        let proof = ResourceProofPayload {
            resource_hash: self.hash,
            proof: Sha256Hash::of_parts(&[&data, self.hash.as_slice()]),
        };
        PartOutcome::Assembled { data, proof }
    }

    pub fn on_tick(&mut self, now: Instant) -> ReceiverTick {
        if self.status != ResourceStatus::Transferring {
            return ReceiverTick::None;
        }
        let timeout =
            self.rtt() * TIMEOUT_FACTOR + Duration::from_millis(RETRY_GRACE_TIME_MS);
        if now.duration_since(self.last_activity) < timeout {
            return ReceiverTick::None;
        }
        if self.retries_left == 0 {
            log::debug!("resource {}: retries exhausted", self.hash);
            self.status = ResourceStatus::Failed;
            return ReceiverTick::Failed;
        }
        self.retries_left -= 1;
        ReceiverTick::Retry
    }

    fn rtt(&self) -> Duration {
        self.rtt.unwrap_or(self.fallback_rtt)
    }

    pub fn link_id(&self) -> &LinkId {
        &self.link_id
    }

    pub fn hash(&self) -> &Sha256Hash {
        &self.hash
    }

    pub fn original_hash(&self) -> &Sha256Hash {
        &self.original_hash
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn split(&self) -> bool {
        self.split
    }

    pub fn segment_index(&self) -> u32 {
        self.segment_index
    }

    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn consecutive_height(&self) -> usize {
        self.consecutive_height
    }

    pub fn received_parts(&self) -> usize {
        self.received_count
    }

    pub fn total_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Transfer completion in [0, 1].
    pub fn progress(&self) -> f32 {
        if self.parts.is_empty() {
            return 0.0;
        }
        self.received_count as f32 / self.parts.len() as f32
    }
}
