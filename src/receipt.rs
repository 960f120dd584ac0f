use std::time::{Duration, Instant};

use ed25519_dalek::Signature;

use crate::hash::{Sha256Hash, TruncatedHash, HASH_SIZE};
use crate::identity::SIGNATURE_SIZE;
use crate::packet::{DestinationKind, Packet};

/// Base receipt timeout per hop towards the destination; tuned for roughly
/// 1 kbit/s channels.
pub const TIMEOUT_PER_HOP: Duration = Duration::from_secs(5);

/// `proof = packet_hash ‖ signature`
pub const EXPLICIT_PROOF_LEN: usize = HASH_SIZE + SIGNATURE_SIZE;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ReceiptStatus {
    Failed,
    Sent,
    Delivered,
    Culled,
}

/// Tracks one outbound DATA packet until a proof arrives or the timeout
/// fires. Receipts live in the transport engine's table; applications watch
/// them through receipt events.
pub struct PacketReceipt {
    hash: Sha256Hash,
    truncated: TruncatedHash,
    destination: TruncatedHash,
    destination_kind: DestinationKind,
    sent_at: Instant,
    timeout: Duration,
    status: ReceiptStatus,
    concluded_at: Option<Instant>,
}

/// A parsed explicit proof payload, not yet verified.
pub struct ProofClaim<'a> {
    pub hash: Sha256Hash,
    pub signature: Signature,
    pub raw_hash: &'a [u8],
}

impl PacketReceipt {
    pub fn new(packet: &Packet, timeout: Duration) -> Self {
        let hash = packet.hash();
        Self {
            hash,
            truncated: hash.truncated(),
            destination: packet.destination,
            destination_kind: packet.header.destination_kind,
            sent_at: Instant::now(),
            timeout,
            status: ReceiptStatus::Sent,
            concluded_at: None,
        }
    }

    pub fn hash(&self) -> &Sha256Hash {
        &self.hash
    }

    pub fn truncated(&self) -> &TruncatedHash {
        &self.truncated
    }

    pub fn destination(&self) -> &TruncatedHash {
        &self.destination
    }

    pub fn destination_kind(&self) -> DestinationKind {
        self.destination_kind
    }

    pub fn status(&self) -> ReceiptStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReceiptStatus::Sent
    }

    /// Round-trip time of the proved packet, once delivered.
    pub fn rtt(&self) -> Option<Duration> {
        self.concluded_at.map(|at| at - self.sent_at)
    }

    pub fn mark_delivered(&mut self) {
        self.status = ReceiptStatus::Delivered;
        self.concluded_at = Some(Instant::now());
    }

    /// Transitions to FAILED when the timeout has expired; returns true on
    /// the transition so the caller fires the timeout callback exactly once.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.status != ReceiptStatus::Sent {
            return false;
        }
        if now.duration_since(self.sent_at) >= self.timeout {
            self.status = ReceiptStatus::Failed;
            self.concluded_at = Some(now);
            return true;
        }
        false
    }
}

/// Splits an explicit proof payload into its hash and signature. The
/// signature still has to be checked against whichever key the receipt's
/// destination implies.
pub fn parse_explicit_proof(payload: &[u8]) -> Option<ProofClaim<'_>> {
    if payload.len() != EXPLICIT_PROOF_LEN {
        return None;
    }
    let hash = Sha256Hash::from_slice(&payload[..HASH_SIZE]).ok()?;
    let signature = Signature::from_slice(&payload[HASH_SIZE..]).ok()?;
    Some(ProofClaim { hash, signature, raw_hash: &payload[..HASH_SIZE] })
}

/// Event emitted when a receipt concludes.
#[derive(Debug, Clone)]
pub struct ReceiptEvent {
    pub hash: Sha256Hash,
    pub truncated: TruncatedHash,
    pub destination: TruncatedHash,
    pub status: ReceiptStatus,
    pub rtt: Option<Duration>,
}

impl ReceiptEvent {
    pub fn from_receipt(receipt: &PacketReceipt) -> Self {
        Self {
            hash: *receipt.hash(),
            truncated: *receipt.truncated(),
            destination: *receipt.destination(),
            status: receipt.status(),
            rtt: receipt.rtt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rand_core::OsRng;

    use super::{parse_explicit_proof, PacketReceipt, ReceiptStatus, EXPLICIT_PROOF_LEN};
    use crate::identity::PrivateIdentity;
    use crate::packet::{Packet, PacketPayload};

    fn sample_packet() -> Packet {
        Packet { data: PacketPayload::from_slice(b"receipt me"), ..Default::default() }
    }

    #[test]
    fn timeout_fires_exactly_once() {
        let packet = sample_packet();
        let mut receipt = PacketReceipt::new(&packet, Duration::from_millis(10));
        assert!(receipt.is_pending());

        let later = Instant::now() + Duration::from_millis(20);
        assert!(receipt.check_timeout(later));
        assert_eq!(receipt.status(), ReceiptStatus::Failed);
        assert!(!receipt.check_timeout(later));
    }

    #[test]
    fn delivered_receipt_reports_rtt() {
        let packet = sample_packet();
        let mut receipt = PacketReceipt::new(&packet, Duration::from_secs(5));
        receipt.mark_delivered();
        assert_eq!(receipt.status(), ReceiptStatus::Delivered);
        assert!(receipt.rtt().is_some());
        // Delivery wins over a later timeout check.
        assert!(!receipt.check_timeout(Instant::now() + Duration::from_secs(60)));
    }

    #[test]
    fn proof_parsing_and_verification() {
        let identity = PrivateIdentity::generate(OsRng);
        let packet = sample_packet();
        let hash = packet.hash();
        let signature = identity.sign(hash.as_slice());

        let mut payload = Vec::with_capacity(EXPLICIT_PROOF_LEN);
        payload.extend_from_slice(hash.as_slice());
        payload.extend_from_slice(&signature.to_bytes());

        let claim = parse_explicit_proof(&payload).expect("well-formed proof");
        assert_eq!(claim.hash, hash);
        assert!(identity
            .as_identity()
            .verify(claim.raw_hash, &claim.signature)
            .is_ok());

        assert!(parse_explicit_proof(&payload[..EXPLICIT_PROOF_LEN - 1]).is_none());
    }
}
