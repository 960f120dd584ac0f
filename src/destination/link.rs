use std::time::{Duration, Instant};

use ed25519_dalek::Signature;
use rand_core::OsRng;
use tokio::sync::broadcast;

use crate::error::CoreError;
use crate::hash::TruncatedHash;
use crate::iface::IfaceId;
use crate::identity::{
    DerivedKey, Identity, PrivateIdentity, IDENTITY_KEY_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::packet::{
    DestinationKind, Header, Packet, PacketContext, PacketKind, PacketPayload, ENCRYPTED_MDU, MDU,
};
use crate::resource::{ResourceAcceptPredicate, ResourceStrategy};

use super::DestinationDesc;

pub type LinkId = TruncatedHash;

/// Time a link may sit in PENDING or HANDSHAKE before the watchdog gives up.
pub const ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(15);
/// Inbound silence on an ACTIVE link before it is considered stale.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(180);
/// Extra slack granted to a STALE link before the hard close.
pub const STALE_GRACE: Duration = Duration::from_secs(2);
pub const TIMEOUT_FACTOR: u32 = 3;
/// Receipt timeout factor for traffic on an established link.
pub const TRAFFIC_TIMEOUT_FACTOR: u32 = 6;

/// `link_request_payload = X25519_pub ‖ Ed25519_pub`
pub const LINK_REQUEST_LEN: usize = IDENTITY_KEY_SIZE;
/// `proof_payload = X25519_pub ‖ Ed25519_pub ‖ signature`
pub const LINK_PROOF_LEN: usize = IDENTITY_KEY_SIZE + SIGNATURE_SIZE;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Stale = 0x03,
    Closed = 0x04,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        *self == LinkStatus::Pending || *self == LinkStatus::Handshake
    }

    pub fn usable(&self) -> bool {
        *self == LinkStatus::Active || *self == LinkStatus::Stale
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TeardownReason {
    Timeout,
    InitiatorClosed,
    DestinationClosed,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Activated,
    Identified(Identity),
    Closed(TeardownReason),
}

#[derive(Debug, Clone)]
pub struct LinkEventData {
    pub id: LinkId,
    pub destination: TruncatedHash,
    pub event: LinkEvent,
}

/// Outcome of feeding one DATA packet into the link.
pub enum LinkInbound {
    None,
    /// The responder observed the initiator's RTT packet; the link is live.
    Activated,
    /// Decrypted application or resource traffic for the engine to route.
    Data { context: PacketContext, plaintext: Vec<u8> },
    /// Initiator keepalive; the engine answers with the echo byte.
    KeepAliveRequest,
    /// The peer proved a long-term identity over the link.
    Identified(Identity),
    Closed(TeardownReason),
}

/// What the watchdog decided at a deadline.
pub enum DeadlineAction {
    None,
    SendPackets(Vec<Packet>),
    Closed(TeardownReason),
}

pub struct Link {
    id: LinkId,
    desc: DestinationDesc,
    initiator: bool,
    ephemeral: PrivateIdentity,
    peer: Option<Identity>,
    remote_identity: Option<Identity>,
    derived: DerivedKey,
    status: LinkStatus,
    teardown_reason: Option<TeardownReason>,
    request_time: Instant,
    last_inbound: Instant,
    last_outbound: Instant,
    stale_since: Option<Instant>,
    rtt: Duration,
    proof_timeout: Duration,
    keepalive: Duration,
    attached_iface: Option<IfaceId>,
    resource_strategy: ResourceStrategy,
    resource_predicate: Option<ResourceAcceptPredicate>,
    tx: u64,
    rx: u64,
    tx_bytes: u64,
    rx_bytes: u64,
    event_tx: broadcast::Sender<LinkEventData>,
}

impl Link {
    /// Initiator-side link towards a remote SINGLE destination. Call
    /// [`Link::request`] to obtain the LINKREQUEST packet.
    pub fn new(desc: DestinationDesc, event_tx: broadcast::Sender<LinkEventData>) -> Self {
        let now = Instant::now();
        Self {
            id: LinkId::new_empty(),
            desc,
            initiator: true,
            ephemeral: PrivateIdentity::generate(OsRng),
            peer: None,
            remote_identity: None,
            derived: DerivedKey::new_empty(),
            status: LinkStatus::Pending,
            teardown_reason: None,
            request_time: now,
            last_inbound: now,
            last_outbound: now,
            stale_since: None,
            rtt: Duration::ZERO,
            proof_timeout: ESTABLISHMENT_TIMEOUT,
            keepalive: KEEPALIVE_INTERVAL,
            attached_iface: None,
            resource_strategy: ResourceStrategy::AcceptNone,
            resource_predicate: None,
            tx: 0,
            rx: 0,
            tx_bytes: 0,
            rx_bytes: 0,
            event_tx,
        }
    }

    /// Responder side: validates an incoming LINKREQUEST against the local
    /// destination and produces the link plus its LRPROOF reply. The proof
    /// signature is made with the destination's long-term identity so the
    /// initiator can authenticate the endpoint, not just the session.
    pub fn from_request(
        packet: &Packet,
        identity: &PrivateIdentity,
        desc: DestinationDesc,
        event_tx: broadcast::Sender<LinkEventData>,
    ) -> Result<(Self, Packet), CoreError> {
        let data = packet.data.as_slice();
        if data.len() < LINK_REQUEST_LEN {
            return Err(CoreError::InvalidLength);
        }

        let peer = Identity::from_bytes(&data[..LINK_REQUEST_LEN])?;
        let id = packet.truncated_hash();
        log::debug!("link {}: created from request", id);

        let now = Instant::now();
        let mut link = Self {
            id,
            desc,
            initiator: false,
            ephemeral: PrivateIdentity::generate(OsRng),
            peer: None,
            remote_identity: None,
            derived: DerivedKey::new_empty(),
            status: LinkStatus::Pending,
            teardown_reason: None,
            request_time: now,
            last_inbound: now,
            last_outbound: now,
            stale_since: None,
            rtt: Duration::ZERO,
            proof_timeout: ESTABLISHMENT_TIMEOUT,
            keepalive: KEEPALIVE_INTERVAL,
            attached_iface: None,
            resource_strategy: ResourceStrategy::AcceptNone,
            resource_predicate: None,
            tx: 0,
            rx: 0,
            tx_bytes: 0,
            rx_bytes: 0,
            event_tx,
        };
        link.handshake(peer);
        let proof = link.prove(identity);
        Ok((link, proof))
    }

    /// Builds the LINKREQUEST packet and derives the link id from it.
    pub fn request(&mut self) -> Packet {
        let mut payload = PacketPayload::new();
        let _ = payload.write(&self.ephemeral.as_identity().to_bytes());

        let packet = Packet {
            header: Header {
                packet_kind: PacketKind::LinkRequest,
                destination_kind: DestinationKind::Single,
                ..Default::default()
            },
            transport_id: None,
            destination: self.desc.address,
            context: PacketContext::None,
            data: payload,
        };

        self.status = LinkStatus::Pending;
        self.id = packet.truncated_hash();
        self.request_time = Instant::now();
        log::debug!("link {}: request created for {}", self.id, self.desc.address);

        packet
    }

    fn prove(&mut self, identity: &PrivateIdentity) -> Packet {
        let own_keys = self.ephemeral.as_identity().to_bytes();

        let mut signed = PacketPayload::new();
        let _ = signed.write(self.id.as_slice());
        let _ = signed.write(&own_keys);
        let signature = identity.sign(signed.as_slice());

        let mut payload = PacketPayload::new();
        let _ = payload.write(&own_keys);
        let _ = payload.write(&signature.to_bytes());

        Packet {
            header: Header {
                packet_kind: PacketKind::Proof,
                destination_kind: DestinationKind::Link,
                ..Default::default()
            },
            transport_id: None,
            destination: self.id,
            context: PacketContext::LinkRequestProof,
            data: payload,
        }
    }

    /// Initiator: checks the responder's LRPROOF against the destination's
    /// long-term identity, derives the session key, measures the first RTT
    /// and produces the LRRTT packet that completes the handshake.
    pub fn validate_proof(&mut self, packet: &Packet) -> Result<Packet, CoreError> {
        if !self.initiator || self.status != LinkStatus::Pending {
            return Err(CoreError::Cancelled);
        }
        let data = packet.data.as_slice();
        if data.len() < LINK_PROOF_LEN {
            return Err(CoreError::InvalidLength);
        }

        let mut signed = PacketPayload::new();
        let _ = signed.write(self.id.as_slice());
        let _ = signed.write(&data[..IDENTITY_KEY_SIZE]);
        let signature =
            Signature::from_slice(&data[IDENTITY_KEY_SIZE..IDENTITY_KEY_SIZE + SIGNATURE_SIZE])
                .map_err(|_| CoreError::Malformed)?;
        self.desc.identity.verify(signed.as_slice(), &signature)?;

        let peer = Identity::from_bytes(&data[..IDENTITY_KEY_SIZE])?;
        self.handshake(peer);

        self.rtt = self.request_time.elapsed();
        self.status = LinkStatus::Active;
        self.last_inbound = Instant::now();
        log::debug!("link {}: activated, rtt {} ms", self.id, self.rtt.as_millis());
        self.post_event(LinkEvent::Activated);

        let mut rtt_data = Vec::with_capacity(9);
        rmp::encode::write_f64(&mut rtt_data, self.rtt.as_secs_f64())
            .map_err(|_| CoreError::Malformed)?;
        self.control_packet(PacketContext::LinkRtt, &rtt_data)
    }

    /// Feeds one DATA packet addressed to this link.
    pub fn handle_packet(&mut self, packet: &Packet) -> LinkInbound {
        if packet.destination != self.id
            || packet.header.packet_kind != PacketKind::Data
            || self.status == LinkStatus::Closed
        {
            return LinkInbound::None;
        }

        // The initiator's own keepalive probe must not refresh its own
        // inbound clock when echoed back by a misbehaving relay.
        let probe_echo = self.initiator
            && packet.context == PacketContext::KeepAlive
            && packet.data.as_slice() == [0xFF];
        if !probe_echo {
            self.last_inbound = Instant::now();
            self.rx += 1;
            self.rx_bytes += packet.data.len() as u64;
            if self.status == LinkStatus::Stale {
                self.status = LinkStatus::Active;
                self.stale_since = None;
            }
        }

        match packet.context {
            PacketContext::None | PacketContext::Request | PacketContext::Response => {
                match self.decrypt(packet.data.as_slice()) {
                    Ok(plaintext) => {
                        LinkInbound::Data { context: packet.context, plaintext }
                    }
                    Err(_) => {
                        log::debug!("link {}: undecryptable data packet dropped", self.id);
                        LinkInbound::None
                    }
                }
            }

            PacketContext::LinkRtt => {
                if self.initiator || self.status != LinkStatus::Handshake {
                    return LinkInbound::None;
                }
                let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
                    return LinkInbound::None;
                };
                let Ok(peer_rtt) = rmp::decode::read_f64(&mut &plaintext[..]) else {
                    log::debug!("link {}: malformed rtt packet", self.id);
                    return LinkInbound::None;
                };
                // Clamp before converting; a hostile float must not panic us.
                let peer_rtt = if peer_rtt.is_finite() {
                    peer_rtt.clamp(0.0, 3600.0)
                } else {
                    0.0
                };
                let measured = self.request_time.elapsed();
                self.rtt = measured.max(Duration::from_secs_f64(peer_rtt));
                self.status = LinkStatus::Active;
                log::debug!("link {}: activated, rtt {} ms", self.id, self.rtt.as_millis());
                self.post_event(LinkEvent::Activated);
                LinkInbound::Activated
            }

            PacketContext::LinkClose => {
                let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
                    return LinkInbound::None;
                };
                if plaintext != self.id.as_slice() {
                    return LinkInbound::None;
                }
                let reason = if self.initiator {
                    TeardownReason::DestinationClosed
                } else {
                    TeardownReason::InitiatorClosed
                };
                self.close(reason);
                LinkInbound::Closed(reason)
            }

            PacketContext::KeepAlive => {
                let data = packet.data.as_slice();
                if !self.initiator && data == [0xFF] {
                    LinkInbound::KeepAliveRequest
                } else {
                    LinkInbound::None
                }
            }

            PacketContext::LinkIdentify => {
                let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
                    return LinkInbound::None;
                };
                match self.validate_identify(&plaintext) {
                    Ok(identity) => {
                        self.remote_identity = Some(identity);
                        self.post_event(LinkEvent::Identified(identity));
                        LinkInbound::Identified(identity)
                    }
                    Err(_) => {
                        log::debug!("link {}: invalid identify proof dropped", self.id);
                        LinkInbound::None
                    }
                }
            }

            PacketContext::Resource => LinkInbound::Data {
                context: packet.context,
                plaintext: packet.data.as_slice().to_vec(),
            },

            PacketContext::ResourceAdvertisement
            | PacketContext::ResourceRequest
            | PacketContext::ResourceHashUpdate
            | PacketContext::ResourceInitiatorCancel
            | PacketContext::ResourceReceiverCancel => {
                match self.decrypt(packet.data.as_slice()) {
                    Ok(plaintext) => {
                        LinkInbound::Data { context: packet.context, plaintext }
                    }
                    Err(_) => {
                        log::debug!("link {}: undecryptable resource control", self.id);
                        LinkInbound::None
                    }
                }
            }

            _ => LinkInbound::None,
        }
    }

    fn validate_identify(&self, plaintext: &[u8]) -> Result<Identity, CoreError> {
        if plaintext.len() < IDENTITY_KEY_SIZE + SIGNATURE_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let identity = Identity::from_bytes(&plaintext[..IDENTITY_KEY_SIZE])?;
        let signature = Signature::from_slice(
            &plaintext[IDENTITY_KEY_SIZE..IDENTITY_KEY_SIZE + SIGNATURE_SIZE],
        )
        .map_err(|_| CoreError::Malformed)?;

        let mut signed = PacketPayload::new();
        signed.append(self.id.as_slice())?.append(&plaintext[..IDENTITY_KEY_SIZE])?;
        identity.verify(signed.as_slice(), &signature)?;
        Ok(identity)
    }

    /// Proves a long-term identity to the peer over the encrypted link.
    pub fn identify(&self, identity: &PrivateIdentity) -> Result<Packet, CoreError> {
        let keys = identity.as_identity().to_bytes();
        let mut signed = PacketPayload::new();
        signed.append(self.id.as_slice())?.append(&keys)?;
        let signature = identity.sign(signed.as_slice());

        let mut plaintext = Vec::with_capacity(keys.len() + SIGNATURE_SIZE);
        plaintext.extend_from_slice(&keys);
        plaintext.extend_from_slice(&signature.to_bytes());
        self.control_packet(PacketContext::LinkIdentify, &plaintext)
    }

    /// Encrypted application data packet. Payload size is checked against
    /// the link MDU before anything is built.
    pub fn data_packet(&self, data: &[u8]) -> Result<Packet, CoreError> {
        self.control_packet(PacketContext::None, data)
    }

    /// Encrypted packet with an arbitrary context (requests, responses,
    /// resource control, link close).
    pub fn control_packet(
        &self,
        context: PacketContext,
        plaintext: &[u8],
    ) -> Result<Packet, CoreError> {
        if self.status == LinkStatus::Closed {
            return Err(CoreError::Cancelled);
        }
        if plaintext.len() > ENCRYPTED_MDU {
            return Err(CoreError::MtuExceeded);
        }

        let mut payload = PacketPayload::new();
        let token_len = {
            let token = self
                .derived
                .fernet()
                .encrypt(OsRng, plaintext, payload.whole_buffer())?;
            token.len()
        };
        payload.truncate(token_len);

        Ok(Packet {
            header: Header {
                destination_kind: DestinationKind::Link,
                packet_kind: PacketKind::Data,
                ..Default::default()
            },
            transport_id: None,
            destination: self.id,
            context,
            data: payload,
        })
    }

    /// Unencrypted packet addressed to this link; used where the payload is
    /// already ciphertext (resource parts) or must stay readable.
    pub fn plain_packet(
        &self,
        kind: PacketKind,
        context: PacketContext,
        payload: &[u8],
    ) -> Result<Packet, CoreError> {
        if self.status == LinkStatus::Closed {
            return Err(CoreError::Cancelled);
        }
        if payload.len() > MDU {
            return Err(CoreError::MtuExceeded);
        }
        Ok(Packet {
            header: Header {
                destination_kind: DestinationKind::Link,
                packet_kind: kind,
                ..Default::default()
            },
            transport_id: None,
            destination: self.id,
            context,
            data: PacketPayload::from_slice(payload),
        })
    }

    pub fn keepalive_packet(&self, byte: u8) -> Packet {
        let mut payload = PacketPayload::new();
        let _ = payload.write(&[byte]);
        Packet {
            header: Header {
                destination_kind: DestinationKind::Link,
                packet_kind: PacketKind::Data,
                ..Default::default()
            },
            transport_id: None,
            destination: self.id,
            context: PacketContext::KeepAlive,
            data: payload,
        }
    }

    /// Delivery proof for a packet received over this link, signed with the
    /// link's ephemeral key rather than any long-term identity.
    pub fn prove_packet(&self, packet: &Packet) -> Packet {
        let hash = packet.hash();
        let signature = self.ephemeral.sign(hash.as_slice());

        let mut payload = PacketPayload::new();
        let _ = payload.write(hash.as_slice());
        let _ = payload.write(&signature.to_bytes());

        Packet {
            header: Header {
                destination_kind: DestinationKind::Link,
                packet_kind: PacketKind::Proof,
                ..Default::default()
            },
            transport_id: None,
            destination: self.id,
            context: PacketContext::None,
            data: payload,
        }
    }

    /// Verifies a peer signature made with the link's ephemeral key.
    pub fn validate(&self, message: &[u8], signature: &Signature) -> Result<(), CoreError> {
        match &self.peer {
            Some(peer) => peer.verify(message, signature),
            None => Err(CoreError::MissingKey),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
        self.derived.fernet().encrypt_to_vec(OsRng, plaintext)
    }

    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CoreError> {
        self.derived.fernet().decrypt_to_vec(token)
    }

    /// Closes the link locally and, when a session exists, returns the
    /// LINKCLOSE packet to send. Idempotent: a second call is a no-op.
    pub fn teardown(&mut self) -> Option<Packet> {
        if self.status == LinkStatus::Closed {
            return None;
        }
        let id_bytes = *self.id.as_bytes();
        let close_packet = if !self.status.not_yet_active() {
            self.control_packet(PacketContext::LinkClose, &id_bytes).ok()
        } else {
            None
        };
        let reason = if self.initiator {
            TeardownReason::InitiatorClosed
        } else {
            TeardownReason::DestinationClosed
        };
        self.close(reason);
        close_packet
    }

    fn close(&mut self, reason: TeardownReason) {
        if self.status == LinkStatus::Closed {
            return;
        }
        self.status = LinkStatus::Closed;
        self.teardown_reason = Some(reason);
        self.derived = DerivedKey::new_empty();
        log::debug!("link {}: closed ({:?})", self.id, reason);
        self.post_event(LinkEvent::Closed(reason));
    }

    /// The next instant the watchdog must look at this link, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.status {
            LinkStatus::Pending | LinkStatus::Handshake => {
                Some(self.request_time + self.proof_timeout)
            }
            LinkStatus::Active => Some(self.last_inbound + self.keepalive),
            LinkStatus::Stale => self
                .stale_since
                .map(|since| since + self.rtt * TIMEOUT_FACTOR + STALE_GRACE),
            LinkStatus::Closed => None,
        }
    }

    /// Runs the state transition for an expired deadline.
    pub fn on_deadline(&mut self, now: Instant) -> DeadlineAction {
        match self.status {
            LinkStatus::Pending | LinkStatus::Handshake => {
                if now >= self.request_time + self.proof_timeout {
                    log::debug!("link {}: establishment timed out", self.id);
                    self.close(TeardownReason::Timeout);
                    DeadlineAction::Closed(TeardownReason::Timeout)
                } else {
                    DeadlineAction::None
                }
            }
            LinkStatus::Active => {
                if now >= self.last_inbound + self.keepalive {
                    self.status = LinkStatus::Stale;
                    self.stale_since = Some(now);
                    if self.initiator {
                        return DeadlineAction::SendPackets(vec![self.keepalive_packet(0xFF)]);
                    }
                }
                DeadlineAction::None
            }
            LinkStatus::Stale => {
                let deadline = self
                    .stale_since
                    .map(|since| since + self.rtt * TIMEOUT_FACTOR + STALE_GRACE);
                if deadline.is_some_and(|deadline| now >= deadline) {
                    self.close(TeardownReason::Timeout);
                    DeadlineAction::Closed(TeardownReason::Timeout)
                } else {
                    DeadlineAction::None
                }
            }
            LinkStatus::Closed => DeadlineAction::None,
        }
    }

    fn handshake(&mut self, peer: Identity) {
        self.status = LinkStatus::Handshake;
        self.derived = self
            .ephemeral
            .derive_key(&peer.public_key, Some(self.id.as_slice()));
        self.peer = Some(peer);
    }

    fn post_event(&self, event: LinkEvent) {
        let _ = self.event_tx.send(LinkEventData {
            id: self.id,
            destination: self.desc.address,
            event,
        });
    }

    /// Refreshes the inbound clock for traffic the engine routes around the
    /// link (resource proofs, packet proofs).
    pub fn touch_inbound(&mut self, bytes: usize) {
        self.last_inbound = Instant::now();
        self.rx += 1;
        self.rx_bytes += bytes as u64;
        if self.status == LinkStatus::Stale {
            self.status = LinkStatus::Active;
            self.stale_since = None;
        }
    }

    pub fn record_outbound(&mut self, bytes: usize) {
        self.tx += 1;
        self.tx_bytes += bytes as u64;
        self.last_outbound = Instant::now();
    }

    pub fn traffic_timeout(&self) -> Duration {
        self.rtt * TRAFFIC_TIMEOUT_FACTOR + Duration::from_secs(1)
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn desc(&self) -> &DestinationDesc {
        &self.desc
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        self.teardown_reason
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn remote_identity(&self) -> Option<&Identity> {
        self.remote_identity.as_ref()
    }

    pub fn resource_strategy(&self) -> ResourceStrategy {
        self.resource_strategy
    }

    pub fn set_resource_strategy(&mut self, strategy: ResourceStrategy) {
        self.resource_strategy = strategy;
    }

    pub fn set_resource_predicate(&mut self, predicate: ResourceAcceptPredicate) {
        self.resource_predicate = Some(predicate);
    }

    pub fn resource_predicate(&self) -> Option<&ResourceAcceptPredicate> {
        self.resource_predicate.as_ref()
    }

    pub fn attached_iface(&self) -> Option<IfaceId> {
        self.attached_iface
    }

    pub fn set_attached_iface(&mut self, iface: Option<IfaceId>) {
        self.attached_iface = iface;
    }

    pub fn no_inbound_for(&self) -> Duration {
        self.last_inbound.elapsed()
    }

    pub fn no_outbound_for(&self) -> Duration {
        self.last_outbound.elapsed()
    }

    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (self.tx, self.rx, self.tx_bytes, self.rx_bytes)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use tokio::sync::broadcast;

    use super::{Link, LinkInbound, LinkStatus, TeardownReason};
    use crate::destination::{DestinationDesc, DestinationName};
    use crate::error::CoreError;
    use crate::identity::PrivateIdentity;
    use crate::packet::{PacketContext, ENCRYPTED_MDU};

    fn server_identity_and_desc() -> (PrivateIdentity, DestinationDesc) {
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("example", &["link"]).expect("valid name");
        let address = name.single_address(identity.as_identity());
        let desc = DestinationDesc { identity: *identity.as_identity(), address, name };
        (identity, desc)
    }

    fn established_pair() -> (Link, Link) {
        let (server_identity, desc) = server_identity_and_desc();
        let (event_tx, _) = broadcast::channel(16);

        let mut initiator = Link::new(desc.clone(), event_tx.clone());
        let request = initiator.request();

        let (mut responder, proof) =
            Link::from_request(&request, &server_identity, desc, event_tx)
                .expect("valid request");
        assert_eq!(responder.id(), initiator.id());

        let rtt_packet = initiator.validate_proof(&proof).expect("valid proof");
        assert_eq!(initiator.status(), LinkStatus::Active);

        match responder.handle_packet(&rtt_packet) {
            LinkInbound::Activated => {}
            _ => panic!("responder should activate on rtt packet"),
        }
        assert_eq!(responder.status(), LinkStatus::Active);

        (initiator, responder)
    }

    #[test]
    fn handshake_reaches_active_on_both_ends() {
        let (initiator, responder) = established_pair();
        assert!(initiator.rtt() >= responder.rtt() || responder.rtt() >= initiator.rtt());
    }

    #[test]
    fn data_roundtrip_both_directions() {
        let (initiator, responder) = established_pair();

        let packet = initiator.data_packet(b"ping").expect("fits");
        let mut responder = responder;
        match responder.handle_packet(&packet) {
            LinkInbound::Data { context, plaintext } => {
                assert_eq!(context, PacketContext::None);
                assert_eq!(plaintext, b"ping");
            }
            _ => panic!("expected data"),
        }

        let reply = responder.data_packet(b"pong").expect("fits");
        let mut initiator = initiator;
        match initiator.handle_packet(&reply) {
            LinkInbound::Data { plaintext, .. } => assert_eq!(plaintext, b"pong"),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn oversized_payload_is_rejected_before_send() {
        let (initiator, _responder) = established_pair();
        let oversized = vec![0u8; ENCRYPTED_MDU + 1];
        assert_eq!(
            initiator.data_packet(&oversized).map(|_| ()),
            Err(CoreError::MtuExceeded)
        );
    }

    #[test]
    fn proof_with_wrong_identity_is_rejected() {
        let (_, desc) = server_identity_and_desc();
        let wrong_identity = PrivateIdentity::generate(OsRng);
        let (event_tx, _) = broadcast::channel(16);

        let mut initiator = Link::new(desc.clone(), event_tx.clone());
        let request = initiator.request();
        let (_responder, forged_proof) =
            Link::from_request(&request, &wrong_identity, desc, event_tx)
                .expect("structurally valid request");

        assert_eq!(
            initiator.validate_proof(&forged_proof).map(|_| ()),
            Err(CoreError::InvalidSignature)
        );
        assert_eq!(initiator.status(), LinkStatus::Pending);
    }

    #[test]
    fn teardown_is_idempotent_and_closes_remote() {
        let (mut initiator, mut responder) = established_pair();

        let close = initiator.teardown().expect("close packet for active link");
        assert_eq!(initiator.status(), LinkStatus::Closed);
        assert_eq!(initiator.teardown_reason(), Some(TeardownReason::InitiatorClosed));
        assert!(initiator.teardown().is_none());

        match responder.handle_packet(&close) {
            LinkInbound::Closed(TeardownReason::InitiatorClosed) => {}
            _ => panic!("responder should observe initiator close"),
        }
        assert_eq!(responder.status(), LinkStatus::Closed);
    }

    #[test]
    fn keepalive_echo_flow() {
        let (initiator, mut responder) = established_pair();
        let probe = initiator.keepalive_packet(0xFF);
        match responder.handle_packet(&probe) {
            LinkInbound::KeepAliveRequest => {}
            _ => panic!("responder should answer keepalive"),
        }

        let echo = responder.keepalive_packet(0xFE);
        let mut initiator = initiator;
        match initiator.handle_packet(&echo) {
            LinkInbound::None => {}
            _ => panic!("echo carries no event"),
        }
    }

    #[test]
    fn identify_proves_remote_identity() {
        let (initiator, mut responder) = established_pair();
        let app_identity = PrivateIdentity::generate(OsRng);
        let identify = initiator.identify(&app_identity).expect("identify packet");

        match responder.handle_packet(&identify) {
            LinkInbound::Identified(identity) => {
                assert_eq!(identity.hash, *app_identity.hash())
            }
            _ => panic!("expected identified"),
        }
        assert!(responder.remote_identity().is_some());
    }
}
