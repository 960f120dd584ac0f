use core::fmt;

use crate::buffer::FixedBuffer;
use crate::crypt::fernet;
use crate::error::CoreError;
use crate::hash::{Sha256Hash, TruncatedHash, TRUNCATED_HASH_SIZE};

/// Default interface frame size. Interfaces may advertise more, never less.
pub const MTU: usize = 500;

/// flags + hops + transport id + destination hash + context
pub const HEADER_MAX_SIZE: usize = 2 + TRUNCATED_HASH_SIZE * 2 + 1;
/// flags + hops + destination hash + context
pub const HEADER_MIN_SIZE: usize = 2 + TRUNCATED_HASH_SIZE + 1;

/// Payload budget for an unencrypted packet with the largest header.
pub const MDU: usize = MTU - HEADER_MAX_SIZE;

/// Payload budget for symmetric-encrypted data packets: the plaintext must
/// survive PKCS#7 padding and the token overhead inside MDU.
pub const ENCRYPTED_MDU: usize =
    ((MDU - fernet::TOKEN_OVERHEAD) / fernet::BLOCK_SIZE) * fernet::BLOCK_SIZE - 1;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderKind {
    /// Normal header.
    Header1 = 0b00,
    /// In-transport header carrying a next-hop transport id.
    Header2 = 0b01,
    Header3 = 0b10,
    Header4 = 0b11,
}

impl From<u8> for HeaderKind {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => HeaderKind::Header2,
            0b10 => HeaderKind::Header3,
            0b11 => HeaderKind::Header4,
            _ => HeaderKind::Header1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TransportKind {
    Broadcast = 0b00,
    Transport = 0b01,
    Relay = 0b10,
    Tunnel = 0b11,
}

impl From<u8> for TransportKind {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => TransportKind::Transport,
            0b10 => TransportKind::Relay,
            0b11 => TransportKind::Tunnel,
            _ => TransportKind::Broadcast,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationKind {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl From<u8> for DestinationKind {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => DestinationKind::Group,
            0b10 => DestinationKind::Plain,
            0b11 => DestinationKind::Link,
            _ => DestinationKind::Single,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketKind {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for PacketKind {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PacketKind::Announce,
            0b10 => PacketKind::LinkRequest,
            0b11 => PacketKind::Proof,
            _ => PacketKind::Data,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    Resource = 0x01,
    ResourceAdvertisement = 0x02,
    ResourceRequest = 0x03,
    ResourceHashUpdate = 0x04,
    ResourceProof = 0x05,
    ResourceInitiatorCancel = 0x06,
    ResourceReceiverCancel = 0x07,
    CacheRequest = 0x08,
    Request = 0x09,
    Response = 0x0A,
    PathResponse = 0x0B,
    Command = 0x0C,
    CommandStatus = 0x0D,
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRtt = 0xFE,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketContext::Resource,
            0x02 => PacketContext::ResourceAdvertisement,
            0x03 => PacketContext::ResourceRequest,
            0x04 => PacketContext::ResourceHashUpdate,
            0x05 => PacketContext::ResourceProof,
            0x06 => PacketContext::ResourceInitiatorCancel,
            0x07 => PacketContext::ResourceReceiverCancel,
            0x08 => PacketContext::CacheRequest,
            0x09 => PacketContext::Request,
            0x0A => PacketContext::Response,
            0x0B => PacketContext::PathResponse,
            0x0C => PacketContext::Command,
            0x0D => PacketContext::CommandStatus,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFE => PacketContext::LinkRtt,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

/// Decomposed flag byte plus the hop counter.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub header_kind: HeaderKind,
    pub transport_kind: TransportKind,
    pub destination_kind: DestinationKind,
    pub packet_kind: PacketKind,
    pub hops: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            header_kind: HeaderKind::Header1,
            transport_kind: TransportKind::Broadcast,
            destination_kind: DestinationKind::Single,
            packet_kind: PacketKind::Data,
            hops: 0,
        }
    }
}

impl Header {
    pub fn to_flags(&self) -> u8 {
        (self.header_kind as u8) << 6
            | (self.transport_kind as u8) << 4
            | (self.destination_kind as u8) << 2
            | self.packet_kind as u8
    }

    pub fn from_flags(flags: u8) -> Self {
        Self {
            header_kind: HeaderKind::from(flags >> 6),
            transport_kind: TransportKind::from(flags >> 4),
            destination_kind: DestinationKind::from(flags >> 2),
            packet_kind: PacketKind::from(flags),
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0>2b}{:0>2b}{:0>2b}{:0>2b}.{}",
            self.header_kind as u8,
            self.transport_kind as u8,
            self.destination_kind as u8,
            self.packet_kind as u8,
            self.hops,
        )
    }
}

pub type PacketPayload = FixedBuffer<MDU>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Packet {
    pub header: Header,
    pub transport_id: Option<TruncatedHash>,
    pub destination: TruncatedHash,
    pub context: PacketContext,
    pub data: PacketPayload,
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < HEADER_MIN_SIZE {
            return Err(CoreError::Malformed);
        }
        if bytes.len() > MTU {
            return Err(CoreError::MtuExceeded);
        }

        let mut header = Header::from_flags(bytes[0]);
        header.hops = bytes[1];

        let mut index = 2;
        let transport_id = if header.header_kind == HeaderKind::Header2 {
            if bytes.len() < HEADER_MAX_SIZE {
                return Err(CoreError::Malformed);
            }
            let id = TruncatedHash::from_slice(&bytes[index..index + TRUNCATED_HASH_SIZE])?;
            index += TRUNCATED_HASH_SIZE;
            Some(id)
        } else {
            None
        };

        if bytes.len() < index + TRUNCATED_HASH_SIZE + 1 {
            return Err(CoreError::Malformed);
        }
        let destination = TruncatedHash::from_slice(&bytes[index..index + TRUNCATED_HASH_SIZE])?;
        index += TRUNCATED_HASH_SIZE;
        let context = PacketContext::from(bytes[index]);
        index += 1;

        Ok(Self {
            header,
            transport_id,
            destination,
            context,
            data: PacketPayload::from_slice(&bytes[index..]),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::with_capacity(HEADER_MAX_SIZE + self.data.len());
        out.push(self.header.to_flags());
        out.push(self.header.hops);

        if self.header.header_kind == HeaderKind::Header2 {
            let transport_id = self.transport_id.ok_or(CoreError::Malformed)?;
            out.extend_from_slice(transport_id.as_slice());
        }

        out.extend_from_slice(self.destination.as_slice());
        out.push(self.context as u8);
        out.extend_from_slice(self.data.as_slice());

        if out.len() > MTU {
            return Err(CoreError::MtuExceeded);
        }
        Ok(out)
    }

    /// Hash over the forwarding-invariant portion of the packet: the flag
    /// byte with the header and transport bits masked out, then everything
    /// from the destination hash onward. Hops and transport id never count.
    pub fn hash(&self) -> Sha256Hash {
        Sha256Hash::of_parts(&[
            &[self.header.to_flags() & 0b0000_1111],
            self.destination.as_slice(),
            &[self.context as u8],
            self.data.as_slice(),
        ])
    }

    pub fn truncated_hash(&self) -> TruncatedHash {
        self.hash().truncated()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Header::default(),
            transport_id: None,
            destination: TruncatedHash::new_empty(),
            context: PacketContext::None,
            data: PacketPayload::new(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;
        if let Some(transport_id) = self.transport_id {
            write!(f, " via {}", transport_id)?;
        }
        write!(f, " {} {}B]", self.destination, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DestinationKind, Header, HeaderKind, Packet, PacketContext, PacketKind, PacketPayload,
        TransportKind, ENCRYPTED_MDU, MDU, MTU,
    };
    use crate::error::CoreError;
    use crate::hash::TruncatedHash;

    fn sample_packet() -> Packet {
        Packet {
            header: Header {
                packet_kind: PacketKind::Data,
                destination_kind: DestinationKind::Link,
                ..Default::default()
            },
            transport_id: None,
            destination: TruncatedHash::of(b"destination"),
            context: PacketContext::Resource,
            data: PacketPayload::from_slice(&[0xAB; 64]),
        }
    }

    #[test]
    fn flag_byte_roundtrip() {
        for flags in 0u8..=0xFF {
            let header = Header::from_flags(flags);
            assert_eq!(header.to_flags(), flags);
        }
    }

    #[test]
    fn wire_roundtrip() {
        let packet = sample_packet();
        let bytes = packet.to_bytes().expect("serializable");
        let decoded = Packet::from_bytes(&bytes).expect("parseable");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn wire_roundtrip_with_transport_id() {
        let mut packet = sample_packet();
        packet.header.header_kind = HeaderKind::Header2;
        packet.header.transport_kind = TransportKind::Transport;
        packet.transport_id = Some(TruncatedHash::of(b"next hop"));

        let bytes = packet.to_bytes().expect("serializable");
        let decoded = Packet::from_bytes(&bytes).expect("parseable");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn header2_without_transport_id_fails() {
        let mut packet = sample_packet();
        packet.header.header_kind = HeaderKind::Header2;
        assert_eq!(packet.to_bytes(), Err(CoreError::Malformed));
    }

    #[test]
    fn hash_ignores_forwarding_fields() {
        let packet = sample_packet();
        let mut forwarded = packet;
        forwarded.header.hops = 7;
        forwarded.header.header_kind = HeaderKind::Header2;
        forwarded.header.transport_kind = TransportKind::Transport;
        forwarded.transport_id = Some(TruncatedHash::of(b"somewhere else"));

        assert_eq!(packet.hash(), forwarded.hash());

        let mut different = packet;
        different.context = PacketContext::ResourceRequest;
        assert_ne!(packet.hash(), different.hash());
    }

    #[test]
    fn full_payload_stays_within_mtu() {
        let mut packet = sample_packet();
        packet.data = PacketPayload::from_slice(&[0x55; MDU]);
        let bytes = packet.to_bytes().expect("serializable");
        assert!(bytes.len() <= MTU);
    }

    #[test]
    fn mdu_constants_are_consistent() {
        assert_eq!(MDU, 477);
        assert_eq!(ENCRYPTED_MDU, 415);
    }
}
