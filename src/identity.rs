use std::collections::HashMap;
use std::path::Path;

use ed25519_dalek::{ed25519::signature::Signer, Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::crypt::fernet::{self, Fernet};
use crate::error::CoreError;
use crate::hash::{Sha256Hash, TruncatedHash};
use crate::packet::{
    DestinationKind, Header, Packet, PacketContext, PacketKind, PacketPayload,
};

pub const PUBLIC_KEY_SIZE: usize = 32;
/// Public identity on the wire: X25519 key followed by Ed25519 key.
pub const IDENTITY_KEY_SIZE: usize = PUBLIC_KEY_SIZE * 2;
pub const SIGNATURE_SIZE: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const DERIVED_KEY_SIZE: usize = 32;

/// Public half of an identity: an X25519 exchange key, an Ed25519 verifying
/// key, and the truncated hash of their concatenation that addresses it.
#[derive(Debug, Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub hash: TruncatedHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let hash = Sha256Hash::of_parts(&[public_key.as_bytes(), verifying_key.as_bytes()])
            .truncated();
        Self { public_key, verifying_key, hash }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < IDENTITY_KEY_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        public.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut verifying = [0u8; PUBLIC_KEY_SIZE];
        verifying.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..IDENTITY_KEY_SIZE]);

        let verifying_key =
            VerifyingKey::from_bytes(&verifying).map_err(|_| CoreError::Malformed)?;
        Ok(Self::new(PublicKey::from(public), verifying_key))
    }

    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        let mut bytes = [0u8; IDENTITY_KEY_SIZE];
        bytes[..PUBLIC_KEY_SIZE].copy_from_slice(self.public_key.as_bytes());
        bytes[PUBLIC_KEY_SIZE..].copy_from_slice(self.verifying_key.as_bytes());
        bytes
    }

    pub fn from_hex(hex_string: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(hex_string).map_err(|_| CoreError::Malformed)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), CoreError> {
        self.verifying_key
            .verify_strict(data, signature)
            .map_err(|_| CoreError::InvalidSignature)
    }

    /// Encrypts for this identity with an ephemeral exchange key; output is
    /// `ephemeral_pub ‖ token`.
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        plain: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        let ephemeral = EphemeralSecret::random_from_rng(rng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.public_key);
        let derived = DerivedKey::new(&shared, Some(self.hash.as_slice()));

        let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + fernet::token_len(plain.len()));
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&derived.fernet().encrypt_to_vec(rng, plain)?);
        Ok(out)
    }
}

/// Default is the all-zero identity; it verifies nothing and is only used as
/// a placeholder for keyless destinations.
impl Default for Identity {
    fn default() -> Self {
        Self::new(PublicKey::from([0u8; PUBLIC_KEY_SIZE]), VerifyingKey::default())
    }
}

#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    secret: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(secret: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new(PublicKey::from(&secret), sign_key.verifying_key()),
            secret,
            sign_key,
        }
    }

    pub fn generate<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let secret = StaticSecret::random_from_rng(rng);
        Self::new(secret, sign_key)
    }

    /// Deterministic identity from a seed phrase, for fixtures and tooling.
    pub fn from_name(name: &str) -> Self {
        let exchange_seed = Sha256Hash::of(name.as_bytes());
        let sign_seed = Sha256Hash::of(exchange_seed.as_slice());
        Self::new(
            StaticSecret::from(exchange_seed.to_bytes()),
            SigningKey::from_bytes(sign_seed.as_bytes()),
        )
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() != IDENTITY_KEY_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let mut secret = [0u8; PUBLIC_KEY_SIZE];
        secret.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut sign = [0u8; PUBLIC_KEY_SIZE];
        sign.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Ok(Self::new(StaticSecret::from(secret), SigningKey::from_bytes(&sign)))
    }

    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        let mut bytes = [0u8; IDENTITY_KEY_SIZE];
        bytes[..PUBLIC_KEY_SIZE].copy_from_slice(self.secret.as_bytes());
        bytes[PUBLIC_KEY_SIZE..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    pub fn from_hex(hex_string: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(hex_string).map_err(|_| CoreError::Malformed)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn hash(&self) -> &TruncatedHash {
        &self.identity.hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.sign_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), CoreError> {
        self.identity.verify(data, signature)
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        DerivedKey::new(&self.secret.diffie_hellman(public_key), salt)
    }

    /// Inverse of [`Identity::encrypt`]. Any authentication failure is folded
    /// into a single error value; callers log and drop.
    pub fn decrypt(&self, cipher_text: &[u8]) -> Result<Vec<u8>, CoreError> {
        if cipher_text.len() <= PUBLIC_KEY_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
        ephemeral.copy_from_slice(&cipher_text[..PUBLIC_KEY_SIZE]);
        let shared = self.secret.diffie_hellman(&PublicKey::from(ephemeral));
        let derived = DerivedKey::new(&shared, Some(self.identity.hash.as_slice()));
        derived.fernet().decrypt_to_vec(&cipher_text[PUBLIC_KEY_SIZE..])
    }

    /// Builds the delivery proof for a received packet: a PROOF packet
    /// addressed to the packet's truncated hash, carrying
    /// `packet_hash ‖ signature(packet_hash)`.
    pub fn prove(&self, packet: &Packet) -> Packet {
        let hash = packet.hash();
        let signature = self.sign(hash.as_slice());

        let mut payload = PacketPayload::new();
        let _ = payload.write(hash.as_slice());
        let _ = payload.write(&signature.to_bytes());

        Packet {
            header: Header {
                destination_kind: DestinationKind::Single,
                packet_kind: PacketKind::Proof,
                ..Default::default()
            },
            transport_id: None,
            destination: hash.truncated(),
            context: PacketContext::None,
            data: payload,
        }
    }
}

/// 32-byte HKDF-SHA256 expansion of an X25519 shared secret.
pub struct DerivedKey {
    key: [u8; DERIVED_KEY_SIZE],
}

impl DerivedKey {
    pub fn new(shared: &SharedSecret, salt: Option<&[u8]>) -> Self {
        let mut key = [0u8; DERIVED_KEY_SIZE];
        let _ = Hkdf::<Sha256>::new(salt, shared.as_bytes()).expand(&[], &mut key);
        Self { key }
    }

    pub fn new_empty() -> Self {
        Self { key: [0u8; DERIVED_KEY_SIZE] }
    }

    pub fn fernet(&self) -> Fernet {
        Fernet::from_derived_key(&self.key)
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_SIZE] {
        &self.key
    }
}

/// One remembered peer, learned from a validated announce.
#[derive(Debug, Clone)]
pub struct KnownPeer {
    pub first_seen: u64,
    pub packet_hash: Sha256Hash,
    pub public_key: [u8; IDENTITY_KEY_SIZE],
    pub app_data: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPeer {
    destination: ByteBuf,
    first_seen: u64,
    packet_hash: ByteBuf,
    public_key: ByteBuf,
    app_data: Option<ByteBuf>,
}

/// Table of destinations whose identities this node has observed. Replaying
/// an announce never rewinds `first_seen`.
#[derive(Default)]
pub struct KnownDestinations {
    peers: HashMap<TruncatedHash, KnownPeer>,
}

impl KnownDestinations {
    pub fn new() -> Self {
        Self { peers: HashMap::new() }
    }

    /// Returns true when the destination was not known before.
    pub fn remember(
        &mut self,
        destination: TruncatedHash,
        packet_hash: Sha256Hash,
        public_key: [u8; IDENTITY_KEY_SIZE],
        app_data: Option<&[u8]>,
        now_secs: u64,
    ) -> bool {
        match self.peers.get_mut(&destination) {
            Some(peer) => {
                peer.packet_hash = packet_hash;
                peer.public_key = public_key;
                peer.app_data = app_data.map(|data| data.to_vec());
                false
            }
            None => {
                self.peers.insert(
                    destination,
                    KnownPeer {
                        first_seen: now_secs,
                        packet_hash,
                        public_key,
                        app_data: app_data.map(|data| data.to_vec()),
                    },
                );
                true
            }
        }
    }

    pub fn recall(&self, destination: &TruncatedHash) -> Option<Identity> {
        let peer = self.peers.get(destination)?;
        Identity::from_bytes(&peer.public_key).ok()
    }

    pub fn recall_app_data(&self, destination: &TruncatedHash) -> Option<&[u8]> {
        self.peers.get(destination)?.app_data.as_deref()
    }

    pub fn entry(&self, destination: &TruncatedHash) -> Option<&KnownPeer> {
        self.peers.get(destination)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CoreError> {
        let persisted: Vec<PersistedPeer> = self
            .peers
            .iter()
            .map(|(destination, peer)| PersistedPeer {
                destination: ByteBuf::from(destination.as_slice().to_vec()),
                first_seen: peer.first_seen,
                packet_hash: ByteBuf::from(peer.packet_hash.as_slice().to_vec()),
                public_key: ByteBuf::from(peer.public_key.to_vec()),
                app_data: peer.app_data.as_ref().map(|data| ByteBuf::from(data.clone())),
            })
            .collect();

        let encoded = rmp_serde::to_vec(&persisted).map_err(|_| CoreError::Io)?;
        std::fs::write(path, encoded).map_err(|_| CoreError::Io)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let data = std::fs::read(path).map_err(|_| CoreError::Io)?;
        let persisted: Vec<PersistedPeer> =
            rmp_serde::from_slice(&data).map_err(|_| CoreError::Malformed)?;

        let mut peers = HashMap::with_capacity(persisted.len());
        for entry in persisted {
            let destination = TruncatedHash::from_slice(&entry.destination)?;
            if entry.public_key.len() != IDENTITY_KEY_SIZE {
                return Err(CoreError::Malformed);
            }
            let mut public_key = [0u8; IDENTITY_KEY_SIZE];
            public_key.copy_from_slice(&entry.public_key);
            peers.insert(
                destination,
                KnownPeer {
                    first_seen: entry.first_seen,
                    packet_hash: Sha256Hash::from_slice(&entry.packet_hash)?,
                    public_key,
                    app_data: entry.app_data.map(|data| data.into_vec()),
                },
            );
        }
        Ok(Self { peers })
    }
}

/// Seconds since the Unix epoch, as used in announce timestamps and the
/// known-destination table.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{Identity, KnownDestinations, PrivateIdentity, IDENTITY_KEY_SIZE};
    use crate::hash::Sha256Hash;

    #[test]
    fn identity_hash_survives_serialization() {
        let private = PrivateIdentity::generate(OsRng);
        let identity = *private.as_identity();
        let restored = Identity::from_bytes(&identity.to_bytes()).expect("valid identity");
        assert_eq!(identity.hash, restored.hash);
    }

    #[test]
    fn private_identity_hex_roundtrip() {
        let original = PrivateIdentity::generate(OsRng);
        let restored = PrivateIdentity::from_hex(&original.to_hex()).expect("valid identity");
        assert_eq!(original.to_bytes(), restored.to_bytes());
        assert_eq!(original.hash(), restored.hash());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let receiver = PrivateIdentity::generate(OsRng);
        let plain = b"sealed for a public key";
        let cipher = receiver.as_identity().encrypt(OsRng, plain).expect("encrypt");
        let decrypted = receiver.decrypt(&cipher).expect("decrypt");
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn decrypt_rejects_tampering() {
        let receiver = PrivateIdentity::generate(OsRng);
        let mut cipher =
            receiver.as_identity().encrypt(OsRng, b"do not touch").expect("encrypt");
        let last = cipher.len() - 1;
        cipher[last] ^= 0x80;
        assert!(receiver.decrypt(&cipher).is_err());
    }

    #[test]
    fn sign_and_verify() {
        let private = PrivateIdentity::generate(OsRng);
        let message = b"signed message";
        let signature = private.sign(message);
        assert!(private.as_identity().verify(message, &signature).is_ok());
        assert!(private.as_identity().verify(b"other message", &signature).is_err());
    }

    #[test]
    fn known_destinations_keep_first_seen() {
        let identity = PrivateIdentity::generate(OsRng);
        let destination = *identity.hash();
        let key = identity.as_identity().to_bytes();
        let mut table = KnownDestinations::new();

        assert!(table.remember(destination, Sha256Hash::of(b"a"), key, Some(b"one"), 100));
        assert!(!table.remember(destination, Sha256Hash::of(b"b"), key, Some(b"two"), 200));

        let entry = table.entry(&destination).expect("remembered");
        assert_eq!(entry.first_seen, 100);
        assert_eq!(entry.app_data.as_deref(), Some(&b"two"[..]));
        assert_eq!(
            table.recall(&destination).expect("recallable").hash,
            destination
        );
    }

    #[test]
    fn known_destinations_persistence() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("known_destinations");

        let identity = PrivateIdentity::generate(OsRng);
        let mut table = KnownDestinations::new();
        table.remember(
            *identity.hash(),
            Sha256Hash::of(b"announce"),
            identity.as_identity().to_bytes(),
            Some(b"Peach"),
            42,
        );
        table.save(&path).expect("save");

        let restored = KnownDestinations::load(&path).expect("load");
        assert_eq!(restored.len(), 1);
        let entry = restored.entry(identity.hash()).expect("entry");
        assert_eq!(entry.first_seen, 42);
        assert_eq!(entry.public_key.len(), IDENTITY_KEY_SIZE);
        assert_eq!(entry.app_data.as_deref(), Some(&b"Peach"[..]));
    }
}
