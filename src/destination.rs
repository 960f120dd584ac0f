pub mod link;

use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

use ed25519_dalek::Signature;
use rand_core::CryptoRngCore;

use crate::crypt::fernet::Fernet;
use crate::error::CoreError;
use crate::hash::TruncatedHash;
use crate::identity::{
    now_secs, Identity, PrivateIdentity, IDENTITY_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::packet::{
    DestinationKind, Header, Packet, PacketContext, PacketKind, PacketPayload,
};

pub const RANDOM_HASH_SIZE: usize = 10;
pub const MIN_ANNOUNCE_LEN: usize = IDENTITY_KEY_SIZE + RANDOM_HASH_SIZE + SIGNATURE_SIZE;

//***************************************************************************//

pub trait Direction {}

pub struct In;
pub struct Out;

impl Direction for In {}
impl Direction for Out {}

pub trait Kind {
    fn destination_kind() -> DestinationKind;
}

pub struct Single;
pub struct Group;
pub struct Plain;

impl Kind for Single {
    fn destination_kind() -> DestinationKind {
        DestinationKind::Single
    }
}

impl Kind for Group {
    fn destination_kind() -> DestinationKind {
        DestinationKind::Group
    }
}

impl Kind for Plain {
    fn destination_kind() -> DestinationKind {
        DestinationKind::Plain
    }
}

//***************************************************************************//

/// Dot-joined destination name. Components must be non-empty and dot-free;
/// violating either is a configuration error surfaced at construction.
#[derive(Clone)]
pub struct DestinationName {
    name: String,
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &[&str]) -> Result<Self, CoreError> {
        validate_component(app_name)?;
        let mut name = String::from(app_name);
        for aspect in aspects {
            validate_component(aspect)?;
            name.push('.');
            name.push_str(aspect);
        }
        Ok(Self { name })
    }

    /// Parses a pre-joined name such as `"example.fruits"`.
    pub fn from_dotted(dotted: &str) -> Result<Self, CoreError> {
        let mut parts = dotted.split('.');
        let app_name = parts.next().ok_or(CoreError::InvalidName)?;
        let aspects: Vec<&str> = parts.collect();
        Self::new(app_name, &aspects)
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Address of the keyless rendition of this name (PLAIN and GROUP
    /// destinations).
    pub fn plain_address(&self) -> TruncatedHash {
        TruncatedHash::of(self.name.as_bytes())
    }

    /// Address of this name owned by `identity`: the identity hash hex is
    /// appended as a final aspect before hashing.
    pub fn single_address(&self, identity: &Identity) -> TruncatedHash {
        let full = format!("{}.{}", self.name, identity.hash.to_hex());
        TruncatedHash::of(full.as_bytes())
    }
}

fn validate_component(component: &str) -> Result<(), CoreError> {
    if component.is_empty() || component.contains('.') {
        return Err(CoreError::InvalidName);
    }
    Ok(())
}

impl fmt::Display for DestinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Identity-and-address summary of a destination, the form passed around the
/// engine and kept by links.
#[derive(Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address: TruncatedHash,
    pub name: DestinationName,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.address)
    }
}

//***************************************************************************//

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ProofStrategy {
    ProveNone,
    ProveApp,
    ProveAll,
}

/// Consulted for `ProveApp`: return true to emit a delivery proof.
pub type ProofPredicate = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum RequestPolicy {
    AllowNone,
    AllowAll,
    /// Identity hashes permitted to invoke the handler. Requests from links
    /// whose peer has not identified itself are refused.
    AllowList(Vec<TruncatedHash>),
}

/// `(path, request_data, remote_identity) -> response`. A `None` response
/// means the request is serviced silently.
pub type RequestHandlerFn =
    Arc<dyn Fn(&str, &[u8], Option<&Identity>) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
pub struct RequestHandlerEntry {
    pub path: String,
    pub path_hash: TruncatedHash,
    pub policy: RequestPolicy,
    pub handler: RequestHandlerFn,
}

//***************************************************************************//

/// Pre-shared 32-byte key for GROUP destinations; both halves feed the
/// fernet envelope.
#[derive(Clone)]
pub struct GroupKey([u8; 32]);

impl GroupKey {
    pub fn generate<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn fernet(&self) -> Fernet {
        Fernet::from_derived_key(&self.0)
    }
}

/// Keyless marker identity for PLAIN destinations.
pub struct NoIdentity;

//***************************************************************************//

pub struct Destination<I, D: Direction, K: Kind> {
    direction: PhantomData<D>,
    kind: PhantomData<K>,
    pub identity: I,
    pub desc: DestinationDesc,
    proof_strategy: ProofStrategy,
    proof_predicate: Option<ProofPredicate>,
    request_handlers: Vec<RequestHandlerEntry>,
}

pub type SingleInputDestination = Destination<PrivateIdentity, In, Single>;
pub type SingleOutputDestination = Destination<Identity, Out, Single>;
pub type GroupInputDestination = Destination<GroupKey, In, Group>;
pub type GroupOutputDestination = Destination<GroupKey, Out, Group>;
pub type PlainInputDestination = Destination<NoIdentity, In, Plain>;
pub type PlainOutputDestination = Destination<NoIdentity, Out, Plain>;

impl<I, D: Direction, K: Kind> Destination<I, D, K> {
    pub fn destination_kind(&self) -> DestinationKind {
        <K as Kind>::destination_kind()
    }

    pub fn address(&self) -> &TruncatedHash {
        &self.desc.address
    }

    pub fn proof_strategy(&self) -> ProofStrategy {
        self.proof_strategy
    }

    pub fn set_proof_strategy(&mut self, strategy: ProofStrategy) {
        self.proof_strategy = strategy;
    }

    pub fn set_proof_predicate(&mut self, predicate: ProofPredicate) {
        self.proof_predicate = Some(predicate);
    }

    pub fn proof_predicate(&self) -> Option<&ProofPredicate> {
        self.proof_predicate.as_ref()
    }

    fn with_identity(identity: I, desc: DestinationDesc) -> Self {
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc,
            proof_strategy: ProofStrategy::ProveNone,
            proof_predicate: None,
            request_handlers: Vec::new(),
        }
    }
}

impl SingleInputDestination {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let address = name.single_address(identity.as_identity());
        let desc = DestinationDesc { identity: *identity.as_identity(), address, name };
        Self::with_identity(identity, desc)
    }

    /// Builds a signed announce revealing this destination's public keys.
    ///
    /// Payload: `public_key ‖ random_hash ‖ signature [‖ app_data]`, where
    /// the random hash is five random bytes followed by a five-byte
    /// big-endian unix timestamp so stale replays are detectable, and the
    /// signature covers `address ‖ public_key ‖ random_hash ‖ app_data`.
    pub fn announce<R: CryptoRngCore>(
        &self,
        mut rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, CoreError> {
        let mut random_hash = [0u8; RANDOM_HASH_SIZE];
        rng.fill_bytes(&mut random_hash[..RANDOM_HASH_SIZE / 2]);
        let emitted = now_secs().to_be_bytes();
        random_hash[RANDOM_HASH_SIZE / 2..].copy_from_slice(&emitted[3..8]);

        let public_key = self.identity.as_identity().to_bytes();

        let mut signed = PacketPayload::new();
        signed
            .append(self.desc.address.as_slice())?
            .append(&public_key)?
            .append(&random_hash)?;
        if let Some(data) = app_data {
            signed.append(data)?;
        }
        let signature = self.identity.sign(signed.as_slice());

        let mut payload = PacketPayload::new();
        payload
            .append(&public_key)?
            .append(&random_hash)?
            .append(&signature.to_bytes())?;
        if let Some(data) = app_data {
            payload.append(data)?;
        }

        Ok(Packet {
            header: Header {
                destination_kind: DestinationKind::Single,
                packet_kind: PacketKind::Announce,
                ..Default::default()
            },
            transport_id: None,
            destination: self.desc.address,
            context: PacketContext::None,
            data: payload,
        })
    }

    /// An announce emitted in reply to a path request.
    pub fn path_response<R: CryptoRngCore>(
        &self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, CoreError> {
        let mut announce = self.announce(rng, app_data)?;
        announce.context = PacketContext::PathResponse;
        Ok(announce)
    }

    pub fn decrypt(&self, cipher_text: &[u8]) -> Result<Vec<u8>, CoreError> {
        self.identity.decrypt(cipher_text)
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.identity.sign(data)
    }

    pub fn register_request_handler(
        &mut self,
        path: &str,
        handler: RequestHandlerFn,
        policy: RequestPolicy,
    ) {
        let path_hash = TruncatedHash::of(path.as_bytes());
        self.request_handlers
            .retain(|entry| entry.path_hash != path_hash);
        self.request_handlers.push(RequestHandlerEntry {
            path: path.to_string(),
            path_hash,
            policy,
            handler,
        });
    }

    pub fn deregister_request_handler(&mut self, path: &str) {
        let path_hash = TruncatedHash::of(path.as_bytes());
        self.request_handlers.retain(|entry| entry.path_hash != path_hash);
    }

    /// Dispatches a request received over a link to the registered handler,
    /// enforcing its policy against the remote identity (if any).
    pub fn respond_to_request(
        &self,
        path_hash: &TruncatedHash,
        request_data: &[u8],
        remote: Option<&Identity>,
    ) -> Option<Vec<u8>> {
        let entry = self
            .request_handlers
            .iter()
            .find(|entry| entry.path_hash == *path_hash)?;

        let allowed = match &entry.policy {
            RequestPolicy::AllowNone => false,
            RequestPolicy::AllowAll => true,
            RequestPolicy::AllowList(list) => match remote {
                Some(identity) => list.contains(&identity.hash),
                None => false,
            },
        };
        if !allowed {
            log::debug!(
                "destination {}: refused request for {}",
                self.desc.address,
                entry.path
            );
            return None;
        }

        (entry.handler)(&entry.path, request_data, remote)
    }
}

impl SingleOutputDestination {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address = name.single_address(&identity);
        let desc = DestinationDesc { identity, address, name };
        Self::with_identity(identity, desc)
    }

    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        plain: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        self.identity.encrypt(rng, plain)
    }
}

impl<D: Direction> Destination<GroupKey, D, Group> {
    pub fn new(key: GroupKey, name: DestinationName) -> Self {
        let address = name.plain_address();
        let desc = DestinationDesc { identity: Identity::default(), address, name };
        Self::with_identity(key, desc)
    }

    pub fn encrypt<R: CryptoRngCore>(
        &self,
        rng: R,
        plain: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        self.identity.fernet().encrypt_to_vec(rng, plain)
    }

    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CoreError> {
        self.identity.fernet().decrypt_to_vec(token)
    }
}

impl<D: Direction> Destination<NoIdentity, D, Plain> {
    pub fn new(name: DestinationName) -> Self {
        let address = name.plain_address();
        let desc = DestinationDesc { identity: Identity::default(), address, name };
        Self::with_identity(NoIdentity, desc)
    }
}

//***************************************************************************//

/// A successfully validated announce.
pub struct AnnounceInfo<'a> {
    pub identity: Identity,
    pub random_hash: [u8; RANDOM_HASH_SIZE],
    pub app_data: &'a [u8],
}

impl<'a> AnnounceInfo<'a> {
    /// The unix timestamp embedded in the announce randomness.
    pub fn emitted_secs(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[3..8].copy_from_slice(&self.random_hash[RANDOM_HASH_SIZE / 2..]);
        u64::from_be_bytes(bytes)
    }
}

/// Checks an ANNOUNCE packet's signature against the identity it carries.
/// Nothing about the destination name can be recovered here; aspect matching
/// happens in the announce-handler registry.
pub fn validate_announce(packet: &Packet) -> Result<AnnounceInfo<'_>, CoreError> {
    if packet.header.packet_kind != PacketKind::Announce {
        return Err(CoreError::Malformed);
    }

    let data = packet.data.as_slice();
    if data.len() < MIN_ANNOUNCE_LEN {
        return Err(CoreError::InvalidLength);
    }

    let identity = Identity::from_bytes(&data[..IDENTITY_KEY_SIZE])?;

    let mut offset = IDENTITY_KEY_SIZE;
    let mut random_hash = [0u8; RANDOM_HASH_SIZE];
    random_hash.copy_from_slice(&data[offset..offset + RANDOM_HASH_SIZE]);
    offset += RANDOM_HASH_SIZE;

    let signature = Signature::from_slice(&data[offset..offset + SIGNATURE_SIZE])
        .map_err(|_| CoreError::Malformed)?;
    offset += SIGNATURE_SIZE;
    let app_data = &data[offset..];

    let mut signed = PacketPayload::new();
    signed
        .append(packet.destination.as_slice())?
        .append(&data[..IDENTITY_KEY_SIZE])?
        .append(&random_hash)?
        .append(app_data)?;

    identity.verify(signed.as_slice(), &signature)?;

    Ok(AnnounceInfo { identity, random_hash, app_data })
}

/// The expected address for a name announced by `identity`; used by
/// aspect-filtered announce handlers to match announces to names.
pub fn expected_address(name: &DestinationName, identity: &Identity) -> TruncatedHash {
    name.single_address(identity)
}

pub fn single_in(
    identity: PrivateIdentity,
    app_name: &str,
    aspects: &[&str],
) -> Result<SingleInputDestination, CoreError> {
    Ok(SingleInputDestination::new(identity, DestinationName::new(app_name, aspects)?))
}

pub fn single_out(
    identity: Identity,
    app_name: &str,
    aspects: &[&str],
) -> Result<SingleOutputDestination, CoreError> {
    Ok(SingleOutputDestination::new(identity, DestinationName::new(app_name, aspects)?))
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{
        validate_announce, DestinationName, GroupKey, GroupInputDestination,
        SingleInputDestination, MIN_ANNOUNCE_LEN, RANDOM_HASH_SIZE,
    };
    use crate::error::CoreError;
    use crate::hash::TruncatedHash;
    use crate::identity::{now_secs, PrivateIdentity, IDENTITY_KEY_SIZE};

    #[test]
    fn dots_in_components_are_rejected() {
        assert!(DestinationName::new("app.name", &["aspect"]).is_err());
        assert!(DestinationName::new("app", &["as.pect"]).is_err());
        assert!(DestinationName::new("", &[]).is_err());
        assert!(DestinationName::new("app", &["one", "two"]).is_ok());
    }

    #[test]
    fn single_address_appends_identity_hex() {
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("example", &["fruits"]).expect("valid name");
        let destination = SingleInputDestination::new(identity.clone(), name.clone());

        let expected = TruncatedHash::of(
            format!("example.fruits.{}", identity.hash().to_hex()).as_bytes(),
        );
        assert_eq!(destination.desc.address, expected);
        assert_eq!(name.single_address(identity.as_identity()), expected);
    }

    #[test]
    fn announce_roundtrip() {
        let identity = PrivateIdentity::generate(OsRng);
        let destination = SingleInputDestination::new(
            identity.clone(),
            DestinationName::new("example", &["fruits"]).expect("valid name"),
        );

        let before = now_secs();
        let announce =
            destination.announce(OsRng, Some(b"Peach")).expect("valid announce");
        let info = validate_announce(&announce).expect("valid signature");

        assert_eq!(info.identity.hash, *identity.hash());
        assert_eq!(info.app_data, b"Peach");
        assert!(info.emitted_secs() >= before.saturating_sub(1));
        assert!(info.emitted_secs() <= now_secs().saturating_add(1));
    }

    #[test]
    fn tampered_announce_app_data_fails_validation() {
        let identity = PrivateIdentity::generate(OsRng);
        let destination = SingleInputDestination::new(
            identity,
            DestinationName::new("example", &["fruits"]).expect("valid name"),
        );

        let mut announce =
            destination.announce(OsRng, Some(b"Peach")).expect("valid announce");
        let payload = announce.data.as_mut_slice();
        assert!(payload.len() > MIN_ANNOUNCE_LEN);
        payload[MIN_ANNOUNCE_LEN] ^= 0x01;

        assert_eq!(
            validate_announce(&announce).map(|_| ()),
            Err(CoreError::InvalidSignature)
        );
    }

    #[test]
    fn announce_layout_matches_wire_spec() {
        let identity = PrivateIdentity::generate(OsRng);
        let destination = SingleInputDestination::new(
            identity.clone(),
            DestinationName::new("example", &["fruits"]).expect("valid name"),
        );
        let announce = destination.announce(OsRng, None).expect("valid announce");

        let payload = announce.data.as_slice();
        assert_eq!(payload.len(), MIN_ANNOUNCE_LEN);
        assert_eq!(
            &payload[..IDENTITY_KEY_SIZE],
            identity.as_identity().to_bytes().as_slice()
        );
        let timestamp_bytes =
            &payload[IDENTITY_KEY_SIZE + RANDOM_HASH_SIZE / 2..IDENTITY_KEY_SIZE + RANDOM_HASH_SIZE];
        let mut ts = [0u8; 8];
        ts[3..].copy_from_slice(timestamp_bytes);
        assert!(u64::from_be_bytes(ts) > 1_500_000_000);
    }

    #[test]
    fn group_destination_roundtrip() {
        let key = GroupKey::generate(OsRng);
        let name = DestinationName::new("example", &["shared"]).expect("valid name");
        let sender = GroupInputDestination::new(key.clone(), name.clone());
        let receiver = GroupInputDestination::new(key, name);

        let token = sender.encrypt(OsRng, b"group secret").expect("encrypt");
        assert_eq!(receiver.decrypt(&token).expect("decrypt"), b"group secret");
    }
}
