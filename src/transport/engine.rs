use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::destination::link::{
    Link, LinkEventData, LinkId, LinkStatus, TeardownReason,
};
use crate::destination::{
    DestinationName, GroupInputDestination, SingleInputDestination, SingleOutputDestination,
};
use crate::error::CoreError;
use crate::hash::{Sha256Hash, TruncatedHash, TRUNCATED_HASH_SIZE};
use crate::iface::{IfaceInfo, IfaceManager, IfacePort, RxFrame, TxTarget};
use crate::identity::{Identity, KnownDestinations, PrivateIdentity};
use crate::packet::{DestinationKind, Header, Packet, PacketContext, PacketKind, PacketPayload};
use crate::receipt::{ReceiptEvent, TIMEOUT_PER_HOP};
use crate::resource::{ResourceEvent, ResourceManager, ResourceStrategy};
use crate::transport::{
    AnnounceEvent, AnnounceHandler, InboundMessage, PacketCache, PacketHashList, Router,
    TransportConfig, JOB_INTERVAL, KNOWN_DESTINATIONS_FILE, PACKET_CACHE_CAPACITY,
    PACKET_HASHLIST_CAPACITY, PACKET_HASHLIST_FILE,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The transport engine: one value owning every table of the node.
///
/// All state lives behind a single lock; inbound processing, outbound
/// queueing and the periodic jobs pass serialize on it, which is exactly the
/// ordering the protocol assumes. Interfaces talk to the engine through
/// frame channels obtained from [`Transport::attach_iface`].
pub struct Transport {
    state: Arc<Mutex<Router>>,
    announce_tx: broadcast::Sender<AnnounceEvent>,
    link_event_tx: broadcast::Sender<LinkEventData>,
    message_tx: broadcast::Sender<InboundMessage>,
    receipt_tx: broadcast::Sender<ReceiptEvent>,
    resource_tx: broadcast::Sender<ResourceEvent>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (announce_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link_event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (message_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (receipt_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (resource_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let (rx_sender, mut rx_receiver) = mpsc::channel::<RxFrame>(config.iface_rx_queue);
        let ifaces = IfaceManager::new(rx_sender, config.iface_tx_queue);

        let name = config.name.clone();
        let router = Router {
            config,
            ifaces,
            in_destinations: HashMap::new(),
            group_destinations: HashMap::new(),
            plain_destinations: HashSet::new(),
            known: KnownDestinations::new(),
            announces: HashMap::new(),
            handlers: Vec::new(),
            pending_links: HashMap::new(),
            active_links: HashMap::new(),
            receipts: Vec::new(),
            seen: PacketHashList::new(PACKET_HASHLIST_CAPACITY),
            cache: PacketCache::new(PACKET_CACHE_CAPACITY),
            resources: ResourceManager::new(),
            announce_tx: announce_tx.clone(),
            link_event_tx: link_event_tx.clone(),
            message_tx: message_tx.clone(),
            receipt_tx: receipt_tx.clone(),
            resource_tx: resource_tx.clone(),
            last_receipt_check: Instant::now(),
        };
        let state = Arc::new(Mutex::new(router));
        let cancel = CancellationToken::new();

        // Inbound pump: frames from all interfaces funnel through one queue.
        {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = rx_receiver.recv() => {
                            let Some(message) = received else { break };
                            let mut router = state.lock().await;
                            router.handle_frame(&message.frame, message.iface).await;
                        }
                    }
                }
            });
        }

        // Jobs pass: watchdogs, receipt timeouts, resource retries.
        {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(JOB_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let mut router = state.lock().await;
                            router.run_jobs(Instant::now()).await;
                        }
                    }
                }
            });
        }

        log::debug!("tp({}): engine started", name);
        Self {
            state,
            announce_tx,
            link_event_tx,
            message_tx,
            receipt_tx,
            resource_tx,
            cancel,
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    //*** interfaces ********************************************************//

    pub async fn attach_iface(&self, info: IfaceInfo) -> IfacePort {
        self.state.lock().await.ifaces.attach(info)
    }

    //*** destinations and announces ***************************************//

    pub async fn register_destination(
        &self,
        destination: SingleInputDestination,
    ) -> Arc<Mutex<SingleInputDestination>> {
        let address = *destination.address();
        let destination = Arc::new(Mutex::new(destination));
        self.state
            .lock()
            .await
            .in_destinations
            .insert(address, destination.clone());
        destination
    }

    pub async fn register_group_destination(
        &self,
        destination: GroupInputDestination,
    ) -> Arc<Mutex<GroupInputDestination>> {
        let address = *destination.address();
        let destination = Arc::new(Mutex::new(destination));
        self.state
            .lock()
            .await
            .group_destinations
            .insert(address, destination.clone());
        destination
    }

    pub async fn register_plain_destination(&self, name: &DestinationName) -> TruncatedHash {
        let address = name.plain_address();
        self.state.lock().await.plain_destinations.insert(address);
        address
    }

    pub async fn register_announce_handler(&self, handler: Arc<dyn AnnounceHandler>) {
        self.state.lock().await.handlers.push(handler);
    }

    /// Broadcasts an announce for a registered destination.
    pub async fn announce(
        &self,
        destination: &Arc<Mutex<SingleInputDestination>>,
        app_data: Option<&[u8]>,
    ) -> Result<(), CoreError> {
        let packet = destination.lock().await.announce(OsRng, app_data)?;
        let mut router = self.state.lock().await;
        router
            .transmit(&packet, TxTarget::Broadcast { except: None }, false, None)
            .map(|_| ())
    }

    /// Identity previously learned from announces for a destination.
    pub async fn recall(&self, destination: &TruncatedHash) -> Option<Identity> {
        self.state.lock().await.known.recall(destination)
    }

    pub async fn recall_app_data(&self, destination: &TruncatedHash) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .known
            .recall_app_data(destination)
            .map(|data| data.to_vec())
    }

    pub async fn hops_to(&self, destination: &TruncatedHash) -> Option<u8> {
        self.state.lock().await.hops_to(destination)
    }

    //*** plain and keyed datagrams ****************************************//

    /// Encrypted DATA to a remote SINGLE destination; returns the packet
    /// hash tracked by the created receipt.
    pub async fn send_to_single(
        &self,
        destination: &SingleOutputDestination,
        data: &[u8],
    ) -> Result<Sha256Hash, CoreError> {
        let cipher_text = destination.encrypt(OsRng, data)?;
        let packet = Packet {
            header: Header {
                destination_kind: DestinationKind::Single,
                packet_kind: PacketKind::Data,
                ..Default::default()
            },
            transport_id: None,
            destination: *destination.address(),
            context: PacketContext::None,
            data: payload_from(&cipher_text)?,
        };

        let mut router = self.state.lock().await;
        let hops = router.hops_to(destination.address()).unwrap_or(0).max(1);
        let timeout = TIMEOUT_PER_HOP * u32::from(hops);
        match router.transmit(&packet, TxTarget::Broadcast { except: None }, true, Some(timeout))?
        {
            Some(hash) => Ok(hash),
            None => Ok(packet.hash()),
        }
    }

    /// Unencrypted DATA to a PLAIN destination.
    pub async fn send_plain(
        &self,
        destination: &TruncatedHash,
        data: &[u8],
    ) -> Result<(), CoreError> {
        let packet = Packet {
            header: Header {
                destination_kind: DestinationKind::Plain,
                packet_kind: PacketKind::Data,
                ..Default::default()
            },
            transport_id: None,
            destination: *destination,
            context: PacketContext::None,
            data: payload_from(data)?,
        };
        self.state
            .lock()
            .await
            .transmit(&packet, TxTarget::Broadcast { except: None }, false, None)
            .map(|_| ())
    }

    /// Symmetric-key DATA to a GROUP destination.
    pub async fn send_to_group(
        &self,
        destination: &GroupInputDestination,
        data: &[u8],
    ) -> Result<(), CoreError> {
        let cipher_text = destination.encrypt(OsRng, data)?;
        let packet = Packet {
            header: Header {
                destination_kind: DestinationKind::Group,
                packet_kind: PacketKind::Data,
                ..Default::default()
            },
            transport_id: None,
            destination: *destination.address(),
            context: PacketContext::None,
            data: payload_from(&cipher_text)?,
        };
        self.state
            .lock()
            .await
            .transmit(&packet, TxTarget::Broadcast { except: None }, false, None)
            .map(|_| ())
    }

    //*** links ************************************************************//

    /// Initiates a link towards a remote destination whose identity is
    /// already known (from an announce or out-of-band exchange).
    pub async fn open_link(
        &self,
        destination: &SingleOutputDestination,
    ) -> Result<LinkId, CoreError> {
        let mut link = Link::new(destination.desc.clone(), self.link_event_tx.clone());
        let request = link.request();
        let link_id = *link.id();

        let mut router = self.state.lock().await;
        router.transmit(&request, TxTarget::Broadcast { except: None }, false, None)?;
        link.record_outbound(request.data.len());
        router
            .pending_links
            .insert(link_id, Arc::new(Mutex::new(link)));
        log::debug!("tp: link request {} sent to {}", link_id, destination.address());
        Ok(link_id)
    }

    /// Encrypted application data over an established link. Fails
    /// synchronously when the payload exceeds the link MDU; nothing reaches
    /// an interface in that case.
    pub async fn send_link_data(
        &self,
        link_id: &LinkId,
        data: &[u8],
    ) -> Result<Sha256Hash, CoreError> {
        let mut router = self.state.lock().await;
        let link_arc = router
            .active_links
            .get(link_id)
            .cloned()
            .ok_or(CoreError::Cancelled)?;
        let mut link = link_arc.lock().await;

        let packet = link.data_packet(data)?;
        let timeout = link.traffic_timeout();
        let target = Router::link_target(&link);
        let hash = router.transmit(&packet, target, true, Some(timeout))?;
        link.record_outbound(packet.data.len());
        Ok(hash.unwrap_or(packet.hash()))
    }

    /// Request/response over a link: returns the request id the response
    /// will carry.
    pub async fn send_link_request(
        &self,
        link_id: &LinkId,
        path: &str,
        data: &[u8],
    ) -> Result<TruncatedHash, CoreError> {
        let mut router = self.state.lock().await;
        let link_arc = router
            .active_links
            .get(link_id)
            .cloned()
            .ok_or(CoreError::Cancelled)?;
        let mut link = link_arc.lock().await;

        let path_hash = TruncatedHash::of(path.as_bytes());
        let mut plaintext = Vec::with_capacity(TRUNCATED_HASH_SIZE + data.len());
        plaintext.extend_from_slice(path_hash.as_slice());
        plaintext.extend_from_slice(data);

        let packet = link.control_packet(PacketContext::Request, &plaintext)?;
        let target = Router::link_target(&link);
        router.transmit(&packet, target, false, None)?;
        link.record_outbound(packet.data.len());
        Ok(packet.truncated_hash())
    }

    /// Proves a long-term identity to the peer of a link.
    pub async fn identify_on_link(
        &self,
        link_id: &LinkId,
        identity: &PrivateIdentity,
    ) -> Result<(), CoreError> {
        let mut router = self.state.lock().await;
        let link_arc = router
            .active_links
            .get(link_id)
            .cloned()
            .ok_or(CoreError::Cancelled)?;
        let mut link = link_arc.lock().await;

        let packet = link.identify(identity)?;
        let target = Router::link_target(&link);
        router.transmit(&packet, target, false, None)?;
        link.record_outbound(packet.data.len());
        Ok(())
    }

    /// Closes a link, notifying the peer when a session exists.
    pub async fn teardown_link(&self, link_id: &LinkId) {
        let mut router = self.state.lock().await;
        let link_arc = match router
            .active_links
            .get(link_id)
            .or_else(|| router.pending_links.get(link_id))
            .cloned()
        {
            Some(link) => link,
            None => return,
        };
        let mut link = link_arc.lock().await;
        if let Some(close_packet) = link.teardown() {
            let target = Router::link_target(&link);
            let _ = router.transmit(&close_packet, target, false, None);
        }
        let link_id = *link.id();
        drop(link);
        router.resources.cancel_for_link(&link_id);
        router.flush_resource_events();
    }

    pub async fn link_status(&self, link_id: &LinkId) -> Option<LinkStatus> {
        let router = self.state.lock().await;
        let link_arc = router
            .active_links
            .get(link_id)
            .or_else(|| router.pending_links.get(link_id))
            .cloned()?;
        drop(router);
        let status = link_arc.lock().await.status();
        Some(status)
    }

    pub async fn link_teardown_reason(&self, link_id: &LinkId) -> Option<TeardownReason> {
        let router = self.state.lock().await;
        let link_arc = router
            .active_links
            .get(link_id)
            .or_else(|| router.pending_links.get(link_id))
            .cloned()?;
        drop(router);
        let reason = link_arc.lock().await.teardown_reason();
        reason
    }

    pub async fn link_rtt(&self, link_id: &LinkId) -> Option<Duration> {
        let router = self.state.lock().await;
        let link_arc = router.active_links.get(link_id).cloned()?;
        drop(router);
        let rtt = link_arc.lock().await.rtt();
        Some(rtt)
    }

    pub async fn set_resource_strategy(
        &self,
        link_id: &LinkId,
        strategy: ResourceStrategy,
    ) -> Result<(), CoreError> {
        let router = self.state.lock().await;
        let link_arc = router
            .active_links
            .get(link_id)
            .cloned()
            .ok_or(CoreError::Cancelled)?;
        drop(router);
        link_arc.lock().await.set_resource_strategy(strategy);
        Ok(())
    }

    //*** resources ********************************************************//

    /// Starts a resource transfer over an active link; returns the resource
    /// hash progress and conclusion events will carry.
    pub async fn send_resource(
        &self,
        link_id: &LinkId,
        data: Vec<u8>,
    ) -> Result<Sha256Hash, CoreError> {
        let mut router = self.state.lock().await;
        let link_arc = router
            .active_links
            .get(link_id)
            .cloned()
            .ok_or(CoreError::Cancelled)?;
        let mut link = link_arc.lock().await;
        if !link.status().usable() {
            return Err(CoreError::Cancelled);
        }

        let (hash, advertisement) = {
            let resources = &mut router.resources;
            resources.start_outgoing(&link, data, true)?
        };
        if let Some(advertisement) = advertisement {
            let target = Router::link_target(&link);
            router.transmit(&advertisement, target, false, None)?;
            link.record_outbound(advertisement.data.len());
        }
        Ok(hash)
    }

    //*** events ***********************************************************//

    pub fn announce_events(&self) -> broadcast::Receiver<AnnounceEvent> {
        self.announce_tx.subscribe()
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEventData> {
        self.link_event_tx.subscribe()
    }

    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.message_tx.subscribe()
    }

    pub fn receipt_events(&self) -> broadcast::Receiver<ReceiptEvent> {
        self.receipt_tx.subscribe()
    }

    pub fn resource_events(&self) -> broadcast::Receiver<ResourceEvent> {
        self.resource_tx.subscribe()
    }

    //*** persistence ******************************************************//

    /// Writes the known-destination table and the duplicate-suppression
    /// list under `dir`.
    pub async fn save_state(&self, dir: &Path) -> Result<(), CoreError> {
        std::fs::create_dir_all(dir).map_err(|_| CoreError::Io)?;
        let router = self.state.lock().await;
        router.known.save(dir.join(KNOWN_DESTINATIONS_FILE))?;
        router.seen.save(dir.join(PACKET_HASHLIST_FILE))
    }

    /// Restores previously saved state; missing files are not an error.
    pub async fn load_state(&self, dir: &Path) -> Result<(), CoreError> {
        let mut router = self.state.lock().await;
        let known_path = dir.join(KNOWN_DESTINATIONS_FILE);
        if known_path.exists() {
            router.known = KnownDestinations::load(&known_path)?;
        }
        let seen_path = dir.join(PACKET_HASHLIST_FILE);
        if seen_path.exists() {
            router.seen = PacketHashList::load(&seen_path, PACKET_HASHLIST_CAPACITY)?;
        }
        Ok(())
    }

    //*** introspection ****************************************************//

    pub async fn pending_link_count(&self) -> usize {
        self.state.lock().await.pending_links.len()
    }

    pub async fn active_link_count(&self) -> usize {
        self.state.lock().await.active_links.len()
    }

    pub async fn pending_receipt_count(&self) -> usize {
        let router = self.state.lock().await;
        router
            .receipts
            .iter()
            .filter(|receipt| receipt.is_pending())
            .count()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn payload_from(data: &[u8]) -> Result<PacketPayload, CoreError> {
    if data.len() > crate::packet::MDU {
        return Err(CoreError::MtuExceeded);
    }
    Ok(PacketPayload::from_slice(data))
}
