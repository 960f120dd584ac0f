use crate::destination::link::{Link, LinkInbound};
use crate::destination::ProofStrategy;
use crate::hash::{Sha256Hash, TruncatedHash, HASH_SIZE, TRUNCATED_HASH_SIZE};
use crate::iface::{hdlc, IfaceId, TxTarget};
use crate::packet::{DestinationKind, Packet, PacketContext, PacketKind};
use crate::receipt::{parse_explicit_proof, ReceiptEvent};
use crate::resource::ResourceAdvertisement;
use crate::transport::{InboundMessage, Router};

impl Router {
    /// Entry point for one raw HDLC frame delivered by an interface.
    ///
    /// The duplicate filter runs before any dispatch, so a packet reinjected
    /// while it is being forwarded is already recorded and dropped. Keepalive
    /// and resource request/proof contexts are exempt: they are legitimately
    /// identical across retries and must keep flowing.
    pub(crate) async fn handle_frame(&mut self, raw: &[u8], iface: IfaceId) {
        let Ok(bytes) = hdlc::decode(raw) else {
            log::trace!("tp({}): unframeable noise from {}", self.config.name, iface);
            return;
        };
        let packet = match Packet::from_bytes(&bytes) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("tp({}): dropped malformed packet ({})", self.config.name, err);
                return;
            }
        };

        let hash = packet.hash();
        let exempt = matches!(
            packet.context,
            PacketContext::KeepAlive
                | PacketContext::ResourceRequest
                | PacketContext::ResourceProof
        );
        let first_seen = self.seen.insert(&hash);
        if !first_seen && !exempt {
            log::trace!("tp({}): duplicate {} dropped", self.config.name, hash);
            return;
        }

        match packet.header.packet_kind {
            PacketKind::Announce => self.handle_announce(&packet, iface).await,
            PacketKind::LinkRequest => self.handle_link_request(&packet, iface).await,
            PacketKind::Data => self.handle_data(&packet, iface).await,
            PacketKind::Proof => self.handle_proof(&packet, iface).await,
        }
    }

    async fn handle_link_request(&mut self, packet: &Packet, iface: IfaceId) {
        let Some(destination) = self.in_destinations.get(&packet.destination).cloned() else {
            log::trace!(
                "tp({}): link request for unknown destination {}",
                self.config.name,
                packet.destination
            );
            return;
        };

        let (identity, desc) = {
            let guard = destination.lock().await;
            (guard.identity.clone(), guard.desc.clone())
        };

        match Link::from_request(packet, &identity, desc, self.link_event_tx.clone()) {
            Ok((mut link, proof)) => {
                link.set_attached_iface(Some(iface));
                let link_id = *link.id();
                if let Err(err) =
                    self.transmit(&proof, TxTarget::Direct(iface), false, None)
                {
                    log::warn!("tp({}): could not send link proof ({})", self.config.name, err);
                }
                link.record_outbound(proof.data.len());
                log::debug!("tp({}): accepted link request {}", self.config.name, link_id);
                self.active_links
                    .insert(link_id, std::sync::Arc::new(tokio::sync::Mutex::new(link)));
            }
            Err(err) => {
                log::debug!("tp({}): rejected link request ({})", self.config.name, err);
            }
        }
    }

    async fn handle_data(&mut self, packet: &Packet, iface: IfaceId) {
        if packet.context == PacketContext::CacheRequest {
            self.serve_cache_request(packet, iface);
            return;
        }

        match packet.header.destination_kind {
            DestinationKind::Link => self.handle_link_data(packet, iface).await,
            DestinationKind::Single => self.handle_single_data(packet).await,
            DestinationKind::Group => self.handle_group_data(packet).await,
            DestinationKind::Plain => {
                if self.plain_destinations.contains(&packet.destination) {
                    let _ = self.message_tx.send(InboundMessage {
                        destination: packet.destination,
                        context: packet.context,
                        data: packet.data.as_slice().to_vec(),
                        link_id: None,
                    });
                }
            }
        }
    }

    async fn handle_single_data(&mut self, packet: &Packet) {
        let Some(destination) = self.in_destinations.get(&packet.destination).cloned() else {
            return;
        };
        let guard = destination.lock().await;
        let plaintext = match guard.decrypt(packet.data.as_slice()) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                log::debug!(
                    "tp({}): undecryptable packet for {} ({})",
                    self.config.name,
                    packet.destination,
                    err
                );
                return;
            }
        };

        let prove = match guard.proof_strategy() {
            ProofStrategy::ProveAll => true,
            ProofStrategy::ProveApp => guard
                .proof_predicate()
                .map(|predicate| predicate(packet))
                .unwrap_or(false),
            ProofStrategy::ProveNone => false,
        };
        let proof = prove.then(|| guard.identity.prove(packet));
        drop(guard);

        let _ = self.message_tx.send(InboundMessage {
            destination: packet.destination,
            context: packet.context,
            data: plaintext,
            link_id: None,
        });

        if let Some(proof) = proof {
            if let Err(err) =
                self.transmit(&proof, TxTarget::Broadcast { except: None }, false, None)
            {
                log::debug!("tp({}): could not send proof ({})", self.config.name, err);
            }
        }
    }

    async fn handle_group_data(&mut self, packet: &Packet) {
        let Some(destination) = self.group_destinations.get(&packet.destination).cloned()
        else {
            return;
        };
        let guard = destination.lock().await;
        match guard.decrypt(packet.data.as_slice()) {
            Ok(plaintext) => {
                drop(guard);
                let _ = self.message_tx.send(InboundMessage {
                    destination: packet.destination,
                    context: packet.context,
                    data: plaintext,
                    link_id: None,
                });
            }
            Err(err) => {
                log::debug!(
                    "tp({}): undecryptable group packet for {} ({})",
                    self.config.name,
                    packet.destination,
                    err
                );
            }
        }
    }

    async fn handle_link_data(&mut self, packet: &Packet, iface: IfaceId) {
        let Some(link_arc) = self.active_links.get(&packet.destination).cloned() else {
            return;
        };
        let mut link = link_arc.lock().await;
        if link.attached_iface().is_none() {
            link.set_attached_iface(Some(iface));
        }

        match link.handle_packet(packet) {
            LinkInbound::None | LinkInbound::Activated | LinkInbound::Identified(_) => {}
            LinkInbound::KeepAliveRequest => {
                let echo = link.keepalive_packet(0xFE);
                let target = Router::link_target(&link);
                if self.transmit(&echo, target, false, None).is_ok() {
                    link.record_outbound(echo.data.len());
                }
            }
            LinkInbound::Closed(_) => {
                let link_id = *link.id();
                drop(link);
                self.resources.cancel_for_link(&link_id);
                self.flush_resource_events();
            }
            LinkInbound::Data { context, plaintext } => {
                self.route_link_payload(&mut link, packet, context, plaintext)
                    .await;
            }
        }
    }

    async fn route_link_payload(
        &mut self,
        link: &mut Link,
        packet: &Packet,
        context: PacketContext,
        plaintext: Vec<u8>,
    ) {
        match context {
            PacketContext::None | PacketContext::Response => {
                let destination = link.desc().address;
                let _ = self.message_tx.send(InboundMessage {
                    destination,
                    context,
                    data: plaintext,
                    link_id: Some(*link.id()),
                });
                self.maybe_prove_link_packet(link, packet, &destination).await;
            }

            PacketContext::Request => {
                self.serve_link_request(link, packet, &plaintext).await;
            }

            PacketContext::Resource => {
                let packets = self.resources.handle_part(link, &plaintext);
                self.send_on_link(link, packets);
                self.flush_resource_events();
            }

            PacketContext::ResourceAdvertisement => {
                let advertisement = match ResourceAdvertisement::unpack(&plaintext) {
                    Ok(advertisement) => advertisement,
                    Err(err) => {
                        log::debug!(
                            "tp({}): malformed resource advertisement ({})",
                            self.config.name,
                            err
                        );
                        return;
                    }
                };
                let accept = match link.resource_strategy() {
                    crate::resource::ResourceStrategy::AcceptAll => true,
                    crate::resource::ResourceStrategy::AcceptNone => false,
                    crate::resource::ResourceStrategy::AcceptApp => link
                        .resource_predicate()
                        .map(|predicate| predicate(&advertisement))
                        .unwrap_or(false),
                };
                if !accept {
                    log::debug!(
                        "tp({}): resource advertisement refused on {}",
                        self.config.name,
                        link.id()
                    );
                    return;
                }
                let packets = self.resources.accept(link, &advertisement);
                self.send_on_link(link, packets);
                self.flush_resource_events();
            }

            PacketContext::ResourceRequest => {
                let packets = self.resources.handle_request(link, &plaintext);
                self.send_on_link(link, packets);
                self.flush_resource_events();
            }

            PacketContext::ResourceHashUpdate => {
                let packets = self.resources.handle_hashmap_update(link, &plaintext);
                self.send_on_link(link, packets);
                self.flush_resource_events();
            }

            PacketContext::ResourceInitiatorCancel
            | PacketContext::ResourceReceiverCancel => {
                self.resources.handle_cancel(link.id(), &plaintext);
                self.flush_resource_events();
            }

            _ => {}
        }
    }

    async fn maybe_prove_link_packet(
        &mut self,
        link: &mut Link,
        packet: &Packet,
        destination: &TruncatedHash,
    ) {
        if link.is_initiator() {
            return;
        }
        let Some(owner) = self.in_destinations.get(destination).cloned() else {
            return;
        };
        let prove = {
            let guard = owner.lock().await;
            match guard.proof_strategy() {
                ProofStrategy::ProveAll => true,
                ProofStrategy::ProveApp => guard
                    .proof_predicate()
                    .map(|predicate| predicate(packet))
                    .unwrap_or(false),
                ProofStrategy::ProveNone => false,
            }
        };
        if prove {
            let proof = link.prove_packet(packet);
            let target = Router::link_target(link);
            if self.transmit(&proof, target, false, None).is_ok() {
                link.record_outbound(proof.data.len());
            }
        }
    }

    async fn serve_link_request(&mut self, link: &mut Link, packet: &Packet, plaintext: &[u8]) {
        if plaintext.len() < TRUNCATED_HASH_SIZE {
            return;
        }
        let Ok(path_hash) = TruncatedHash::from_slice(&plaintext[..TRUNCATED_HASH_SIZE]) else {
            return;
        };
        let destination = link.desc().address;
        let Some(owner) = self.in_destinations.get(&destination).cloned() else {
            return;
        };

        let response = {
            let guard = owner.lock().await;
            guard.respond_to_request(
                &path_hash,
                &plaintext[TRUNCATED_HASH_SIZE..],
                link.remote_identity(),
            )
        };
        let Some(response) = response else {
            return;
        };

        let request_id = packet.truncated_hash();
        let mut payload = Vec::with_capacity(TRUNCATED_HASH_SIZE + response.len());
        payload.extend_from_slice(request_id.as_slice());
        payload.extend_from_slice(&response);

        match link.control_packet(PacketContext::Response, &payload) {
            Ok(reply) => {
                let target = Router::link_target(link);
                if self.transmit(&reply, target, false, None).is_ok() {
                    link.record_outbound(reply.data.len());
                }
            }
            Err(err) => {
                log::debug!("tp({}): response did not fit ({})", self.config.name, err);
            }
        }
    }

    async fn handle_proof(&mut self, packet: &Packet, iface: IfaceId) {
        match packet.context {
            PacketContext::LinkRequestProof => {
                let Some(link_arc) = self.pending_links.get(&packet.destination).cloned()
                else {
                    return;
                };
                let mut link = link_arc.lock().await;
                match link.validate_proof(packet) {
                    Ok(rtt_packet) => {
                        link.set_attached_iface(Some(iface));
                        if self
                            .transmit(&rtt_packet, TxTarget::Direct(iface), false, None)
                            .is_ok()
                        {
                            link.record_outbound(rtt_packet.data.len());
                        }
                        let link_id = *link.id();
                        drop(link);
                        if let Some(established) = self.pending_links.remove(&link_id) {
                            self.active_links.insert(link_id, established);
                        }
                    }
                    Err(err) => {
                        log::debug!(
                            "tp({}): invalid link proof for {} ({})",
                            self.config.name,
                            packet.destination,
                            err
                        );
                    }
                }
            }

            PacketContext::ResourceProof => {
                let Some(link_arc) = self.active_links.get(&packet.destination).cloned()
                else {
                    return;
                };
                let mut link = link_arc.lock().await;
                link.touch_inbound(packet.data.len());
                let packets = self.resources.handle_proof(&link, packet.data.as_slice());
                self.send_on_link(&mut link, packets);
                self.flush_resource_events();
            }

            _ => self.settle_receipt(packet).await,
        }
    }

    async fn settle_receipt(&mut self, packet: &Packet) {
        let Some(claim) = parse_explicit_proof(packet.data.as_slice()) else {
            return;
        };
        let Some(index) = self
            .receipts
            .iter()
            .position(|receipt| receipt.is_pending() && *receipt.hash() == claim.hash)
        else {
            return;
        };

        let valid = match self.receipts[index].destination_kind() {
            DestinationKind::Link => {
                let link_id = *self.receipts[index].destination();
                match self.active_links.get(&link_id).cloned() {
                    Some(link_arc) => {
                        let mut link = link_arc.lock().await;
                        link.touch_inbound(packet.data.len());
                        link.validate(claim.raw_hash, &claim.signature).is_ok()
                    }
                    None => false,
                }
            }
            _ => match self.known.recall(self.receipts[index].destination()) {
                Some(identity) => identity.verify(claim.raw_hash, &claim.signature).is_ok(),
                None => false,
            },
        };

        if !valid {
            log::debug!("tp({}): proof signature rejected", self.config.name);
            return;
        }

        let mut receipt = self.receipts.remove(index);
        receipt.mark_delivered();
        let _ = self.receipt_tx.send(ReceiptEvent::from_receipt(&receipt));
    }

    fn serve_cache_request(&mut self, packet: &Packet, iface: IfaceId) {
        if packet.data.len() < HASH_SIZE {
            return;
        }
        let Ok(wanted) = Sha256Hash::from_slice(packet.data.as_slice()) else {
            return;
        };
        let Some(raw) = self.cache.get(&wanted) else {
            log::trace!("tp({}): cache miss for {}", self.config.name, wanted);
            return;
        };
        let frame = hdlc::encode(raw);
        self.ifaces.dispatch(TxTarget::Direct(iface), &frame);
        log::debug!("tp({}): served cached packet {}", self.config.name, wanted);
    }

    /// Queues link-addressed packets towards the link's interface.
    pub(crate) fn send_on_link(&mut self, link: &mut Link, packets: Vec<Packet>) {
        let target = Router::link_target(link);
        for packet in packets {
            match self.transmit(&packet, target, false, None) {
                Ok(_) => link.record_outbound(packet.data.len()),
                Err(err) => {
                    log::debug!(
                        "tp({}): could not send link packet ({})",
                        self.config.name,
                        err
                    );
                }
            }
        }
    }
}
