use std::time::Instant;

use crate::destination::link::{DeadlineAction, LinkStatus};
use crate::packet::{PacketContext, PacketKind};
use crate::receipt::ReceiptEvent;
use crate::resource::TickAction;
use crate::transport::{Router, RECEIPT_CHECK_INTERVAL};

impl Router {
    /// One maintenance pass: receipt timeouts, link watchdog deadlines,
    /// resource retries and table culling. Runs on the engine's job
    /// interval while inbound and outbound processing wait on the lock.
    pub(crate) async fn run_jobs(&mut self, now: Instant) {
        if now.duration_since(self.last_receipt_check) >= RECEIPT_CHECK_INTERVAL {
            self.check_receipts(now);
            self.last_receipt_check = now;
        }
        self.drive_link_deadlines(now).await;
        self.cull_closed_links().await;
        self.drive_resources(now).await;
        self.ifaces.cleanup();
    }

    fn check_receipts(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.receipts.len() {
            let timed_out = self.receipts[index].check_timeout(now);
            if timed_out {
                let receipt = self.receipts.remove(index);
                log::debug!(
                    "tp({}): receipt for {} timed out",
                    self.config.name,
                    receipt.destination()
                );
                let _ = self.receipt_tx.send(ReceiptEvent::from_receipt(&receipt));
            } else if !self.receipts[index].is_pending() {
                self.receipts.remove(index);
            } else {
                index += 1;
            }
        }
    }

    async fn drive_link_deadlines(&mut self, now: Instant) {
        let links: Vec<_> = self
            .pending_links
            .values()
            .chain(self.active_links.values())
            .cloned()
            .collect();

        for link_arc in links {
            let mut link = link_arc.lock().await;
            let due = link
                .next_deadline()
                .is_some_and(|deadline| now >= deadline);
            if !due {
                continue;
            }
            match link.on_deadline(now) {
                DeadlineAction::None => {}
                DeadlineAction::SendPackets(packets) => {
                    let target = Router::link_target(&link);
                    for packet in packets {
                        if self.transmit(&packet, target, false, None).is_ok() {
                            link.record_outbound(packet.data.len());
                        }
                    }
                }
                DeadlineAction::Closed(reason) => {
                    let link_id = *link.id();
                    log::debug!(
                        "tp({}): link {} closed by watchdog ({:?})",
                        self.config.name,
                        link_id,
                        reason
                    );
                    drop(link);
                    self.resources.cancel_for_link(&link_id);
                    self.flush_resource_events();
                }
            }
        }
    }

    async fn cull_closed_links(&mut self) {
        let pending: Vec<_> = self.pending_links.keys().copied().collect();
        for link_id in pending {
            if let Some(link_arc) = self.pending_links.get(&link_id).cloned() {
                if link_arc.lock().await.status() == LinkStatus::Closed {
                    self.pending_links.remove(&link_id);
                }
            }
        }

        let active: Vec<_> = self.active_links.keys().copied().collect();
        for link_id in active {
            if let Some(link_arc) = self.active_links.get(&link_id).cloned() {
                if link_arc.lock().await.status() == LinkStatus::Closed {
                    self.active_links.remove(&link_id);
                }
            }
        }
    }

    async fn drive_resources(&mut self, now: Instant) {
        for action in self.resources.tick(now) {
            match action {
                TickAction::Resend { link_id, packet } => {
                    let Some(link_arc) = self.active_links.get(&link_id).cloned() else {
                        continue;
                    };
                    let mut link = link_arc.lock().await;
                    let target = Router::link_target(&link);
                    if self.transmit(&packet, target, false, None).is_ok() {
                        link.record_outbound(packet.data.len());
                    }
                }

                TickAction::RetryRequest { link_id, resource } => {
                    let Some(link_arc) = self.active_links.get(&link_id).cloned() else {
                        continue;
                    };
                    let mut link = link_arc.lock().await;
                    let Some(packet) = self.resources.build_retry_request(&resource, &link)
                    else {
                        continue;
                    };
                    log::debug!(
                        "tp({}): retrying resource {} request",
                        self.config.name,
                        resource
                    );
                    let target = Router::link_target(&link);
                    if self.transmit(&packet, target, false, None).is_ok() {
                        link.record_outbound(packet.data.len());
                    }
                }

                TickAction::RequestProofCache { link_id, proof_packet_hash } => {
                    let Some(link_arc) = self.active_links.get(&link_id).cloned() else {
                        continue;
                    };
                    let mut link = link_arc.lock().await;
                    let packet = match link.plain_packet(
                        PacketKind::Data,
                        PacketContext::CacheRequest,
                        proof_packet_hash.as_slice(),
                    ) {
                        Ok(packet) => packet,
                        Err(_) => continue,
                    };
                    let target = Router::link_target(&link);
                    if self.transmit(&packet, target, false, None).is_ok() {
                        link.record_outbound(packet.data.len());
                    }
                }

                TickAction::Cancelled { link_id, resource, initiator } => {
                    if !initiator {
                        continue;
                    }
                    let Some(link_arc) = self.active_links.get(&link_id).cloned() else {
                        continue;
                    };
                    let mut link = link_arc.lock().await;
                    let context = PacketContext::ResourceInitiatorCancel;
                    match link.control_packet(context, resource.as_slice()) {
                        Ok(packet) => {
                            let target = Router::link_target(&link);
                            if self.transmit(&packet, target, false, None).is_ok() {
                                link.record_outbound(packet.data.len());
                            }
                        }
                        Err(err) => {
                            log::debug!(
                                "tp({}): could not send resource cancel ({})",
                                self.config.name,
                                err
                            );
                        }
                    }
                }
            }
        }
        self.flush_resource_events();
    }
}
