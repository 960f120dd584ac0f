use crate::destination::validate_announce;
use crate::iface::{IfaceId, TxTarget};
use crate::identity::now_secs;
use crate::packet::Packet;
use crate::transport::{AnnounceEvent, AnnounceRecord, Router, ANNOUNCE_MAX_HOPS};

impl Router {
    /// Validates an announce, updates the identity and announce tables,
    /// fans it out to matching handlers and optionally rebroadcasts it.
    ///
    /// Two announces for the same destination arriving on different
    /// interfaces update the identity cache once: the entry is keyed by
    /// destination and replays keep their original first-seen timestamp.
    pub(crate) async fn handle_announce(&mut self, packet: &Packet, iface: IfaceId) {
        let info = match validate_announce(packet) {
            Ok(info) => info,
            Err(err) => {
                log::debug!(
                    "tp({}): invalid announce for {} dropped ({})",
                    self.config.name,
                    packet.destination,
                    err
                );
                return;
            }
        };

        let identity = info.identity;
        let app_data = info.app_data.to_vec();
        let emitted = info.emitted_secs();

        let newly_known = self.known.remember(
            packet.destination,
            packet.hash(),
            identity.to_bytes(),
            (!app_data.is_empty()).then_some(app_data.as_slice()),
            now_secs(),
        );
        if newly_known {
            log::debug!(
                "tp({}): learned destination {} ({} hops)",
                self.config.name,
                packet.destination,
                packet.header.hops
            );
        }

        match self.announces.get_mut(&packet.destination) {
            Some(record) => {
                // A replayed announce carries an older embedded timestamp
                // and must not displace fresher path information.
                if emitted >= record.emitted {
                    record.packet_hash = packet.hash();
                    record.hops = packet.header.hops;
                    record.iface = iface;
                    record.emitted = emitted;
                }
            }
            None => {
                self.announces.insert(
                    packet.destination,
                    AnnounceRecord {
                        first_seen: now_secs(),
                        packet_hash: packet.hash(),
                        hops: packet.header.hops,
                        iface,
                        emitted,
                    },
                );
            }
        }

        for handler in self.handlers.clone() {
            let matched = match handler.aspect_filter() {
                None => true,
                Some(filter) => Router::expected_address_for_filter(&filter, &identity)
                    .map(|expected| expected == packet.destination)
                    .unwrap_or(false),
            };
            if matched {
                handler.received_announce(&packet.destination, &identity, &app_data);
            }
        }

        let _ = self.announce_tx.send(AnnounceEvent {
            destination: packet.destination,
            identity,
            app_data,
            hops: packet.header.hops,
            iface,
        });

        if self.config.retransmit && packet.header.hops < ANNOUNCE_MAX_HOPS {
            let mut forwarded = *packet;
            forwarded.header.hops += 1;
            if let Err(err) = self.transmit(
                &forwarded,
                TxTarget::Broadcast { except: Some(iface) },
                false,
                None,
            ) {
                log::trace!(
                    "tp({}): announce not rebroadcast ({})",
                    self.config.name,
                    err
                );
            }
        }
    }
}
