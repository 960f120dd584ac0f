//! Shared two-node wiring for the integration tests: a pair of engines
//! joined by an in-memory frame pipe, optionally with a drop filter per
//! direction.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;

use reticulum_core::destination::{DestinationName, SingleInputDestination};
use reticulum_core::iface::{IfaceInfo, IfacePort, RxFrame};
use reticulum_core::identity::PrivateIdentity;
use reticulum_core::packet::Packet;
use reticulum_core::transport::{Transport, TransportConfig};

pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

#[derive(Default)]
pub struct PipeCounters {
    pub a_to_b: AtomicUsize,
    pub b_to_a: AtomicUsize,
    pub dropped: AtomicUsize,
}

pub fn node(name: &str) -> Transport {
    let _ = env_logger::builder().is_test(true).try_init();
    Transport::new(TransportConfig::new(name, PrivateIdentity::generate(OsRng)))
}

/// Joins two engines with a lossless pipe.
pub async fn connect(a: &Transport, b: &Transport) -> Arc<PipeCounters> {
    connect_filtered(a, b, Box::new(|_| true), Box::new(|_| true)).await
}

/// Joins two engines; each direction's filter returns false to drop a frame.
pub async fn connect_filtered(
    a: &Transport,
    b: &Transport,
    mut pass_a_to_b: DropFilter,
    mut pass_b_to_a: DropFilter,
) -> Arc<PipeCounters> {
    let counters = Arc::new(PipeCounters::default());

    let a_port = a.attach_iface(IfaceInfo::default()).await;
    let a_iface = a_port.id;
    let IfacePort { rx_sender: a_rx, tx_receiver: mut a_tx, .. } = a_port;

    let b_port = b.attach_iface(IfaceInfo::default()).await;
    let b_iface = b_port.id;
    let IfacePort { rx_sender: b_rx, tx_receiver: mut b_tx, .. } = b_port;

    {
        let counters = counters.clone();
        tokio::spawn(async move {
            while let Some(frame) = a_tx.recv().await {
                if pass_a_to_b(&frame) {
                    counters.a_to_b.fetch_add(1, Ordering::Relaxed);
                    let _ = b_rx.try_send(RxFrame { iface: b_iface, frame });
                } else {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }
    {
        let counters = counters.clone();
        tokio::spawn(async move {
            while let Some(frame) = b_tx.recv().await {
                if pass_b_to_a(&frame) {
                    counters.b_to_a.fetch_add(1, Ordering::Relaxed);
                    let _ = a_rx.try_send(RxFrame { iface: a_iface, frame });
                } else {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    counters
}

/// Parses a framed packet back out of pipe bytes, for filters that inspect
/// traffic.
pub fn parse_frame(frame: &[u8]) -> Option<Packet> {
    let bytes = reticulum_core::iface::hdlc::decode(frame).ok()?;
    Packet::from_bytes(&bytes).ok()
}

pub fn fruits_destination(identity: PrivateIdentity) -> SingleInputDestination {
    SingleInputDestination::new(
        identity,
        DestinationName::new("example", &["fruits"]).expect("valid name"),
    )
}

/// Polls `probe` until it returns Some or the deadline passes.
pub async fn wait_for<T, F>(mut probe: F, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
