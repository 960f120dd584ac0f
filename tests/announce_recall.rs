mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand_core::OsRng;

use common::{connect, fruits_destination, node, wait_for};
use reticulum_core::hash::TruncatedHash;
use reticulum_core::identity::{Identity, PrivateIdentity};
use reticulum_core::transport::AnnounceHandler;

struct Collector {
    filter: Option<String>,
    fired: AtomicUsize,
    seen: Mutex<Vec<(TruncatedHash, TruncatedHash, Vec<u8>)>>,
}

impl Collector {
    fn new(filter: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            filter: filter.map(str::to_string),
            fired: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl AnnounceHandler for Collector {
    fn aspect_filter(&self) -> Option<String> {
        self.filter.clone()
    }

    fn received_announce(
        &self,
        destination: &TruncatedHash,
        identity: &Identity,
        app_data: &[u8],
    ) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("collector lock")
            .push((*destination, identity.hash, app_data.to_vec()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn announce_reaches_filtered_handler_and_recall() {
    let alice = node("alice");
    let bob = node("bob");
    connect(&alice, &bob).await;

    let matching = Collector::new(Some("example.fruits"));
    let other = Collector::new(Some("example.vegetables"));
    let unfiltered = Collector::new(None);
    bob.register_announce_handler(matching.clone()).await;
    bob.register_announce_handler(other.clone()).await;
    bob.register_announce_handler(unfiltered.clone()).await;

    let identity = PrivateIdentity::generate(OsRng);
    let identity_hash = *identity.hash();
    let destination = fruits_destination(identity);
    let destination_hash = *destination.address();
    let registered = alice.register_destination(destination).await;

    alice
        .announce(&registered, Some(b"Peach"))
        .await
        .expect("announce sent");

    let observed = wait_for(
        || {
            let seen = matching.seen.lock().expect("collector lock");
            seen.first().cloned()
        },
        Duration::from_secs(5),
    )
    .await
    .expect("handler fired");

    assert_eq!(observed.0, destination_hash);
    assert_eq!(observed.1, identity_hash);
    assert_eq!(observed.2, b"Peach");

    // Let any stray dispatches surface before counting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(matching.fired.load(Ordering::SeqCst), 1);
    assert_eq!(other.fired.load(Ordering::SeqCst), 0);
    assert_eq!(unfiltered.fired.load(Ordering::SeqCst), 1);

    let recalled = bob.recall(&destination_hash).await.expect("identity recallable");
    assert_eq!(recalled.hash, identity_hash);
    assert_eq!(
        bob.recall_app_data(&destination_hash).await.as_deref(),
        Some(&b"Peach"[..])
    );
}
