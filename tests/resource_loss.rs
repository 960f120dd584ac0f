mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand_core::{OsRng, RngCore};

use common::{connect_filtered, fruits_destination, node, parse_frame};
use reticulum_core::destination::link::LinkStatus;
use reticulum_core::destination::{DestinationName, SingleOutputDestination};
use reticulum_core::identity::PrivateIdentity;
use reticulum_core::packet::PacketContext;
use reticulum_core::resource::{ResourceEventKind, ResourceStrategy, SDU};

/// Every third RESOURCE part on the sender→receiver path disappears. The
/// transfer must still conclude, at the cost of retransmissions.
#[tokio::test(flavor = "multi_thread")]
async fn resource_survives_part_loss() {
    let client = node("client");
    let server = node("server");

    let part_tx_count = Arc::new(AtomicUsize::new(0));
    let counted = part_tx_count.clone();
    let pass_a_to_b = Box::new(move |frame: &[u8]| {
        let Some(packet) = parse_frame(frame) else {
            return true;
        };
        if packet.context != PacketContext::Resource {
            return true;
        }
        let sequence = counted.fetch_add(1, Ordering::SeqCst);
        sequence % 3 != 2
    });
    connect_filtered(&client, &server, pass_a_to_b, Box::new(|_| true)).await;

    let destination = fruits_destination(PrivateIdentity::generate(OsRng));
    let registered = server.register_destination(destination).await;

    let mut announces = client.announce_events();
    server.announce(&registered, None).await.expect("announce sent");
    let announce = tokio::time::timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce arrives")
        .expect("announce event");

    let remote = SingleOutputDestination::new(
        announce.identity,
        DestinationName::new("example", &["fruits"]).expect("valid name"),
    );
    let link_id = client.open_link(&remote).await.expect("link request sent");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if client.link_status(&link_id).await == Some(LinkStatus::Active)
            && server.link_status(&link_id).await == Some(LinkStatus::Active)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "link did not establish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server
        .set_resource_strategy(&link_id, ResourceStrategy::AcceptAll)
        .await
        .expect("responder link present");

    let mut server_resources = server.resource_events();
    let mut payload = vec![0u8; 10 * 1024];
    OsRng.fill_bytes(&mut payload);

    client
        .send_resource(&link_id, payload.clone())
        .await
        .expect("transfer starts");

    let received = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match server_resources.recv().await {
                Ok(event) => match event.kind {
                    ResourceEventKind::Complete { data } => break data,
                    ResourceEventKind::Corrupt | ResourceEventKind::Failed => {
                        panic!("transfer failed under loss")
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("server resource stream: {err}"),
            }
        }
    })
    .await
    .expect("transfer completes despite loss");

    assert_eq!(received, payload);

    // With a third of the parts vanishing, the wire carried more part
    // transmissions than the resource has parts.
    let unique_parts = payload.len() / SDU + 2;
    assert!(
        part_tx_count.load(Ordering::SeqCst) > unique_parts,
        "loss must force retransmissions"
    );
}
