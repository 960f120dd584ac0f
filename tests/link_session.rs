mod common;

use std::time::Duration;

use rand_core::OsRng;

use common::{connect, fruits_destination, node};
use reticulum_core::destination::link::{LinkEvent, LinkStatus, TeardownReason};
use reticulum_core::destination::{DestinationName, SingleOutputDestination};
use reticulum_core::error::CoreError;
use reticulum_core::identity::PrivateIdentity;
use reticulum_core::packet::ENCRYPTED_MDU;

async fn established_link(
    client: &reticulum_core::transport::Transport,
    server: &reticulum_core::transport::Transport,
) -> reticulum_core::destination::link::LinkId {
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

    for endpoint in [client, server] {
        let status = wait_for_status(endpoint, &link_id, LinkStatus::Active).await;
        assert_eq!(status, Some(LinkStatus::Active));
    }
    link_id
}

async fn wait_for_status(
    transport: &reticulum_core::transport::Transport,
    link_id: &reticulum_core::destination::link::LinkId,
    wanted: LinkStatus,
) -> Option<LinkStatus> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(status) = transport.link_status(link_id).await {
            if status == wanted {
                return Some(status);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn link_establishes_and_tears_down() {
    let client = node("client");
    let server = node("server");
    connect(&client, &server).await;

    let mut client_events = client.link_events();
    let mut server_events = server.link_events();

    let link_id = established_link(&client, &server).await;
    assert!(client.link_rtt(&link_id).await.expect("rtt measured") < Duration::from_secs(5));

    // Both ends observed activation.
    let client_activated = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client_events.recv().await {
                Ok(event) if matches!(event.event, LinkEvent::Activated) => break event,
                Ok(_) => continue,
                Err(err) => panic!("client event stream: {err}"),
            }
        }
    })
    .await
    .expect("client activation event");
    assert_eq!(client_activated.id, link_id);

    client.teardown_link(&link_id).await;

    let client_closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client_events.recv().await {
                Ok(event) => {
                    if let LinkEvent::Closed(reason) = event.event {
                        break reason;
                    }
                }
                Err(err) => panic!("client event stream: {err}"),
            }
        }
    })
    .await
    .expect("client close event");
    let server_closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match server_events.recv().await {
                Ok(event) => {
                    if let LinkEvent::Closed(reason) = event.event {
                        break reason;
                    }
                }
                Err(err) => panic!("server event stream: {err}"),
            }
        }
    })
    .await
    .expect("server close event");

    // The initiator closed: both ends record that fact.
    assert_eq!(client_closed, TeardownReason::InitiatorClosed);
    assert_eq!(server_closed, TeardownReason::InitiatorClosed);
}

#[tokio::test(flavor = "multi_thread")]
async fn link_data_roundtrip_and_mdu_guard() {
    let client = node("client");
    let server = node("server");
    let counters = connect(&client, &server).await;

    let link_id = established_link(&client, &server).await;

    let mut server_messages = server.messages();
    client
        .send_link_data(&link_id, b"over the link")
        .await
        .expect("fits in the link mdu");
    let message = tokio::time::timeout(Duration::from_secs(5), server_messages.recv())
        .await
        .expect("message arrives")
        .expect("message event");
    assert_eq!(message.data, b"over the link");
    assert_eq!(message.link_id, Some(link_id));

    // Oversized payloads fail synchronously, before any frame leaves.
    let frames_before = counters.a_to_b.load(std::sync::atomic::Ordering::Relaxed);
    let oversized = vec![0u8; ENCRYPTED_MDU + 1];
    let result = client.send_link_data(&link_id, &oversized).await;
    assert_eq!(result.map(|_| ()), Err(CoreError::MtuExceeded));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frames_after = counters.a_to_b.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(frames_before, frames_after);
}
