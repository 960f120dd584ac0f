mod common;

use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;

use common::{connect, fruits_destination, node};
use reticulum_core::destination::link::LinkStatus;
use reticulum_core::destination::{
    DestinationName, RequestPolicy, SingleOutputDestination,
};
use reticulum_core::hash::TruncatedHash;
use reticulum_core::iface::{hdlc, IfaceInfo};
use reticulum_core::identity::PrivateIdentity;
use reticulum_core::packet::PacketContext;

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_frames_are_suppressed() {
    let receiver = node("receiver");
    let port = receiver.attach_iface(IfaceInfo::default()).await;

    let destination = fruits_destination(PrivateIdentity::generate(OsRng));
    let announce = destination.announce(OsRng, Some(b"Plum")).expect("announce");
    let frame = hdlc::encode(&announce.to_bytes().expect("serializable"));

    let mut announces = receiver.announce_events();
    port.deliver(frame.clone());
    port.deliver(frame.clone());
    port.deliver(frame);

    let first = tokio::time::timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce processed")
        .expect("announce event");
    assert_eq!(first.destination, *destination.address());

    // The replays must have been dropped by the dedup filter.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(announces.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn learned_state_survives_save_and_load() {
    let alice = node("alice");
    let bob = node("bob");
    connect(&alice, &bob).await;

    let destination = fruits_destination(PrivateIdentity::generate(OsRng));
    let destination_hash = *destination.address();
    let registered = alice.register_destination(destination).await;

    let mut announces = bob.announce_events();
    alice
        .announce(&registered, Some(b"Durian"))
        .await
        .expect("announce sent");
    tokio::time::timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce arrives")
        .expect("announce event");

    let dir = tempfile::tempdir().expect("temp dir");
    bob.save_state(dir.path()).await.expect("state saved");

    let carol = node("carol");
    carol.load_state(dir.path()).await.expect("state loaded");
    let recalled = carol
        .recall(&destination_hash)
        .await
        .expect("identity restored from disk");
    assert!(!recalled.hash.is_empty());
    assert_eq!(
        carol.recall_app_data(&destination_hash).await.as_deref(),
        Some(&b"Durian"[..])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn link_requests_respect_handler_policy() {
    let client = node("client");
    let server = node("server");
    connect(&client, &server).await;

    let client_identity = PrivateIdentity::generate(OsRng);
    let allowed = *client_identity.hash();

    let mut destination = fruits_destination(PrivateIdentity::generate(OsRng));
    destination.register_request_handler(
        "status/info",
        Arc::new(
            |_path: &str,
             data: &[u8],
             _remote: Option<&reticulum_core::identity::Identity>|
             -> Option<Vec<u8>> {
                let mut response = b"echo:".to_vec();
                response.extend_from_slice(data);
                Some(response)
            },
        ),
        RequestPolicy::AllowList(vec![allowed]),
    );
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

    let mut client_messages = client.messages();

    // Unidentified peers are refused under an allow-list policy.
    client
        .send_link_request(&link_id, "status/info", b"first")
        .await
        .expect("request sent");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client_messages.try_recv().is_err());

    // After identifying, the same request is served.
    client
        .identify_on_link(&link_id, &client_identity)
        .await
        .expect("identify sent");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let request_id = client
        .send_link_request(&link_id, "status/info", b"second")
        .await
        .expect("request sent");

    let response = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client_messages.recv().await {
                Ok(message) if message.context == PacketContext::Response => break message,
                Ok(_) => continue,
                Err(err) => panic!("client message stream: {err}"),
            }
        }
    })
    .await
    .expect("response arrives");

    let (echoed_id, body) = response.data.split_at(10);
    assert_eq!(
        TruncatedHash::from_slice(echoed_id).expect("request id"),
        request_id
    );
    assert_eq!(body, b"echo:second");
}
