//! End-to-end smoke test: two peer networks wired through the in-process
//! hub, exchanging messages in both directions over one channel.

mod support;

use peerway_transport::MemoryHub;
use peerway_transport::NetworkConfig;
use peerway_transport::PeerId;
use peerway_transport::PeerNetwork;

use support::init_logs;
use support::payload;
use support::RecordingHandler;

#[tokio::test]
async fn two_networks_talk_over_the_memory_hub() {
    init_logs();
    let hub = MemoryHub::new();
    let (alice_handler, mut alice_inbox) = RecordingHandler::new();
    let (bob_handler, mut bob_inbox) = RecordingHandler::new();
    let alice_net = PeerNetwork::new(
        hub.endpoint("alice"),
        alice_handler,
        NetworkConfig::default(),
    );
    let bob_net = PeerNetwork::new(hub.endpoint("bob"), bob_handler, NetworkConfig::default());
    let alice = PeerId::from("alice");
    let bob = PeerId::from("bob");

    let ping = alice_net.send(&bob, payload("ping")).unwrap();
    let (from, message) = bob_inbox.recv().await.unwrap();
    assert_eq!(from, alice);
    assert_eq!(message.method, "ping");
    assert_eq!(ping.acked().await, Ok(1));

    // bob answers over the channel alice's dial installed on his side
    let pong = bob_net.send(&alice, payload("pong")).unwrap();
    let (from, message) = alice_inbox.recv().await.unwrap();
    assert_eq!(from, bob);
    assert_eq!(message.method, "pong");
    assert_eq!(pong.acked().await, Ok(1));

    assert_eq!(alice_net.installed_channels(), 1);
    assert_eq!(bob_net.installed_channels(), 1);

    alice_net.stop().await;
    bob_net.stop().await;
}
