//! Reconnection scenarios: queue-and-flush across a rebuilt channel,
//! give-up after the attempt budget, the inbound-during-dial race, write
//! timeouts, and wake-from-sleep backoff resets.

mod support;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use peerway_transport::DeliveryError;
use peerway_transport::ManualWakeDetector;
use peerway_transport::NetworkConfig;
use peerway_transport::NetworkHooks;
use peerway_transport::PeerId;
use peerway_transport::PeerNetwork;
use peerway_transport::WakeDetector;

use support::init_logs;
use support::payload;
use support::wait_until;
use support::DialPlan;
use support::RecordingHandler;
use support::ScriptedFactory;

#[tokio::test(start_paused = true)]
async fn reconnect_flushes_queued_messages_in_order() {
    init_logs();
    let factory = ScriptedFactory::new();
    let (handler, _inbox) = RecordingHandler::new();
    let net = PeerNetwork::new(factory.clone(), handler, NetworkConfig::default());
    let peer = PeerId::from("alpha");

    let d1 = net.send(&peer, payload("m1")).unwrap();
    let mut link = factory.next_link().await;
    assert_eq!(link.expect_data().await.seq, 1);
    link.ack(1).await;
    assert_eq!(d1.acked().await, Ok(1));

    // the next write fails; sends issued meanwhile queue for the flush
    link.sever_write_path();
    let d2 = net.send(&peer, payload("m2")).unwrap();
    let d3 = net.send(&peer, payload("m3")).unwrap();

    let mut link = factory.next_link().await;
    let f2 = link.expect_data().await;
    let f3 = link.expect_data().await;
    assert_eq!(f2.seq, 2);
    assert_eq!(f2.payload.unwrap().method, "m2");
    assert_eq!(f3.seq, 3);
    assert_eq!(f3.payload.unwrap().method, "m3");

    link.ack(3).await;
    assert_eq!(d2.acked().await, Ok(2));
    assert_eq!(d3.acked().await, Ok(3));
    assert_eq!(factory.dial_count(), 2);
    assert!(!net.is_reconnecting(&peer));

    net.stop().await;
}

#[tokio::test(start_paused = true)]
async fn give_up_after_exhausting_the_attempt_budget() {
    init_logs();
    let factory = ScriptedFactory::new();
    let (handler, _inbox) = RecordingHandler::new();
    let gave_up = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&gave_up);
    let hooks = NetworkHooks {
        on_give_up: Some(Arc::new(move |_peer: &PeerId| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let config = NetworkConfig {
        max_retry_attempts: 3,
        ..Default::default()
    };
    let net = PeerNetwork::with_hooks(factory.clone(), handler, config, hooks);
    let peer = PeerId::from("alpha");

    let d1 = net.send(&peer, payload("m1")).unwrap();
    let mut link = factory.next_link().await;
    assert_eq!(link.expect_data().await.seq, 1);
    link.ack(1).await;
    assert_eq!(d1.acked().await, Ok(1));

    // attempt = max is the last attempt that runs; the check after it
    // terminates the episode
    factory.plan_refusals("alpha", 3);
    link.sever_write_path();
    let d2 = net.send(&peer, payload("m2")).unwrap();
    assert_eq!(d2.acked().await, Err(DeliveryError::GaveUp));
    wait_until(|| gave_up.load(Ordering::SeqCst) == 1, "the give-up hook").await;
    assert_eq!(factory.dial_count(), 4);
    assert!(!net.is_reconnecting(&peer));

    // a later send opens a fresh episode from scratch
    let d4 = net.send(&peer, payload("m4")).unwrap();
    let mut link = factory.next_link().await;
    let frame = link.expect_data().await;
    assert_eq!(frame.seq, 2);
    assert_eq!(frame.payload.unwrap().method, "m4");
    link.ack(2).await;
    assert_eq!(d4.acked().await, Ok(2));
    assert_eq!(gave_up.load(Ordering::SeqCst), 1);

    net.stop().await;
}

#[tokio::test(start_paused = true)]
async fn inbound_channel_preempts_a_reconnect_dial() {
    init_logs();
    let factory = ScriptedFactory::new();
    let (handler, _inbox) = RecordingHandler::new();
    let net = PeerNetwork::new(factory.clone(), handler, NetworkConfig::default());
    let peer = PeerId::from("alpha");

    let d1 = net.send(&peer, payload("m1")).unwrap();
    let mut link = factory.next_link().await;
    assert_eq!(link.expect_data().await.seq, 1);
    link.ack(1).await;
    assert_eq!(d1.acked().await, Ok(1));

    // hold the reconnect dial open, then hand the peer an inbound channel
    let (release, held) = oneshot::channel();
    factory.plan("alpha", vec![DialPlan::HoldThenConnect(held)]);
    link.sever_write_path();
    let d2 = net.send(&peer, payload("m2")).unwrap();
    factory.wait_dial_count(2).await;

    let mut inbound = factory.push_inbound("alpha");
    let frame = inbound.expect_data().await;
    assert_eq!(frame.seq, 2);
    inbound.ack(2).await;
    assert_eq!(d2.acked().await, Ok(2));
    assert!(!net.is_reconnecting(&peer));

    // when the held dial finally lands, its channel is discarded
    release.send(()).unwrap();
    let mut redundant = factory.next_link().await;
    redundant.expect_closed().await;
    assert_eq!(net.installed_channels(), 1);

    net.stop().await;
}

#[tokio::test(start_paused = true)]
async fn write_timeout_is_treated_as_connection_loss() {
    init_logs();
    let factory = ScriptedFactory::new();
    let (handler, _inbox) = RecordingHandler::new();
    let net = PeerNetwork::new(factory.clone(), handler, NetworkConfig::default());
    let peer = PeerId::from("alpha");

    factory.plan("alpha", vec![DialPlan::ConnectStalled]);
    let d1 = net.send(&peer, payload("m1")).unwrap();
    let _stalled = factory.next_link().await;

    // the stalled write expires after write_timeout and the message is
    // delivered over the rebuilt channel with its original sequence
    let mut link = factory.next_link().await;
    let frame = link.expect_data().await;
    assert_eq!(frame.seq, 1);
    link.ack(1).await;
    assert_eq!(d1.acked().await, Ok(1));
    assert_eq!(factory.dial_count(), 2);

    net.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wake_resets_backoff_for_pending_episodes() {
    init_logs();
    let factory = ScriptedFactory::new();
    let (handler, _inbox) = RecordingHandler::new();
    let wake = Arc::new(ManualWakeDetector::new());
    let hooks = NetworkHooks {
        wake_detector: Some(Arc::clone(&wake) as Arc<dyn WakeDetector>),
        ..Default::default()
    };
    let net = PeerNetwork::with_hooks(factory.clone(), handler, NetworkConfig::default(), hooks);
    let alpha = PeerId::from("alpha");
    let beta = PeerId::from("beta");

    factory.plan_refusals("alpha", 50);
    factory.plan_refusals("beta", 50);
    let da = net.send(&alpha, payload("a")).unwrap();
    let db = net.send(&beta, payload("b")).unwrap();

    // let both episodes inflate their backoff up to the cap
    tokio::time::sleep(Duration::from_secs(120)).await;
    let before = factory.dial_count();

    // after a wake both peers retry at the shortest backoff instead of the
    // inflated one
    wake.wake_now();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(
        factory.dial_count() >= before + 2,
        "expected prompt retries after wake, got {} -> {}",
        before,
        factory.dial_count()
    );

    // and no sends were lost: both deliver once channels appear
    let mut ia = factory.push_inbound("alpha");
    let fa = ia.expect_data().await;
    ia.ack(fa.seq).await;
    assert_eq!(da.acked().await, Ok(1));

    let mut ib = factory.push_inbound("beta");
    let fb = ib.expect_data().await;
    ib.ack(fb.seq).await;
    assert_eq!(db.acked().await, Ok(1));

    net.stop().await;
}
