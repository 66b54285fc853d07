//!
//! Shared machinery for the integration scenarios: a scripted channel
//! factory whose dial outcomes are planned per peer, plus helpers for
//! driving the remote end of each link by hand.
//!
#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use peerway_transport::net::memory::frame_pipe;
use peerway_transport::ChannelFactory;
use peerway_transport::FrameReader;
use peerway_transport::FrameWriter;
use peerway_transport::InboundChannel;
use peerway_transport::MessageHandler;
use peerway_transport::MessagePayload;
use peerway_transport::PeerId;
use peerway_transport::RawChannel;
use peerway_transport::WireMessage;

const WAIT_LIMIT: Duration = Duration::from_secs(30);

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn payload(method: &str) -> MessagePayload {
    MessagePayload::new(method, vec![json!(1)])
}

pub async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// One scripted outcome for a dial attempt.
pub enum DialPlan {
    /// Produce a live link.
    Connect,
    /// Fail with a retryable (connection refused) error.
    Refuse,
    /// Fail with a non-retryable error.
    Fatal,
    /// Block until released, then produce a live link.
    HoldThenConnect(oneshot::Receiver<()>),
    /// Produce a link whose writes never complete.
    ConnectStalled,
}

pub struct ScriptedFactory {
    plans: Mutex<HashMap<PeerId, VecDeque<DialPlan>>>,
    dials: AtomicUsize,
    links_tx: mpsc::UnboundedSender<RemoteEnd>,
    links_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RemoteEnd>>,
    inbound_tx: mpsc::UnboundedSender<InboundChannel>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundChannel>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            plans: Mutex::new(HashMap::new()),
            dials: AtomicUsize::new(0),
            links_tx,
            links_rx: tokio::sync::Mutex::new(links_rx),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    /// Queue dial outcomes for a peer; exhausted plans fall back to
    /// `Connect`.
    pub fn plan(&self, peer: &str, plans: Vec<DialPlan>) {
        self.plans
            .lock()
            .expect("plan lock")
            .entry(PeerId::from(peer))
            .or_default()
            .extend(plans);
    }

    pub fn plan_refusals(&self, peer: &str, count: usize) {
        self.plan(peer, (0..count).map(|_| DialPlan::Refuse).collect());
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` dials have been attempted.
    pub async fn wait_dial_count(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while self.dial_count() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for dial #{count}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// The test-side end of the most recent successful dial.
    pub async fn next_link(&self) -> RemoteEnd {
        let mut links = self.links_rx.lock().await;
        tokio::time::timeout(WAIT_LIMIT, links.recv())
            .await
            .expect("timed out waiting for a link")
            .expect("factory gone")
    }

    /// Announce an inbound channel from `peer` and return its test-side end.
    pub fn push_inbound(&self, peer: &str) -> RemoteEnd {
        let (near, far) = frame_pipe();
        self.inbound_tx
            .send(InboundChannel {
                peer_id: PeerId::from(peer),
                channel: near,
            })
            .expect("inbound stream taken");
        RemoteEnd::new(far)
    }

    fn next_plan(&self, peer_id: &PeerId) -> DialPlan {
        self.plans
            .lock()
            .expect("plan lock")
            .get_mut(peer_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(DialPlan::Connect)
    }

    fn make_link(&self) -> RawChannel {
        let (near, far) = frame_pipe();
        let _ = self.links_tx.send(RemoteEnd::new(far));
        near
    }
}

#[async_trait]
impl ChannelFactory for ScriptedFactory {
    async fn dial(
        &self,
        peer_id: &PeerId,
        _hints: &[String],
        _retry: bool,
    ) -> anyhow::Result<RawChannel> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.next_plan(peer_id) {
            DialPlan::Connect => Ok(self.make_link()),
            DialPlan::Refuse => Err(anyhow::Error::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{peer_id} refused"),
            ))),
            DialPlan::Fatal => Err(anyhow!("unsupported transport for {peer_id}")),
            DialPlan::HoldThenConnect(release) => {
                let _ = release.await;
                Ok(self.make_link())
            }
            DialPlan::ConnectStalled => {
                let link = self.make_link();
                Ok(RawChannel {
                    reader: link.reader,
                    writer: Box::new(StalledWriter),
                })
            }
        }
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundChannel>> {
        self.inbound_rx.lock().expect("inbound lock").take()
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct StalledWriter;

#[async_trait]
impl FrameWriter for StalledWriter {
    async fn write(&mut self, _frame: Bytes) -> anyhow::Result<()> {
        futures::future::pending().await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The test's side of one link: reads what the network transmitted, writes
/// what the network should receive.
pub struct RemoteEnd {
    reader: Option<Box<dyn FrameReader>>,
    writer: Option<Box<dyn FrameWriter>>,
}

impl RemoteEnd {
    fn new(channel: RawChannel) -> Self {
        Self {
            reader: Some(channel.reader),
            writer: Some(channel.writer),
        }
    }

    /// Next frame of any kind.
    pub async fn expect_frame(&mut self) -> WireMessage {
        let reader = self.reader.as_mut().expect("reader was dropped");
        let frame = tokio::time::timeout(WAIT_LIMIT, reader.read())
            .await
            .expect("timed out waiting for a frame")
            .expect("link failed")
            .expect("link closed");
        WireMessage::decode(&frame).expect("frame decodes")
    }

    /// Next data frame, skipping pure acks.
    pub async fn expect_data(&mut self) -> WireMessage {
        loop {
            let message = self.expect_frame().await;
            if message.is_data() {
                return message;
            }
        }
    }

    /// The link must end (EOF or error) after at most a few stray frames.
    pub async fn expect_closed(&mut self) {
        let reader = self.reader.as_mut().expect("reader was dropped");
        for _ in 0..16 {
            match tokio::time::timeout(WAIT_LIMIT, reader.read()).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) => return,
                Ok(Err(_)) => return,
                Err(_) => panic!("timed out waiting for the link to close"),
            }
        }
        panic!("link kept producing frames");
    }

    pub async fn send(&mut self, message: WireMessage) {
        let writer = self.writer.as_mut().expect("writer was dropped");
        writer
            .write(message.encode().expect("encode"))
            .await
            .expect("send frame");
    }

    pub async fn send_data(&mut self, seq: u64, ack: Option<u64>, method: &str) {
        self.send(WireMessage::data(seq, ack, payload(method))).await;
    }

    pub async fn ack(&mut self, seq: u64) {
        self.send(WireMessage::pure_ack(seq)).await;
    }

    /// Drop the test-side reader so the network's next write fails with a
    /// retryable error, while its reader stays open.
    pub fn sever_write_path(&mut self) {
        self.reader = None;
    }

    /// Drop the test-side writer so the network's reader sees a clean
    /// end-of-stream.
    pub fn sever_read_path(&mut self) {
        self.writer = None;
    }
}

/// Records every payload handed to the application.
pub struct RecordingHandler {
    delivered: mpsc::UnboundedSender<(PeerId, MessagePayload)>,
}

impl RecordingHandler {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(PeerId, MessagePayload)>,
    ) {
        let (delivered, inbox) = mpsc::unbounded_channel();
        (Arc::new(Self { delivered }), inbox)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, peer_id: &PeerId, payload: MessagePayload) -> anyhow::Result<()> {
        let _ = self.delivered.send((peer_id.clone(), payload));
        Ok(())
    }
}
