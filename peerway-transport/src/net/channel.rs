//!
//! Behavioral contracts between the transport core and its collaborators:
//! the channel factory below it and the application handler above it.
//!
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::peer::PeerId;
use crate::wire::message::MessagePayload;

/// Write half of an established channel. Frames are opaque to the channel;
/// length framing is the channel's own concern.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write(&mut self, frame: Bytes) -> anyhow::Result<()>;

    /// Graceful shutdown of the write half.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Read half of an established channel.
#[async_trait]
pub trait FrameReader: Send {
    /// The next inbound frame; `Ok(None)` is a clean end-of-stream.
    async fn read(&mut self) -> anyhow::Result<Option<Bytes>>;
}

/// A full-duplex channel to one peer, split into its two halves. The core
/// keeps the writer with the peer state and moves the reader into a
/// dedicated reader task.
pub struct RawChannel {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl std::fmt::Debug for RawChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawChannel").finish_non_exhaustive()
    }
}

/// An inbound channel announced by the factory, tagged with the remote
/// peer's identity.
pub struct InboundChannel {
    pub peer_id: PeerId,
    pub channel: RawChannel,
}

/// Knows how to dial and accept raw channels. Address resolution, relay
/// traversal, and transport negotiation all live behind this seam.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open a channel to `peer_id` using the given location hints.
    /// `retry == true` marks a fresh attempt issued by `send`; `false`
    /// marks a reconnection-loop dial. Implementations may deduplicate
    /// concurrent dials to the same peer.
    async fn dial(
        &self,
        peer_id: &PeerId,
        hints: &[String],
        retry: bool,
    ) -> anyhow::Result<RawChannel>;

    /// The stream of inbound channels. Taken once by the network at
    /// startup; later calls return `None`.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundChannel>>;

    /// Gracefully release a channel that was never installed, or was
    /// displaced before use.
    async fn close_channel(&self, peer_id: &PeerId, channel: RawChannel) -> anyhow::Result<()> {
        let _ = peer_id;
        let mut channel = channel;
        channel.writer.close().await
    }

    /// Shut down all transports.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Application-supplied handler invoked for every fresh inbound data frame.
/// Failures are logged by the core and never propagate.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, peer_id: &PeerId, payload: MessagePayload) -> anyhow::Result<()>;
}
