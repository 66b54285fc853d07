//!
//! In-process channel factory.
//!
//! Wires multiple `PeerNetwork`s together over buffered frame pipes, with
//! the hub acting as the address book. Used by tests and examples; dialing
//! resolves purely by peer id, so location hints are ignored.
//!
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::net::channel::ChannelFactory;
use crate::net::channel::FrameReader;
use crate::net::channel::FrameWriter;
use crate::net::channel::InboundChannel;
use crate::net::channel::RawChannel;
use crate::peer::PeerId;

const PIPE_DEPTH: usize = 64;

/// Registry connecting in-process endpoints by peer id.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<InboundChannel>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and return its factory.
    pub fn endpoint(&self, local_id: impl Into<PeerId>) -> Arc<MemoryFactory> {
        let local_id = local_id.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .expect("hub lock")
            .insert(local_id.clone(), inbound_tx);
        Arc::new(MemoryFactory {
            local_id,
            endpoints: Arc::clone(&self.endpoints),
            inbound: Mutex::new(Some(inbound_rx)),
        })
    }
}

pub struct MemoryFactory {
    local_id: PeerId,
    endpoints: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<InboundChannel>>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundChannel>>>,
}

#[async_trait]
impl ChannelFactory for MemoryFactory {
    async fn dial(
        &self,
        peer_id: &PeerId,
        _hints: &[String],
        _retry: bool,
    ) -> anyhow::Result<RawChannel> {
        let remote = self
            .endpoints
            .lock()
            .expect("hub lock")
            .get(peer_id)
            .cloned();
        let Some(remote) = remote else {
            return Err(refused(format!("no endpoint registered for {peer_id}")));
        };
        let (near, far) = frame_pipe();
        remote
            .send(InboundChannel {
                peer_id: self.local_id.clone(),
                channel: far,
            })
            .map_err(|_| refused(format!("endpoint {peer_id} is gone")))?;
        Ok(near)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundChannel>> {
        self.inbound.lock().expect("inbound lock").take()
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.endpoints.lock().expect("hub lock").remove(&self.local_id);
        Ok(())
    }
}

fn refused(reason: String) -> anyhow::Error {
    anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionRefused, reason))
}

/// A linked pair of in-process channels: frames written to one end are read
/// from the other. Closing or dropping a writer ends the remote reader's
/// stream.
pub fn frame_pipe() -> (RawChannel, RawChannel) {
    let (a_tx, a_rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);
    let (b_tx, b_rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);
    (
        RawChannel {
            reader: Box::new(PipeReader { frames: b_rx }),
            writer: Box::new(PipeWriter { frames: Some(a_tx) }),
        },
        RawChannel {
            reader: Box::new(PipeReader { frames: a_rx }),
            writer: Box::new(PipeWriter { frames: Some(b_tx) }),
        },
    )
}

struct PipeReader {
    frames: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameReader for PipeReader {
    async fn read(&mut self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.frames.recv().await)
    }
}

struct PipeWriter {
    frames: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl FrameWriter for PipeWriter {
    async fn write(&mut self, frame: Bytes) -> anyhow::Result<()> {
        let Some(frames) = &self.frames else {
            return Err(broken_pipe("write on closed channel"));
        };
        frames
            .send(frame)
            .await
            .map_err(|_| broken_pipe("remote end is gone"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.frames = None;
        Ok(())
    }
}

fn broken_pipe(reason: &str) -> anyhow::Error {
    anyhow::Error::new(io::Error::new(io::ErrorKind::BrokenPipe, reason.to_string()))
}
