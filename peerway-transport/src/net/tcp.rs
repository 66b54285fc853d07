//!
//! TCP channel factory.
//!
//! Channels are TCP streams with length-delimited framing. The dialing side
//! identifies itself with a single hello frame before the first wire
//! message; location hints are `host:port` strings tried in order.
//!
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use futures::SinkExt;
use futures::StreamExt;
use log::debug;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;

use crate::net::channel::ChannelFactory;
use crate::net::channel::FrameReader;
use crate::net::channel::FrameWriter;
use crate::net::channel::InboundChannel;
use crate::net::channel::RawChannel;
use crate::peer::PeerId;

const LOG_TARGET: &str = "peerway::tcp";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize)]
struct Hello {
    peer: String,
}

pub struct TcpFactory {
    local_id: PeerId,
    local_addr: SocketAddr,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundChannel>>>,
    accept_cancel: CancellationToken,
}

impl TcpFactory {
    /// Bind a listener and start accepting inbound channels.
    pub async fn bind(local_id: impl Into<PeerId>, bind_addr: SocketAddr) -> anyhow::Result<Arc<Self>> {
        let local_id = local_id.into();
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(target: LOG_TARGET, "{local_id} listening on {local_addr}");
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let accept_cancel = CancellationToken::new();
        let factory = Arc::new(Self {
            local_id,
            local_addr,
            inbound: Mutex::new(Some(inbound_rx)),
            accept_cancel: accept_cancel.clone(),
        });
        tokio::spawn(accept_loop(listener, inbound_tx, accept_cancel));
        Ok(factory)
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl ChannelFactory for TcpFactory {
    async fn dial(
        &self,
        peer_id: &PeerId,
        hints: &[String],
        _retry: bool,
    ) -> anyhow::Result<RawChannel> {
        let mut last_err = anyhow!("no location hints for {peer_id}");
        for hint in hints {
            let addr: SocketAddr = match hint.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    last_err = anyhow!("unusable hint {hint}: {err}");
                    continue;
                }
            };
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                    let hello = serde_json::to_vec(&Hello {
                        peer: self.local_id.to_string(),
                    })?;
                    framed.send(hello.into()).await?;
                    debug!(target: LOG_TARGET, "dialed {peer_id} at {addr}");
                    return Ok(split_channel(framed));
                }
                Err(err) => {
                    debug!(target: LOG_TARGET, "dial {peer_id} at {addr} failed: {err}");
                    last_err = err.into();
                }
            }
        }
        Err(last_err)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundChannel>> {
        self.inbound.lock().expect("inbound lock").take()
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.accept_cancel.cancel();
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound_tx: mpsc::UnboundedSender<InboundChannel>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote_addr)) => {
                let inbound_tx = inbound_tx.clone();
                tokio::spawn(async move {
                    match handshake_inbound(stream).await {
                        Ok(inbound) => {
                            let _ = inbound_tx.send(inbound);
                        }
                        Err(err) => debug!(
                            target: LOG_TARGET,
                            "handshake with {remote_addr} failed: {err:#}"
                        ),
                    }
                });
            }
            Err(err) => {
                warn!(target: LOG_TARGET, "accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read the hello frame that names the remote peer, then hand the stream
/// over as a channel.
async fn handshake_inbound(stream: TcpStream) -> anyhow::Result<InboundChannel> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| anyhow!("handshake timed out"))?
        .ok_or_else(|| anyhow!("connection closed before hello"))??;
    let hello: Hello = serde_json::from_slice(&first)?;
    Ok(InboundChannel {
        peer_id: PeerId::from(hello.peer),
        channel: split_channel(framed),
    })
}

fn split_channel(framed: Framed<TcpStream, LengthDelimitedCodec>) -> RawChannel {
    let (sink, stream) = framed.split();
    RawChannel {
        reader: Box::new(TcpFrameReader { frames: stream }),
        writer: Box::new(TcpFrameWriter { frames: sink }),
    }
}

struct TcpFrameReader {
    frames: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}

struct TcpFrameWriter {
    frames: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write(&mut self, frame: Bytes) -> anyhow::Result<()> {
        Ok(self.frames.send(frame).await?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(self.frames.close().await?)
    }
}
