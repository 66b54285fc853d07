//!
//! Frame tap
//!
//! Sits between a dialing endpoint and its target, forwarding
//! length-delimited frames in both directions unchanged while printing the
//! decoded wire messages.
//!
//! The handshake hello and any frame that does not parse as a `WireMessage`
//! are forwarded untouched and shown as opaque bytes.
//!
use anyhow::Result;
use futures::SinkExt;
use futures::StreamExt;
use peerway_transport::WireMessage;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

pub struct FrameTap {}

impl FrameTap {
    pub fn new(bind_addr: SocketAddr, forward_addr: SocketAddr, verbosity: u8) -> Self {
        let runner = FrameTapRunner {
            bind_addr,
            forward_addr,
            verbosity,
        };
        tokio::spawn(async move { runner.run().await });
        FrameTap {}
    }
}

struct FrameTapRunner {
    bind_addr: SocketAddr,
    forward_addr: SocketAddr,
    verbosity: u8,
}

impl FrameTapRunner {
    async fn run(self) {
        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                println!("pwtap: bind {} failed: {}", self.bind_addr, err);
                return;
            }
        };
        println!("pwtap listening on {}", self.bind_addr);
        let mut next_id: u64 = 1;
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let id = next_id;
                    next_id += 1;
                    println!("[{}] new connection from {}", id, remote_addr);
                    LinkRunner::spawn(id, stream, self.forward_addr, self.verbosity);
                }
                Err(err) => {
                    println!("pwtap: accept failed: {}", err);
                    return;
                }
            }
        }
    }
}

struct LinkRunner {
    id: u64,
    caller: Framed<TcpStream, LengthDelimitedCodec>,
    target: Framed<TcpStream, LengthDelimitedCodec>,
    verbosity: u8,
}

impl LinkRunner {
    fn spawn(id: u64, caller: TcpStream, forward_addr: SocketAddr, verbosity: u8) {
        tokio::spawn(async move {
            let target = match TcpStream::connect(forward_addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    println!("[{}] connect {} failed: {}", id, forward_addr, err);
                    return;
                }
            };
            let runner = LinkRunner {
                id,
                caller: Framed::new(caller, LengthDelimitedCodec::new()),
                target: Framed::new(target, LengthDelimitedCodec::new()),
                verbosity,
            };
            match runner.run().await {
                Ok(_) => println!("[{}] closed", id),
                Err(err) => println!("[{}] closed: {:?}", id, err),
            }
        });
    }

    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                frame = self.caller.next() => {
                    let Some(frame) = frame else { return Ok(()) };
                    let frame = frame?.freeze();
                    self.show("C->T", &frame);
                    self.target.send(frame).await?;
                },
                frame = self.target.next() => {
                    let Some(frame) = frame else { return Ok(()) };
                    let frame = frame?.freeze();
                    self.show("T->C", &frame);
                    self.caller.send(frame).await?;
                },
            }
        }
    }

    fn show(&self, dir: &str, frame: &[u8]) {
        if self.verbosity == 0 {
            return;
        }
        let prefix = format!("[{}] {}", self.id, dir);
        match WireMessage::decode(frame) {
            Ok(message) => {
                let kind = if message.is_data() {
                    message
                        .payload
                        .as_ref()
                        .map(|p| p.method.clone())
                        .unwrap_or_else(|| "data".to_string())
                } else {
                    "ack".to_string()
                };
                match self.verbosity {
                    1 => println!("{} seq={} ack={:?} {}", prefix, message.seq, message.ack, kind),
                    _ => println!("{} {:#?}", prefix, message),
                }
            }
            Err(_) => println!("{} {} opaque bytes", prefix, frame.len()),
        }
    }
}
