//!
//! Peerway transport
//!
//! Sends an ordered, reliably-delivered stream of application messages to a
//! named peer, and receives the symmetric stream in return, across channels
//! that may break and be rebuilt at any time.
//!
//! Every data frame carries a monotone sequence number and a piggyback
//! cumulative acknowledgment. A send completes only once its sequence has
//! been acknowledged; unacknowledged messages are retransmitted on the
//! rebuilt channel after a reconnection.
//!
pub mod net;
pub mod peer;
pub mod wire;

pub use net::channel::ChannelFactory;
pub use net::channel::FrameReader;
pub use net::channel::FrameWriter;
pub use net::channel::InboundChannel;
pub use net::channel::MessageHandler;
pub use net::channel::RawChannel;
pub use net::config::NetworkConfig;
pub use net::fault::ChannelFault;
pub use net::fault::FaultClassifier;
pub use net::fault::IoFaultClassifier;
pub use net::memory::MemoryHub;
pub use net::network::NetworkHooks;
pub use net::network::PeerNetwork;
pub use net::tcp::TcpFactory;
pub use net::wake::ManualWakeDetector;
pub use net::wake::WakeDetector;
pub use peer::queue::Delivery;
pub use peer::queue::DeliveryError;
pub use peer::PeerId;
pub use wire::message::MessagePayload;
pub use wire::message::WireMessage;
