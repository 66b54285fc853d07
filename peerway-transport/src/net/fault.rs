//!
//! Classification of channel-level failures. The core never embeds
//! transport-specific error codes; it asks a classifier whether a fault is
//! worth a reconnection attempt or marks an intentional remote disconnect.
//!
use std::io;

/// Faults the core itself produces while driving a channel.
#[derive(thiserror::Error, Debug)]
pub enum ChannelFault {
    #[error("channel write timed out")]
    WriteTimeout,
    #[error("remote peer disconnected intentionally")]
    RemoteHangup,
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

pub trait FaultClassifier: Send + Sync {
    /// Is this fault transient enough that reconnecting may help?
    fn is_retryable(&self, err: &anyhow::Error) -> bool;

    /// Did the remote end abort on purpose (user-initiated disconnect)?
    fn is_remote_hangup(&self, err: &anyhow::Error) -> bool;
}

/// Default classifier over `std::io::Error` kinds and the core's own
/// `ChannelFault` markers.
pub struct IoFaultClassifier;

impl FaultClassifier for IoFaultClassifier {
    fn is_retryable(&self, err: &anyhow::Error) -> bool {
        if let Some(fault) = err.downcast_ref::<ChannelFault>() {
            return matches!(fault, ChannelFault::WriteTimeout);
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            use std::io::ErrorKind::*;
            return matches!(
                io_err.kind(),
                ConnectionReset
                    | ConnectionAborted
                    | ConnectionRefused
                    | NotConnected
                    | BrokenPipe
                    | TimedOut
                    | UnexpectedEof
                    | Interrupted
                    | WouldBlock
                    | AddrNotAvailable
            );
        }
        false
    }

    fn is_remote_hangup(&self, err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ChannelFault>(),
            Some(ChannelFault::RemoteHangup)
        )
    }
}
