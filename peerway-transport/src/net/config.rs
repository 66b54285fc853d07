use std::time::Duration;

/// Construction-time options of a `PeerNetwork`. All state is in-process;
/// nothing is persisted.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Static location hints appended to every dial.
    pub relays: Vec<String>,
    /// Per-peer pending-message capacity.
    pub max_queue: usize,
    /// Cap on reconnection attempts per uninterrupted episode; 0 = unbounded.
    pub max_retry_attempts: u32,
    /// Cap on simultaneously installed channels.
    pub max_concurrent_connections: usize,
    /// Hard cap on the serialized payload size of one message.
    pub max_message_size_bytes: usize,
    /// Period of the stale-peer sweep.
    pub cleanup_interval: Duration,
    /// Idle time after which inactive peers are garbage-collected.
    pub stale_peer_timeout: Duration,
    /// Deadline for each channel write.
    pub write_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            max_queue: 200,
            max_retry_attempts: 0,
            max_concurrent_connections: 100,
            max_message_size_bytes: 1_048_576,
            cleanup_interval: Duration::from_secs(900),
            stale_peer_timeout: Duration::from_secs(1800),
            write_timeout: Duration::from_secs(10),
        }
    }
}
