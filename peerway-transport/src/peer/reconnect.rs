use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use super::PeerId;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;
const BACKOFF_JITTER: f64 = 0.2;
// 500ms << 16 is already far beyond the cap
const BACKOFF_MAX_EXP: u32 = 16;

#[derive(Default)]
struct PeerAttempts {
    attempt: u32,
    active: bool,
}

/// Pure reconnection bookkeeping: per-peer attempt counters and the
/// authoritative "a reconnection episode is running" flag. No I/O.
pub struct ReconnectionManager {
    peers: HashMap<PeerId, PeerAttempts>,
    rng: StdRng,
}

impl ReconnectionManager {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn start_reconnection(&mut self, peer_id: &PeerId) {
        self.peers.entry(peer_id.clone()).or_default().active = true;
    }

    pub fn stop_reconnection(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.active = false;
        }
    }

    pub fn is_reconnecting(&self, peer_id: &PeerId) -> bool {
        self.peers.get(peer_id).map_or(false, |peer| peer.active)
    }

    pub fn increment_attempt(&mut self, peer_id: &PeerId) -> u32 {
        let peer = self.peers.entry(peer_id.clone()).or_default();
        peer.attempt += 1;
        peer.attempt
    }

    /// Whether the current attempt may run. `max_attempts == 0` means
    /// unbounded; otherwise attempt number `max_attempts` is the last one
    /// that runs.
    pub fn should_retry(&self, peer_id: &PeerId, max_attempts: u32) -> bool {
        if max_attempts == 0 {
            return true;
        }
        let attempt = self.peers.get(peer_id).map_or(0, |peer| peer.attempt);
        attempt <= max_attempts
    }

    /// Jittered exponential backoff for the current attempt:
    /// `min(cap, base * 2^(attempt - 1)) * (1 ± jitter)`.
    pub fn calculate_backoff(&mut self, peer_id: &PeerId) -> Duration {
        let attempt = self.peers.get(peer_id).map_or(0, |peer| peer.attempt);
        let exp = attempt.saturating_sub(1).min(BACKOFF_MAX_EXP);
        let raw_ms = BACKOFF_BASE_MS
            .saturating_mul(1u64 << exp)
            .min(BACKOFF_CAP_MS);
        let jitter = self.rng.gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
        Duration::from_millis(((raw_ms as f64) * (1.0 + jitter)).round() as u64)
    }

    pub fn reset_backoff(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.attempt = 0;
        }
    }

    /// Forget every peer's accumulated delay. Invoked on wake-from-sleep so
    /// pending episodes retry at the shortest backoff instead of a stale,
    /// inflated one.
    pub fn reset_all_backoffs(&mut self) {
        for peer in self.peers.values_mut() {
            peer.attempt = 0;
        }
    }

    pub fn clear_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
