use std::collections::BTreeSet;
use std::time::Instant;

use log::debug;

use super::queue::DeliveryError;
use super::queue::MessageQueue;
use super::queue::PendingMessage;
use super::PeerId;

const LOG_TARGET: &str = "peerway::peer";

/// Per-peer connection record: sequence counters, the pending-message FIFO,
/// location hints, and lifecycle flags.
///
/// Sequence counters store the *next* sequence to assign, so the first data
/// frame ever transmitted carries `seq == 1`. The queue entry at position
/// `k` transmits as `start_seq + k`; once every queued message has been
/// transmitted at least once, `start_seq + pending.len() == next_send_seq`,
/// and an empty queue keeps `start_seq == next_send_seq`.
pub(crate) struct PeerConnectionState {
    peer_id: PeerId,
    location_hints: BTreeSet<String>,
    next_send_seq: u64,
    highest_received_seq: u64,
    start_seq: u64,
    pending: MessageQueue,
    pub intentionally_closed: bool,
    last_activity: Instant,
}

impl PeerConnectionState {
    pub fn new(peer_id: PeerId, queue_capacity: usize) -> Self {
        Self {
            peer_id,
            location_hints: BTreeSet::new(),
            next_send_seq: 1,
            highest_received_seq: 0,
            start_seq: 1,
            pending: MessageQueue::new(queue_capacity),
            intentionally_closed: false,
            last_activity: Instant::now(),
        }
    }

    pub fn enqueue(&mut self, pending: PendingMessage) -> Result<(), PendingMessage> {
        if self.pending.is_empty() {
            // Enqueue-from-empty realigns the head's sequence.
            self.start_seq = self.next_send_seq;
        }
        self.pending.enqueue(pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_mut(&mut self, index: usize) -> Option<&mut PendingMessage> {
        self.pending.get_mut(index)
    }

    /// First-transmission time of the queue head, if it has been on the wire.
    pub fn oldest_pending_sent_at(&self) -> Option<Instant> {
        self.pending.peek_first().and_then(|entry| entry.first_sent())
    }

    /// Sequence the queue entry at `index` transmits with.
    pub fn seq_for_index(&self, index: usize) -> u64 {
        self.start_seq + index as u64
    }

    /// Queue position of the first message that has never been transmitted;
    /// equals the queue length when everything has been on the wire.
    pub fn first_untransmitted_index(&self) -> usize {
        (self.next_send_seq - self.start_seq) as usize
    }

    /// Advance the send counter past `seq` for a first transmission.
    /// Retransmissions carry sequences below the counter and leave it alone.
    pub fn note_transmitted(&mut self, seq: u64) {
        if seq >= self.next_send_seq {
            self.next_send_seq = seq + 1;
        }
    }

    /// Cumulative acknowledgment: resolve and drop every pending message
    /// whose sequence is covered by `ack_seq`. Sequences that were never
    /// transmitted, or that are already resolved, are untouched, which makes
    /// stale and out-of-range acks no-ops.
    pub fn ack_messages(&mut self, ack_seq: u64) -> usize {
        let mut resolved = 0;
        while !self.pending.is_empty()
            && self.start_seq <= ack_seq
            && self.start_seq < self.next_send_seq
        {
            if let Some(head) = self.pending.dequeue() {
                head.resolve(self.start_seq);
            }
            self.start_seq += 1;
            resolved += 1;
        }
        resolved
    }

    /// Reject every pending message in order and realign the counters.
    pub fn reject_all_pending(&mut self, reason: DeliveryError) {
        let mut seq = self.start_seq;
        for entry in self.pending.take_all() {
            debug!(
                target: LOG_TARGET,
                "rejecting pending message seq {seq} to {}: {reason}", self.peer_id
            );
            entry.reject(reason.clone());
            seq += 1;
        }
        self.start_seq = self.next_send_seq;
    }

    /// Raise the received watermark. Returns true when `seq` is fresh, false
    /// for duplicates at or below the watermark.
    pub fn raise_received_seq(&mut self, seq: u64) -> bool {
        if seq > self.highest_received_seq {
            self.highest_received_seq = seq;
            true
        } else {
            false
        }
    }

    pub fn highest_received_seq(&self) -> u64 {
        self.highest_received_seq
    }

    /// The ack to piggyback on outbound frames; absent until the first
    /// inbound data frame.
    pub fn piggyback_ack(&self) -> Option<u64> {
        (self.highest_received_seq > 0).then_some(self.highest_received_seq)
    }

    /// Reset all counters to their initial values. Only valid once every
    /// pending message has been resolved or rejected.
    pub fn clear_sequence_numbers(&mut self) {
        debug_assert!(self.pending.is_empty());
        self.next_send_seq = 1;
        self.start_seq = 1;
        self.highest_received_seq = 0;
    }

    pub fn merge_hints<I>(&mut self, hints: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.location_hints.extend(hints);
    }

    /// Hint set for a dial: the peer's accumulated hints plus the statically
    /// configured relays.
    pub fn dial_hints(&self, relays: &[String]) -> Vec<String> {
        let mut hints: Vec<String> = self.location_hints.iter().cloned().collect();
        for relay in relays {
            if !self.location_hints.contains(relay) {
                hints.push(relay.clone());
            }
        }
        hints
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}
