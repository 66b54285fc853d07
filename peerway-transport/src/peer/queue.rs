use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::wire::message::MessagePayload;

/// Terminal states a pending send can end in, as seen by the caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("connection was closed locally")]
    IntentionallyClosed,
    #[error("peer network is stopped")]
    Stopped,
    #[error("gave up delivering to the peer")]
    GaveUp,
}

/// Completion handle returned by `send`. Resolves with the message's
/// sequence number once the remote has acknowledged it.
#[derive(Debug)]
pub struct Delivery {
    acked: oneshot::Receiver<Result<u64, DeliveryError>>,
}

impl Delivery {
    pub async fn acked(self) -> Result<u64, DeliveryError> {
        match self.acked.await {
            Ok(outcome) => outcome,
            // The producing task went away without resolving us, which only
            // happens when the network is torn down.
            Err(_) => Err(DeliveryError::Stopped),
        }
    }
}

/// An outbound message whose acknowledgment has not arrived yet.
#[derive(Debug)]
pub(crate) struct PendingMessage {
    payload: MessagePayload,
    first_sent: Option<Instant>,
    retry_count: u32,
    done: oneshot::Sender<Result<u64, DeliveryError>>,
}

impl PendingMessage {
    pub fn new(payload: MessagePayload) -> (Self, Delivery) {
        let (done, acked) = oneshot::channel();
        (
            Self {
                payload,
                first_sent: None,
                retry_count: 0,
                done,
            },
            Delivery { acked },
        )
    }

    pub fn payload(&self) -> &MessagePayload {
        &self.payload
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn first_sent(&self) -> Option<Instant> {
        self.first_sent
    }

    /// Record one transmission. The first call stamps the send time; every
    /// later call is a retransmission.
    pub fn note_transmitted(&mut self, now: Instant) {
        match self.first_sent {
            None => self.first_sent = Some(now),
            Some(_) => self.retry_count += 1,
        }
    }

    pub fn resolve(self, seq: u64) {
        let _ = self.done.send(Ok(seq));
    }

    pub fn reject(self, reason: DeliveryError) {
        let _ = self.done.send(Err(reason));
    }
}

/// Bounded FIFO of pending messages. A full queue refuses new entries; the
/// oldest entry is never displaced, since its caller is still awaiting it.
pub(crate) struct MessageQueue {
    items: VecDeque<PendingMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Append a pending message, or hand it back when at capacity.
    pub fn enqueue(&mut self, pending: PendingMessage) -> Result<(), PendingMessage> {
        if self.items.len() >= self.capacity {
            return Err(pending);
        }
        self.items.push_back(pending);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<PendingMessage> {
        self.items.pop_front()
    }

    pub fn peek_first(&self) -> Option<&PendingMessage> {
        self.items.front()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PendingMessage> {
        self.items.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Empty the queue, yielding the entries in order.
    pub fn take_all(&mut self) -> VecDeque<PendingMessage> {
        std::mem::take(&mut self.items)
    }
}
