//!
//! Per-peer runner task.
//!
//! Owns the peer's connection state and serializes every mutation of it:
//! commands from the network handle, frames from the reader task, dial
//! results, and the reconnection backoff timer all land in one select loop.
//! Readers and dials run as sub-tasks so a stalled dial or a long backoff
//! never blocks command processing for the peer.
//!
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use bytes::Bytes;
use log::debug;
use log::info;
use log::warn;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::net::channel::FrameReader;
use crate::net::channel::FrameWriter;
use crate::net::channel::RawChannel;
use crate::net::fault::ChannelFault;
use crate::net::network::NetworkShared;
use crate::net::network::PeerStatus;
use crate::peer::queue::DeliveryError;
use crate::peer::queue::PendingMessage;
use crate::peer::state::PeerConnectionState;
use crate::peer::PeerId;
use crate::wire::message::WireMessage;

const LOG_TARGET: &str = "peerway::peer";

pub(crate) enum PeerCommand {
    Send(PendingMessage),
    Close,
    Reconnect { hints: Vec<String> },
    RegisterHints(Vec<String>),
    HandleAck(u64),
    UpdateReceivedSeq(u64),
    InstallInbound(RawChannel),
    WakeNudge,
    Retire,
}

enum ReadEnd {
    Eof,
    Failed(anyhow::Error),
}

enum PeerEvent {
    Frame(WireMessage),
    ReaderEnded {
        generation: u64,
        end: ReadEnd,
    },
    DialDone {
        generation: u64,
        result: anyhow::Result<RawChannel>,
    },
}

pub(crate) struct PeerRunner {
    peer_id: PeerId,
    shared: Arc<NetworkShared>,
    status: Arc<PeerStatus>,
    state: PeerConnectionState,
    writer: Option<Box<dyn FrameWriter>>,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    event_rx: mpsc::UnboundedReceiver<PeerEvent>,
    // Generations tie reader/dial results to the sub-task that produced
    // them, so results from a replaced channel or a cancelled dial are
    // recognized as stale.
    reader_generation: u64,
    reader_cancel: Option<CancellationToken>,
    dial_generation: u64,
    dialing: bool,
    dial_cancel: Option<CancellationToken>,
    // Deadline of the next reconnection attempt, when an episode is waiting
    // out its backoff.
    retry_at: Option<Instant>,
}

impl PeerRunner {
    pub fn new(
        peer_id: PeerId,
        shared: Arc<NetworkShared>,
        status: Arc<PeerStatus>,
        cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Self {
        let state = PeerConnectionState::new(peer_id.clone(), shared.config.max_queue);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            peer_id,
            shared,
            status,
            state,
            writer: None,
            cmd_rx,
            event_tx,
            event_rx,
            reader_generation: 0,
            reader_cancel: None,
            dial_generation: 0,
            dialing: false,
            dial_cancel: None,
            retry_at: None,
        }
    }

    pub async fn run(mut self) {
        debug!(target: LOG_TARGET, "peer task for {} started", self.peer_id);
        let never = Instant::now() + Duration::from_secs(315_576_000);
        loop {
            let wake_at = self.retry_at.unwrap_or(never);
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(PeerCommand::Retire) => {
                        self.retire();
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = self.event_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                _ = time::sleep_until(wake_at.into()) => self.handle_retry_timer().await,
            }
        }
        self.shutdown();
    }

    async fn handle_command(&mut self, cmd: PeerCommand) {
        match cmd {
            PeerCommand::Send(pending) => self.handle_send(pending).await,
            PeerCommand::Close => self.close_peer(),
            PeerCommand::Reconnect { hints } => self.handle_reconnect(hints),
            PeerCommand::RegisterHints(hints) => self.state.merge_hints(hints),
            PeerCommand::HandleAck(ack_seq) => {
                self.state.ack_messages(ack_seq);
                self.sync_pending_len();
                self.touch();
            }
            PeerCommand::UpdateReceivedSeq(seq) => {
                self.state.raise_received_seq(seq);
                self.touch();
            }
            PeerCommand::InstallInbound(channel) => self.install_inbound(channel).await,
            PeerCommand::WakeNudge => self.handle_wake_nudge(),
            PeerCommand::Retire => {}
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Frame(message) => self.handle_frame(message).await,
            PeerEvent::ReaderEnded { generation, end } => {
                if generation != self.reader_generation {
                    return;
                }
                match end {
                    ReadEnd::Eof => {
                        debug!(target: LOG_TARGET, "remote closed the channel to {}", self.peer_id);
                        self.release_channel();
                    }
                    ReadEnd::Failed(err) => {
                        if self.shared.classifier.is_remote_hangup(&err) {
                            debug!(
                                target: LOG_TARGET,
                                "{} disconnected intentionally", self.peer_id
                            );
                            self.release_channel();
                        } else {
                            self.connection_lost(err);
                        }
                    }
                }
            }
            PeerEvent::DialDone { generation, result } => {
                self.handle_dial_done(generation, result).await;
            }
        }
    }

    async fn handle_send(&mut self, pending: PendingMessage) {
        if self.state.intentionally_closed {
            pending.reject(DeliveryError::IntentionallyClosed);
            return;
        }
        let needs_dial = self.writer.is_none() && !self.is_reconnecting() && !self.dialing;
        if needs_dial
            && self.shared.installed_channels() >= self.shared.config.max_concurrent_connections
        {
            pending.reject(DeliveryError::ResourceLimit(
                "connection limit reached".into(),
            ));
            return;
        }
        if let Err(refused) = self.state.enqueue(pending) {
            refused.reject(DeliveryError::ResourceLimit("send queue full".into()));
            return;
        }
        self.sync_pending_len();
        if self.is_reconnecting() || self.dialing {
            // stays queued; the episode flushes it once a channel lands
            return;
        }
        if self.writer.is_some() {
            let from = self.state.first_untransmitted_index();
            if let Err(err) = self.flush_from(from).await {
                self.connection_lost(err);
            }
        } else {
            self.spawn_dial(true);
        }
    }

    fn close_peer(&mut self) {
        if self.state.intentionally_closed
            && self.writer.is_none()
            && !self.is_reconnecting()
            && !self.dialing
        {
            return;
        }
        info!(target: LOG_TARGET, "closing connection to {}", self.peer_id);
        self.state.intentionally_closed = true;
        self.status
            .intentionally_closed
            .store(true, Ordering::Release);
        self.cancel_dial();
        self.retry_at = None;
        {
            let mut recon = self.shared.recon.lock().expect("reconnection lock");
            recon.stop_reconnection(&self.peer_id);
            recon.reset_backoff(&self.peer_id);
        }
        self.state.reject_all_pending(DeliveryError::IntentionallyClosed);
        self.sync_pending_len();
        self.release_channel();
        self.state.clear_sequence_numbers();
    }

    fn handle_reconnect(&mut self, hints: Vec<String>) {
        self.state.intentionally_closed = false;
        self.status
            .intentionally_closed
            .store(false, Ordering::Release);
        self.state.merge_hints(hints);
        self.touch();
        if self.writer.is_some() || self.is_reconnecting() || self.dialing {
            return;
        }
        self.shared
            .recon
            .lock()
            .expect("reconnection lock")
            .start_reconnection(&self.peer_id);
        self.schedule_next_attempt();
    }

    fn handle_wake_nudge(&mut self) {
        if self.retry_at.is_none() {
            return;
        }
        let delay = self
            .shared
            .recon
            .lock()
            .expect("reconnection lock")
            .calculate_backoff(&self.peer_id);
        debug!(
            target: LOG_TARGET,
            "wake: next reconnect attempt for {} in {delay:?}", self.peer_id
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn install_inbound(&mut self, channel: RawChannel) {
        if self.state.intentionally_closed || self.shared.cancel.is_cancelled() {
            debug!(
                target: LOG_TARGET,
                "refusing inbound channel from closed peer {}", self.peer_id
            );
            self.close_unused_channel(channel);
            return;
        }
        if self.writer.is_some() {
            // replacement keeps the already-held channel slot
            self.detach_channel();
        } else if !self.shared.try_acquire_channel_slot() {
            warn!(
                target: LOG_TARGET,
                "refusing inbound channel from {}: connection limit reached", self.peer_id
            );
            self.close_unused_channel(channel);
            return;
        }
        self.attach_channel(channel);
        if self.is_reconnecting() {
            self.finish_episode_flush().await;
        } else if !self.state.pending_is_empty() {
            if let Err(err) = self.flush_from(0).await {
                self.connection_lost(err);
            }
        }
    }

    async fn handle_dial_done(&mut self, generation: u64, result: anyhow::Result<RawChannel>) {
        if generation != self.dial_generation {
            if let Ok(channel) = result {
                self.close_unused_channel(channel);
            }
            return;
        }
        self.dialing = false;
        self.status.dialing.store(false, Ordering::Release);
        self.dial_cancel = None;
        match result {
            Ok(channel) => {
                if self.writer.is_some() || self.state.intentionally_closed {
                    // a live channel was installed while the dial was in
                    // flight, or the peer was closed under it
                    debug!(
                        target: LOG_TARGET,
                        "discarding redundant dialed channel to {}", self.peer_id
                    );
                    self.close_unused_channel(channel);
                    // anything queued while the dial was outstanding still
                    // needs to go out on the channel that won
                    if self.writer.is_some() && !self.is_reconnecting() {
                        let from = self.state.first_untransmitted_index();
                        if from < self.state.pending_len() {
                            if let Err(err) = self.flush_from(from).await {
                                self.connection_lost(err);
                            }
                        }
                    }
                    return;
                }
                if !self.shared.try_acquire_channel_slot() {
                    warn!(
                        target: LOG_TARGET,
                        "dialed {} past the connection limit; retrying later", self.peer_id
                    );
                    self.close_unused_channel(channel);
                    self.ensure_episode();
                    self.schedule_next_attempt();
                    return;
                }
                self.attach_channel(channel);
                if self.is_reconnecting() {
                    self.finish_episode_flush().await;
                } else if let Err(err) = self.flush_from(0).await {
                    self.connection_lost(err);
                }
            }
            Err(err) => {
                if self.shared.cancel.is_cancelled() || is_cancelled(&err) {
                    return;
                }
                if self.writer.is_some() {
                    // an inbound channel won the race; the failed dial no
                    // longer matters
                    debug!(
                        target: LOG_TARGET,
                        "ignoring failed dial to {}: a channel is installed", self.peer_id
                    );
                    return;
                }
                if !self.shared.classifier.is_retryable(&err) {
                    warn!(
                        target: LOG_TARGET,
                        "non-retryable dial error for {}: {err:#}", self.peer_id
                    );
                    self.give_up();
                    return;
                }
                debug!(target: LOG_TARGET, "dial to {} failed: {err:#}", self.peer_id);
                self.ensure_episode();
                self.schedule_next_attempt();
            }
        }
    }

    async fn handle_frame(&mut self, message: WireMessage) {
        self.touch();
        if let Some(ack) = message.ack {
            self.state.ack_messages(ack);
            self.sync_pending_len();
        }
        if !message.is_data() {
            return;
        }
        if self.state.raise_received_seq(message.seq) {
            if let Some(payload) = message.payload {
                if let Err(err) = self.shared.handler.handle(&self.peer_id, payload).await {
                    warn!(
                        target: LOG_TARGET,
                        "handler failed for {} seq {}: {err:#}", self.peer_id, message.seq
                    );
                }
            }
        } else {
            debug!(
                target: LOG_TARGET,
                "duplicate frame seq {} from {}", message.seq, self.peer_id
            );
        }
        // Answer data frames with an immediate ack so the remote's sends
        // complete without waiting for our next outbound data frame.
        if self.writer.is_some() {
            match WireMessage::pure_ack(self.state.highest_received_seq()).encode() {
                Ok(frame) => {
                    if let Err(err) = self.write_frame(frame).await {
                        self.connection_lost(err);
                    }
                }
                Err(err) => warn!(target: LOG_TARGET, "failed to encode ack: {err:#}"),
            }
        }
    }

    async fn handle_retry_timer(&mut self) {
        self.retry_at = None;
        if !self.is_reconnecting() || self.dialing {
            return;
        }
        if self.writer.is_some() {
            // an inbound channel landed while we were backing off
            self.finish_episode_flush().await;
            return;
        }
        self.spawn_dial(false);
    }

    /// Transmit every queued message from `from` onward, in order, each with
    /// its positional sequence and the current piggyback ack.
    async fn flush_from(&mut self, from: usize) -> anyhow::Result<()> {
        let ack = self.state.piggyback_ack();
        let mut index = from;
        while index < self.state.pending_len() {
            let seq = self.state.seq_for_index(index);
            let frame = {
                let entry = self
                    .state
                    .pending_mut(index)
                    .ok_or_else(|| anyhow!("pending index out of range"))?;
                WireMessage::data(seq, ack, entry.payload().clone()).encode()?
            };
            self.write_frame(frame).await?;
            if let Some(entry) = self.state.pending_mut(index) {
                entry.note_transmitted(Instant::now());
                if entry.retry_count() > 0 {
                    debug!(
                        target: LOG_TARGET,
                        "retransmitted seq {seq} to {} (retry {})",
                        self.peer_id,
                        entry.retry_count()
                    );
                }
            }
            self.state.note_transmitted(seq);
            index += 1;
        }
        self.touch();
        Ok(())
    }

    /// Flush inside a reconnection episode; success ends the episode,
    /// failure releases the channel and schedules the next attempt with the
    /// queue head left in place.
    async fn finish_episode_flush(&mut self) {
        match self.flush_from(0).await {
            Ok(()) => {
                {
                    let mut recon = self.shared.recon.lock().expect("reconnection lock");
                    recon.stop_reconnection(&self.peer_id);
                    recon.reset_backoff(&self.peer_id);
                }
                self.retry_at = None;
                info!(
                    target: LOG_TARGET,
                    "reconnected to {}; {} message(s) awaiting ack",
                    self.peer_id,
                    self.state.pending_len()
                );
            }
            Err(err) => {
                if is_cancelled(&err) {
                    return;
                }
                debug!(
                    target: LOG_TARGET,
                    "flush to {} failed: {err:#}", self.peer_id
                );
                self.release_channel();
                self.schedule_next_attempt();
            }
        }
    }

    /// First detection of a lost channel. No-op while an episode is already
    /// running; otherwise starts one, unless the fault says not to.
    fn connection_lost(&mut self, err: anyhow::Error) {
        if is_cancelled(&err) || self.shared.cancel.is_cancelled() {
            return;
        }
        self.release_channel();
        if self.state.intentionally_closed {
            return;
        }
        if self.shared.classifier.is_remote_hangup(&err) {
            debug!(
                target: LOG_TARGET,
                "{} disconnected intentionally", self.peer_id
            );
            return;
        }
        if !self.shared.classifier.is_retryable(&err) {
            warn!(
                target: LOG_TARGET,
                "unrecoverable channel error for {}; not reconnecting: {err:#}", self.peer_id
            );
            return;
        }
        if self.is_reconnecting() {
            return;
        }
        warn!(
            target: LOG_TARGET,
            "connection to {} lost, reconnecting: {err:#}", self.peer_id
        );
        self.cancel_dial();
        self.shared
            .recon
            .lock()
            .expect("reconnection lock")
            .start_reconnection(&self.peer_id);
        self.schedule_next_attempt();
    }

    fn ensure_episode(&mut self) {
        let mut recon = self.shared.recon.lock().expect("reconnection lock");
        if !recon.is_reconnecting(&self.peer_id) {
            recon.start_reconnection(&self.peer_id);
        }
    }

    /// Advance the attempt counter; either arm the backoff timer for the
    /// next attempt or give up when the budget is spent.
    fn schedule_next_attempt(&mut self) {
        let (attempt, may_retry, delay) = {
            let mut recon = self.shared.recon.lock().expect("reconnection lock");
            let attempt = recon.increment_attempt(&self.peer_id);
            let may_retry =
                recon.should_retry(&self.peer_id, self.shared.config.max_retry_attempts);
            let delay = recon.calculate_backoff(&self.peer_id);
            (attempt, may_retry, delay)
        };
        if !may_retry {
            self.give_up();
            return;
        }
        debug!(
            target: LOG_TARGET,
            "reconnect attempt {attempt} for {} in {delay:?}", self.peer_id
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    fn give_up(&mut self) {
        warn!(
            target: LOG_TARGET,
            "giving up on {}; rejecting {} pending message(s)",
            self.peer_id,
            self.state.pending_len()
        );
        if let Some(sent_at) = self.state.oldest_pending_sent_at() {
            debug!(
                target: LOG_TARGET,
                "oldest undelivered message to {} was first sent {:?} ago",
                self.peer_id,
                sent_at.elapsed()
            );
        }
        self.cancel_dial();
        self.retry_at = None;
        self.release_channel();
        self.state.reject_all_pending(DeliveryError::GaveUp);
        self.sync_pending_len();
        {
            let mut recon = self.shared.recon.lock().expect("reconnection lock");
            recon.stop_reconnection(&self.peer_id);
            recon.reset_backoff(&self.peer_id);
        }
        if let Some(hook) = &self.shared.on_give_up {
            hook(&self.peer_id);
        }
    }

    fn retire(&mut self) {
        debug!(target: LOG_TARGET, "retiring stale peer {}", self.peer_id);
        self.cancel_dial();
        self.state.reject_all_pending(DeliveryError::GaveUp);
        self.sync_pending_len();
        self.release_channel();
        self.state.clear_sequence_numbers();
        self.drain_commands(DeliveryError::GaveUp);
    }

    fn shutdown(&mut self) {
        debug!(target: LOG_TARGET, "peer task for {} shutting down", self.peer_id);
        self.cancel_dial();
        self.state.reject_all_pending(DeliveryError::Stopped);
        self.sync_pending_len();
        self.release_channel();
        self.drain_commands(DeliveryError::Stopped);
    }

    /// Settle commands that were queued behind the exit: sends are rejected
    /// and inbound channels released rather than silently dropped.
    fn drain_commands(&mut self, reason: DeliveryError) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                PeerCommand::Send(pending) => pending.reject(reason.clone()),
                PeerCommand::InstallInbound(channel) => self.close_unused_channel(channel),
                _ => {}
            }
        }
    }

    /// Write one frame with the configured deadline; deadline expiry is a
    /// connection loss, cancellation is not.
    async fn write_frame(&mut self, frame: Bytes) -> anyhow::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("no channel installed"))?;
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(anyhow::Error::new(ChannelFault::Cancelled)),
            outcome = time::timeout(self.shared.config.write_timeout, writer.write(frame)) => {
                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(anyhow::Error::new(ChannelFault::WriteTimeout)),
                }
            }
        }
    }

    fn attach_channel(&mut self, channel: RawChannel) {
        self.writer = Some(channel.writer);
        self.spawn_reader(channel.reader);
        self.status.has_channel.store(true, Ordering::Release);
        self.touch();
    }

    /// Stop the reader and close the writer, keeping the channel slot.
    fn detach_channel(&mut self) {
        if let Some(cancel) = self.reader_cancel.take() {
            cancel.cancel();
        }
        self.reader_generation += 1;
        if let Some(mut writer) = self.writer.take() {
            self.shared.tracker.spawn(async move {
                let _ = writer.close().await;
            });
        }
    }

    /// Fully release the installed channel and its slot.
    fn release_channel(&mut self) {
        self.detach_channel();
        if self.status.has_channel.swap(false, Ordering::AcqRel) {
            self.shared.release_channel_slot();
        }
    }

    fn close_unused_channel(&self, channel: RawChannel) {
        let factory = Arc::clone(&self.shared.factory);
        let peer_id = self.peer_id.clone();
        self.shared.tracker.spawn(async move {
            if let Err(err) = factory.close_channel(&peer_id, channel).await {
                debug!(
                    target: LOG_TARGET,
                    "failed to close unused channel to {peer_id}: {err:#}"
                );
            }
        });
    }

    fn spawn_reader(&mut self, mut reader: Box<dyn FrameReader>) {
        self.reader_generation += 1;
        let generation = self.reader_generation;
        let cancel = self.shared.cancel.child_token();
        self.reader_cancel = Some(cancel.clone());
        let events = self.event_tx.clone();
        let peer_id = self.peer_id.clone();
        self.shared.tracker.spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = reader.read() => next,
                };
                match next {
                    Ok(Some(frame)) => match WireMessage::decode(&frame) {
                        Ok(message) => {
                            let _ = events.send(PeerEvent::Frame(message));
                        }
                        Err(err) => warn!(
                            target: LOG_TARGET,
                            "dropping malformed frame from {peer_id}: {err:#}"
                        ),
                    },
                    Ok(None) => {
                        let _ = events.send(PeerEvent::ReaderEnded {
                            generation,
                            end: ReadEnd::Eof,
                        });
                        return;
                    }
                    Err(err) => {
                        let _ = events.send(PeerEvent::ReaderEnded {
                            generation,
                            end: ReadEnd::Failed(err),
                        });
                        return;
                    }
                }
            }
        });
    }

    fn spawn_dial(&mut self, retry: bool) {
        self.dial_generation += 1;
        let generation = self.dial_generation;
        self.dialing = true;
        self.status.dialing.store(true, Ordering::Release);
        let cancel = self.shared.cancel.child_token();
        self.dial_cancel = Some(cancel.clone());
        let factory = Arc::clone(&self.shared.factory);
        let hints = self.state.dial_hints(&self.shared.config.relays);
        let events = self.event_tx.clone();
        let peer_id = self.peer_id.clone();
        self.shared.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = factory.dial(&peer_id, &hints, retry) => {
                    let _ = events.send(PeerEvent::DialDone { generation, result });
                }
            }
        });
    }

    fn cancel_dial(&mut self) {
        if let Some(cancel) = self.dial_cancel.take() {
            cancel.cancel();
        }
        self.dialing = false;
        self.status.dialing.store(false, Ordering::Release);
        self.dial_generation += 1;
    }

    fn is_reconnecting(&self) -> bool {
        self.shared
            .recon
            .lock()
            .expect("reconnection lock")
            .is_reconnecting(&self.peer_id)
    }

    fn touch(&mut self) {
        self.state.touch();
        *self.status.last_activity.lock().expect("peer status lock") = self.state.last_activity();
    }

    /// Keep the queue-length snapshot current so the send path can refuse
    /// oversubscription synchronously.
    fn sync_pending_len(&self) {
        self.status
            .pending_len
            .store(self.state.pending_len(), Ordering::Release);
    }
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChannelFault>(),
        Some(ChannelFault::Cancelled)
    )
}
