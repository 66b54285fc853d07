//!
//! PeerNetwork
//!
//! The coordinator: public send/close/reconnect surface, the peer table,
//! inbound-channel routing, stale-peer cleanup, and global shutdown.
//!
//! Each peer is served by exactly one runner task (see `peer::runner`); the
//! coordinator holds only a command sender and a small status snapshot per
//! peer, so sends to distinct peers never contend beyond a brief table
//! lookup.
//!
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::bail;
use log::debug;
use log::info;
use log::warn;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::net::channel::ChannelFactory;
use crate::net::channel::InboundChannel;
use crate::net::channel::MessageHandler;
use crate::net::config::NetworkConfig;
use crate::net::fault::FaultClassifier;
use crate::net::fault::IoFaultClassifier;
use crate::net::wake::WakeDetector;
use crate::peer::queue::Delivery;
use crate::peer::queue::DeliveryError;
use crate::peer::queue::PendingMessage;
use crate::peer::reconnect::ReconnectionManager;
use crate::peer::runner::PeerCommand;
use crate::peer::runner::PeerRunner;
use crate::peer::PeerId;
use crate::wire::message::MessagePayload;

const LOG_TARGET: &str = "peerway::network";

pub type GiveUpHook = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Optional collaborators handed to the network at construction.
#[derive(Default, Clone)]
pub struct NetworkHooks {
    /// Fault classification; defaults to `IoFaultClassifier`.
    pub classifier: Option<Arc<dyn FaultClassifier>>,
    /// Invoked exactly once per give-up episode.
    pub on_give_up: Option<GiveUpHook>,
    /// Host wake-from-sleep source.
    pub wake_detector: Option<Arc<dyn WakeDetector>>,
}

/// Handle to a running peer network. Clones share the same network.
#[derive(Clone)]
pub struct PeerNetwork {
    shared: Arc<NetworkShared>,
}

#[derive(Clone)]
struct PeerEntry {
    cmd_tx: mpsc::UnboundedSender<PeerCommand>,
    status: Arc<PeerStatus>,
}

/// Snapshot a runner keeps current for the coordinator: the stale sweep
/// reads `last_activity` and `has_channel`, and the `send` path reads the
/// rest to fail oversubscribed or closed sends synchronously, before a
/// completion is ever created. The runner remains the authority; the
/// snapshot trails it by at most the commands already in flight.
pub(crate) struct PeerStatus {
    pub last_activity: Mutex<Instant>,
    pub has_channel: AtomicBool,
    pub intentionally_closed: AtomicBool,
    pub dialing: AtomicBool,
    pub pending_len: AtomicUsize,
}

impl PeerStatus {
    fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            has_channel: AtomicBool::new(false),
            intentionally_closed: AtomicBool::new(false),
            dialing: AtomicBool::new(false),
            pending_len: AtomicUsize::new(0),
        }
    }
}

pub(crate) struct NetworkShared {
    pub config: NetworkConfig,
    pub factory: Arc<dyn ChannelFactory>,
    pub handler: Arc<dyn MessageHandler>,
    pub classifier: Arc<dyn FaultClassifier>,
    pub on_give_up: Option<GiveUpHook>,
    pub recon: Mutex<ReconnectionManager>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    installed: AtomicUsize,
    stopped: AtomicBool,
    // kept alive so the wake hook stays installed for the network's lifetime
    _wake_detector: Option<Arc<dyn WakeDetector>>,
}

impl PeerNetwork {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        handler: Arc<dyn MessageHandler>,
        config: NetworkConfig,
    ) -> Self {
        Self::with_hooks(factory, handler, config, NetworkHooks::default())
    }

    pub fn with_hooks(
        factory: Arc<dyn ChannelFactory>,
        handler: Arc<dyn MessageHandler>,
        config: NetworkConfig,
        hooks: NetworkHooks,
    ) -> Self {
        let shared = Arc::new(NetworkShared {
            config,
            factory,
            handler,
            classifier: hooks
                .classifier
                .unwrap_or_else(|| Arc::new(IoFaultClassifier)),
            on_give_up: hooks.on_give_up,
            recon: Mutex::new(ReconnectionManager::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            peers: Mutex::new(HashMap::new()),
            installed: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            _wake_detector: hooks.wake_detector,
        });

        if let Some(detector) = &shared._wake_detector {
            let weak = Arc::downgrade(&shared);
            detector.watch(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_wake();
                }
            }));
        }

        if let Some(mut inbound) = shared.factory.take_inbound() {
            let routing = Arc::clone(&shared);
            shared.tracker.spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = routing.cancel.cancelled() => break,
                        next = inbound.recv() => next,
                    };
                    match next {
                        Some(channel) => routing.route_inbound(channel),
                        None => break,
                    }
                }
            });
        }

        let sweeper = Arc::clone(&shared);
        shared.tracker.spawn(async move {
            let period = sweeper.config.cleanup_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweeper.cancel.cancelled() => break,
                    _ = ticker.tick() => sweeper.sweep_stale_peers(),
                }
            }
        });

        PeerNetwork { shared }
    }

    /// Queue `payload` for reliable delivery to `peer_id`. The returned
    /// `Delivery` resolves once the remote acknowledges the message and
    /// rejects when the peer gives up or is closed or stopped.
    ///
    /// Fails synchronously, with no completion created, for: a stopped
    /// network, a payload over the size cap, an intentionally closed peer,
    /// a full pending queue, and a send that would need a fresh dial while
    /// the connection limit is reached.
    pub fn send(&self, peer_id: &PeerId, payload: MessagePayload) -> anyhow::Result<Delivery> {
        if self.shared.cancel.is_cancelled() {
            bail!(DeliveryError::Stopped);
        }
        let size = payload.encoded_len()?;
        let cap = self.shared.config.max_message_size_bytes;
        if size > cap {
            bail!(DeliveryError::ResourceLimit(format!(
                "message of {size} bytes exceeds the {cap} byte cap"
            )));
        }
        let status = self.shared.peer_status(peer_id);
        if let Some(status) = &status {
            if status.intentionally_closed.load(Ordering::Acquire) {
                bail!(DeliveryError::IntentionallyClosed);
            }
            if status.pending_len.load(Ordering::Acquire) >= self.shared.config.max_queue {
                bail!(DeliveryError::ResourceLimit("send queue full".into()));
            }
        }
        // A peer with no channel and no connection attempt under way needs a
        // fresh dial, which the connection limit may forbid.
        let needs_dial = status.as_ref().map_or(true, |status| {
            !status.has_channel.load(Ordering::Acquire)
                && !status.dialing.load(Ordering::Acquire)
        }) && !self.is_reconnecting(peer_id);
        if needs_dial
            && self.shared.installed_channels() >= self.shared.config.max_concurrent_connections
        {
            bail!(DeliveryError::ResourceLimit("connection limit reached".into()));
        }
        let (pending, delivery) = PendingMessage::new(payload);
        let mut pending = Some(pending);
        for _ in 0..2 {
            let Some(message) = pending.take() else {
                break;
            };
            let Some(entry) = self.shared.peer_entry(peer_id, true) else {
                pending = Some(message);
                break;
            };
            match entry.cmd_tx.send(PeerCommand::Send(message)) {
                Ok(()) => return Ok(delivery),
                // The runner retired between lookup and send; a retry hits a
                // freshly spawned one.
                Err(returned) => {
                    if let PeerCommand::Send(message) = returned.0 {
                        pending = Some(message);
                    }
                }
            }
        }
        if let Some(pending) = pending {
            pending.reject(DeliveryError::Stopped);
        }
        Ok(delivery)
    }

    /// Close the connection to a peer and refuse traffic with it until
    /// `reconnect_peer`. Idempotent.
    pub fn close_connection(&self, peer_id: &PeerId) {
        if let Some(entry) = self.shared.peer_entry(peer_id, false) {
            let _ = entry.cmd_tx.send(PeerCommand::Close);
        }
    }

    /// Clear an intentional close and start reconnecting if no channel is
    /// installed. `hints` are union-merged into the peer's set.
    pub fn reconnect_peer(&self, peer_id: &PeerId, hints: Vec<String>) {
        if let Some(entry) = self.shared.peer_entry(peer_id, true) {
            let _ = entry.cmd_tx.send(PeerCommand::Reconnect { hints });
        }
    }

    pub fn register_location_hints(&self, peer_id: &PeerId, hints: Vec<String>) {
        if let Some(entry) = self.shared.peer_entry(peer_id, true) {
            let _ = entry.cmd_tx.send(PeerCommand::RegisterHints(hints));
        }
    }

    /// Resolve every pending send whose sequence is covered by `ack_seq`.
    /// Entry point for externally demultiplexed acks; inbound frames apply
    /// their piggyback acks through the same path.
    pub fn handle_ack(&self, peer_id: &PeerId, ack_seq: u64) {
        if let Some(entry) = self.shared.peer_entry(peer_id, false) {
            let _ = entry.cmd_tx.send(PeerCommand::HandleAck(ack_seq));
        }
    }

    /// Raise the highest-received watermark used as the piggyback ack on
    /// outbound frames.
    pub fn update_received_seq(&self, peer_id: &PeerId, seq: u64) {
        if let Some(entry) = self.shared.peer_entry(peer_id, true) {
            let _ = entry.cmd_tx.send(PeerCommand::UpdateReceivedSeq(seq));
        }
    }

    /// Stop the network: cancel every dial, delay, and reader, reject all
    /// pending sends with `Stopped`, and await clean exit of all per-peer
    /// tasks. Idempotent.
    pub async fn stop(&self) {
        let first = !self.shared.stopped.swap(true, Ordering::SeqCst);
        if first {
            info!(target: LOG_TARGET, "stopping peer network");
            self.shared.cancel.cancel();
            self.shared.tracker.close();
        }
        self.shared.tracker.wait().await;
        if first {
            if let Err(err) = self.shared.factory.stop().await {
                warn!(target: LOG_TARGET, "channel factory shutdown failed: {err:#}");
            }
            self.shared.peers.lock().expect("peer table lock").clear();
            self.shared.recon.lock().expect("reconnection lock").clear();
        }
    }

    /// Number of peers currently tracked.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().expect("peer table lock").len()
    }

    /// Number of unacknowledged messages queued for `peer_id`.
    pub fn pending_messages(&self, peer_id: &PeerId) -> usize {
        self.shared
            .peer_status(peer_id)
            .map_or(0, |status| status.pending_len.load(Ordering::Acquire))
    }

    /// Number of channels currently installed across all peers.
    pub fn installed_channels(&self) -> usize {
        self.shared.installed.load(Ordering::Acquire)
    }

    /// Whether a reconnection episode is running for `peer_id`.
    pub fn is_reconnecting(&self, peer_id: &PeerId) -> bool {
        self.shared
            .recon
            .lock()
            .expect("reconnection lock")
            .is_reconnecting(peer_id)
    }
}

impl NetworkShared {
    /// Status snapshot of a peer, without creating one.
    fn peer_status(&self, peer_id: &PeerId) -> Option<Arc<PeerStatus>> {
        self.peers
            .lock()
            .expect("peer table lock")
            .get(peer_id)
            .map(|entry| Arc::clone(&entry.status))
    }

    /// Look up a peer entry, lazily spawning its runner task. Entries whose
    /// runner has exited are dropped and (when `create`) replaced.
    fn peer_entry(self: &Arc<Self>, peer_id: &PeerId, create: bool) -> Option<PeerEntry> {
        let mut peers = self.peers.lock().expect("peer table lock");
        if let Some(entry) = peers.get(peer_id) {
            if !entry.cmd_tx.is_closed() {
                return Some(entry.clone());
            }
            peers.remove(peer_id);
        }
        if !create || self.cancel.is_cancelled() {
            return None;
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let entry = PeerEntry {
            cmd_tx,
            status: Arc::new(PeerStatus::new()),
        };
        peers.insert(peer_id.clone(), entry.clone());
        let runner = PeerRunner::new(
            peer_id.clone(),
            Arc::clone(self),
            Arc::clone(&entry.status),
            cmd_rx,
        );
        self.tracker.spawn(runner.run());
        Some(entry)
    }

    fn route_inbound(self: &Arc<Self>, inbound: InboundChannel) {
        let InboundChannel { peer_id, channel } = inbound;
        debug!(target: LOG_TARGET, "inbound channel from {peer_id}");
        match self.peer_entry(&peer_id, true) {
            Some(entry) => {
                if let Err(returned) = entry.cmd_tx.send(PeerCommand::InstallInbound(channel)) {
                    if let PeerCommand::InstallInbound(channel) = returned.0 {
                        self.discard_channel(peer_id, channel);
                    }
                }
            }
            None => self.discard_channel(peer_id, channel),
        }
    }

    fn discard_channel(self: &Arc<Self>, peer_id: PeerId, channel: crate::net::channel::RawChannel) {
        let factory = Arc::clone(&self.factory);
        self.tracker.spawn(async move {
            if let Err(err) = factory.close_channel(&peer_id, channel).await {
                debug!(target: LOG_TARGET, "failed to close refused channel from {peer_id}: {err:#}");
            }
        });
    }

    fn handle_wake(&self) {
        debug!(target: LOG_TARGET, "host resumed from sleep; resetting backoffs");
        self.recon
            .lock()
            .expect("reconnection lock")
            .reset_all_backoffs();
        let peers = self.peers.lock().expect("peer table lock");
        for entry in peers.values() {
            let _ = entry.cmd_tx.send(PeerCommand::WakeNudge);
        }
    }

    /// Drop peers that have been idle past the stale timeout and hold no
    /// channel and no reconnection episode.
    fn sweep_stale_peers(&self) {
        let timeout = self.config.stale_peer_timeout;
        let now = Instant::now();
        let mut peers = self.peers.lock().expect("peer table lock");
        let mut recon = self.recon.lock().expect("reconnection lock");
        peers.retain(|peer_id, entry| {
            if entry.cmd_tx.is_closed() {
                recon.clear_peer(peer_id);
                return false;
            }
            if entry.status.has_channel.load(Ordering::Acquire) {
                return true;
            }
            if recon.is_reconnecting(peer_id) {
                return true;
            }
            let last = *entry.status.last_activity.lock().expect("peer status lock");
            if now.duration_since(last) <= timeout {
                return true;
            }
            debug!(target: LOG_TARGET, "retiring stale peer {peer_id}");
            recon.clear_peer(peer_id);
            let _ = entry.cmd_tx.send(PeerCommand::Retire);
            false
        });
    }

    /// Reserve one of the bounded channel slots; the count of installed
    /// channels never exceeds the configured maximum.
    pub fn try_acquire_channel_slot(&self) -> bool {
        let max = self.config.max_concurrent_connections;
        let mut current = self.installed.load(Ordering::Relaxed);
        loop {
            if current >= max {
                return false;
            }
            match self.installed.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_channel_slot(&self) {
        self.installed.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn installed_channels(&self) -> usize {
        self.installed.load(Ordering::Acquire)
    }
}
