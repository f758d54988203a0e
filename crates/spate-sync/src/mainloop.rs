//! Single-threaded event multiplexer driving the sync engine.
//!
//! All peer records, the scheduler, and the round state live inside
//! [`SyncState`], owned by one task. Event sources: the node's external
//! event stream, the scheduler timer, the inbound and outbound-completion
//! channels, the periodic offset-roll timer, and the stop signal. The loop
//! suspends only on channel receive or timer wait; nothing in the engine
//! blocks.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use spate_core::constants::KICKOFF_TIME;
use spate_core::types::{NetworkPeer, Round};

use crate::clock::WallClock;
use crate::config::SyncConfig;
use crate::incoming::{IncomingEvent, IncomingMessageHandler};
use crate::interfaces::{Event, NodeConnector};
use crate::outgoing::MessageSentEvent;
use crate::peer::{Peer, PeerState};
use crate::scheduler::PeerScheduler;

/// Adaptive pacing interval derived from the pending pool size.
///
/// `β = 1 / (2 · 3.6923 · exp(0.00026 · N))` seconds, with `N` clamped to
/// `[200, 10_000]`. Monotone non-increasing in pool size: a fuller pool
/// paces messages faster.
pub fn beta(txn_pool_size: usize) -> Duration {
    let size = txn_pool_size.clamp(200, 10_000) as f64;
    let beta = 1.0 / (2.0 * 3.6923 * (size * 0.00026).exp());
    Duration::from_secs_f64(beta)
}

/// The sync engine's entire mutable state. Owned by the main-loop task.
pub(crate) struct SyncState<N: NodeConnector> {
    pub(crate) node: N,
    pub(crate) config: SyncConfig,
    pub(crate) clock: WallClock,

    pub(crate) round: Round,
    pub(crate) fetch_transactions: bool,
    pub(crate) last_beta: Duration,
    pub(crate) requests_offset: u64,

    pub(crate) peers: HashMap<NetworkPeer, Peer>,
    pub(crate) scheduler: PeerScheduler,
    pub(crate) interruptible: HashSet<NetworkPeer>,

    // kept so the channel never closes while handlers may still clone it
    _incoming_tx: mpsc::Sender<IncomingEvent>,
    pub(crate) incoming_rx: mpsc::Receiver<IncomingEvent>,
    pub(crate) outgoing_tx: mpsc::Sender<MessageSentEvent>,
    pub(crate) outgoing_rx: mpsc::Receiver<MessageSentEvent>,

    pub(crate) next_offset_roll: Option<Duration>,
}

impl<N: NodeConnector> SyncState<N> {
    /// Build the state and its transport-facing handler.
    pub(crate) fn new(node: N, config: SyncConfig) -> (Self, IncomingMessageHandler) {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_channel_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_channel_capacity);
        let handler = IncomingMessageHandler::new(incoming_tx.clone());
        let state = Self {
            node,
            config,
            clock: WallClock::new(),
            round: 0,
            fetch_transactions: false,
            last_beta: beta(0),
            requests_offset: 0,
            peers: HashMap::new(),
            scheduler: PeerScheduler::new(),
            interruptible: HashSet::new(),
            _incoming_tx: incoming_tx,
            incoming_rx,
            outgoing_tx,
            outgoing_rx,
            next_offset_roll: None,
        };
        (state, handler)
    }

    /// Run until the stop signal fires or the event stream closes.
    pub(crate) async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut events_rx = self.node.events();
        self.last_beta = beta(0);
        let settings = self.node.current_round_settings();
        self.on_new_round(settings.round, settings.fetch_transactions);
        info!(
            round = settings.round,
            is_relay = self.config.is_relay,
            "txsync: main loop started"
        );

        loop {
            let scheduler_deadline = self.scheduler.next_deadline();
            let scheduler_at = scheduler_deadline.map(|d| self.clock.instant_at(d));
            let offset_roll_at = self.next_offset_roll.map(|d| self.clock.instant_at(d));

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("txsync: stop signal received");
                    return;
                }
                event = events_rx.recv() => match event {
                    Some(Event::NewRound { round, fetch_transactions }) => {
                        self.on_new_round(round, fetch_transactions);
                    }
                    Some(Event::PoolChanged { size }) => self.on_pool_changed(size),
                    None => {
                        info!("txsync: event stream closed");
                        return;
                    }
                },
                Some(event) = self.incoming_rx.recv() => self.evaluate_incoming_message(event),
                Some(event) = self.outgoing_rx.recv() => self.evaluate_outgoing_message(event),
                _ = sleep_until_opt(scheduler_at), if scheduler_at.is_some() => {
                    let now = self.clock.since();
                    self.evaluate_peer_state_changes(now);
                }
                _ = sleep_until_opt(offset_roll_at), if offset_roll_at.is_some() => {
                    self.roll_offsets();
                }
            }
        }
    }

    /// A new round: reset the round-local clock, rebuild the peer set, seed
    /// the scheduler, and repartition the id space across peers.
    pub(crate) fn on_new_round(&mut self, round: Round, fetch_transactions: bool) {
        self.clock.zero();
        let peer_keys = self.refresh_peers();

        // on relays, outgoing peers respond to inbound traffic instead of
        // being driven by the periodic schedule
        let scheduled: Vec<NetworkPeer> = if self.config.is_relay {
            peer_keys
                .iter()
                .filter(|key| {
                    self.peers
                        .get(key)
                        .map(|p| !p.is_outgoing())
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        } else {
            peer_keys.clone()
        };
        {
            let node = &self.node;
            self.scheduler
                .schedule_new_round(&scheduled, |bound| node.random(bound));
        }

        self.update_peers_request_params(&peer_keys);
        self.round = round;
        self.fetch_transactions = fetch_transactions;
        self.next_offset_roll = Some(KICKOFF_TIME + self.last_beta * 2);
        debug!(round, peers = peer_keys.len(), "txsync: new round");
    }

    /// The pool size changed: retune β, and when the pacing tightens
    /// materially, preempt every interruptible peer with an immediate send
    /// and re-snap them onto the new β grid.
    pub(crate) fn on_pool_changed(&mut self, pool_size: usize) {
        let new_beta = beta(pool_size);
        // only a shrink to at most 90% of the current interval takes effect;
        // anything milder would make the schedule oscillate
        if new_beta > self.last_beta * 9 / 10 {
            return;
        }
        self.last_beta = new_beta;
        debug!(pool_size, beta_ms = new_beta.as_millis() as u64, "txsync: pacing retuned");

        let promoted: Vec<NetworkPeer> = self.interruptible.drain().collect();
        if promoted.is_empty() {
            return;
        }
        for key in &promoted {
            if let Some(peer) = self.peers.get_mut(key) {
                peer.state = PeerState::Holdsoff;
            }
        }

        let now = self.clock.since();
        let monitor = self
            .clock
            .deadline_monitor_at(now + self.config.send_messages_window);
        self.send_message_loop(now, monitor, &promoted);

        // align the next fire of every promoted peer to a whole multiple of
        // the new β from now
        let now = self.clock.since();
        for key in &promoted {
            let deadline = match self.scheduler.peer_deadline(key) {
                Some(next) if next >= now => {
                    let steps =
                        (next - now).as_nanos() / self.last_beta.as_nanos().max(1);
                    now + Duration::from_nanos(
                        (steps as u64).saturating_mul(self.last_beta.as_nanos() as u64),
                    )
                }
                _ => now + self.last_beta,
            };
            self.scheduler.schedule(key.clone(), deadline);
        }
    }

    /// Scheduler tick: advance every due peer's state machine and run one
    /// bounded send pass over those that should transmit.
    pub(crate) fn evaluate_peer_state_changes(&mut self, now: Duration) {
        let due = self.scheduler.pop_due(now);
        if due.is_empty() {
            return;
        }

        let mut send_peers = Vec::new();
        for key in due {
            let Some(peer) = self.peers.get_mut(&key) else { continue };
            let ops = peer.advance_state(now, self.config.is_relay, self.config.message_time_window);
            if ops.send_message {
                send_peers.push(key.clone());
            }
            if ops.set_interruptible {
                self.interruptible.insert(key.clone());
            }
            if ops.clear_interruptible {
                self.interruptible.remove(&key);
            }
            if ops.reschedule {
                self.scheduler.schedule(key.clone(), now + self.last_beta);
            }
        }

        if send_peers.is_empty() {
            return;
        }
        let monitor = self
            .clock
            .deadline_monitor_at(now + self.config.send_messages_window);
        self.send_message_loop(now, monitor, &send_peers);
    }

    /// Advance the rolling request offset and re-arm its timer.
    pub(crate) fn roll_offsets(&mut self) {
        self.requests_offset += 1;
        self.next_offset_roll = Some(self.clock.since() + self.last_beta * 2);
    }

    /// Reconcile the peer map with the transport's current peer list:
    /// create records for new connections, bind their intake handles, and
    /// drop records whose connection is gone.
    pub(crate) fn refresh_peers(&mut self) -> Vec<NetworkPeer> {
        let infos = self.node.get_peers();
        let mut live: HashSet<NetworkPeer> = HashSet::with_capacity(infos.len());
        let mut new_handles = Vec::new();
        let mut new_network_peers = Vec::new();
        let mut keys = Vec::with_capacity(infos.len());

        for info in infos {
            live.insert(info.network_peer.clone());
            if !self.peers.contains_key(&info.network_peer) {
                let peer = Peer::new(
                    info.network_peer.clone(),
                    info.is_outgoing,
                    self.config.ordering_heap_capacity,
                );
                new_handles.push(peer.handle());
                new_network_peers.push(info.network_peer.clone());
                self.peers.insert(info.network_peer.clone(), peer);
            }
            keys.push(info.network_peer);
        }

        let stale: Vec<NetworkPeer> = self
            .peers
            .keys()
            .filter(|key| !live.contains(key))
            .cloned()
            .collect();
        for key in stale {
            debug!(peer = ?key, "txsync: dropping disconnected peer record");
            self.peers.remove(&key);
            self.scheduler.remove(&key);
            self.interruptible.remove(&key);
        }

        if !new_handles.is_empty() {
            self.node.update_peers(&new_handles, &new_network_peers);
        }
        keys
    }

    /// Partition the id space across peers: a relay asks everyone for
    /// everything; a non-relay assigns peer `i` of `n` the residue class
    /// `i mod n`.
    fn update_peers_request_params(&mut self, keys: &[NetworkPeer]) {
        let count = keys.len() as u64;
        for (index, key) in keys.iter().enumerate() {
            if let Some(peer) = self.peers.get_mut(key) {
                if self.config.is_relay {
                    peer.set_local_request_params(0, 1);
                } else {
                    peer.set_local_request_params(index as u64, count);
                }
            }
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use spate_core::types::{SignedTransaction, SignedTxGroup};

    use crate::interfaces::{PeerInfo, RoundSettings, SendMessageCallback, SyncPeerHandle};
    use crate::ordering::MessageHeapItem;
    use crate::protocol::{
        PackedTransactionGroups, TransactionBlockMessage, TXN_BLOCK_MESSAGE_VERSION,
    };

    /// Node connector stub: a fixed peer list, a recording transport, and a
    /// deterministic RNG.
    struct TestNode {
        peers: Arc<Mutex<Vec<PeerInfo>>>,
        events_rx: Option<mpsc::Receiver<Event>>,
        pending: Arc<Mutex<Vec<SignedTxGroup>>>,
        delivered: Arc<Mutex<Vec<SignedTxGroup>>>,
        sent: Arc<Mutex<Vec<(NetworkPeer, Vec<u8>)>>>,
        rng_state: AtomicU64,
        next_seq: AtomicU64,
    }

    impl TestNode {
        fn new(directions: &[bool]) -> (Self, Vec<NetworkPeer>) {
            let network_peers: Vec<NetworkPeer> =
                directions.iter().map(|_| NetworkPeer::new(())).collect();
            let infos = network_peers
                .iter()
                .zip(directions)
                .map(|(np, &is_outgoing)| PeerInfo {
                    sync_peer: None,
                    network_peer: np.clone(),
                    is_outgoing,
                })
                .collect();
            let (_tx, rx) = mpsc::channel(16);
            let node = Self {
                peers: Arc::new(Mutex::new(infos)),
                events_rx: Some(rx),
                pending: Arc::new(Mutex::new(Vec::new())),
                delivered: Arc::new(Mutex::new(Vec::new())),
                sent: Arc::new(Mutex::new(Vec::new())),
                rng_state: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
            };
            (node, network_peers)
        }
    }

    impl NodeConnector for TestNode {
        fn events(&mut self) -> mpsc::Receiver<Event> {
            self.events_rx.take().expect("events taken once")
        }

        fn current_round_settings(&self) -> RoundSettings {
            RoundSettings { round: 0, fetch_transactions: true }
        }

        fn random(&self, bound: u64) -> u64 {
            // xorshift; plenty for jitter in tests
            let mut x = self.rng_state.load(Ordering::Relaxed).max(1);
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.rng_state.store(x, Ordering::Relaxed);
            if bound == 0 { 0 } else { x % bound }
        }

        fn get_peers(&self) -> Vec<PeerInfo> {
            self.peers.lock().unwrap().clone()
        }

        fn get_peer(&self, network_peer: &NetworkPeer) -> Option<PeerInfo> {
            self.peers
                .lock()
                .unwrap()
                .iter()
                .find(|info| info.network_peer == *network_peer)
                .cloned()
        }

        fn update_peers(&self, sync_peers: &[SyncPeerHandle], network_peers: &[NetworkPeer]) {
            let mut infos = self.peers.lock().unwrap();
            for (handle, np) in sync_peers.iter().zip(network_peers) {
                if let Some(info) = infos.iter_mut().find(|i| i.network_peer == *np) {
                    info.sync_peer = Some(handle.clone());
                }
            }
        }

        fn send_peer_message(
            &self,
            peer: &NetworkPeer,
            message: Vec<u8>,
            callback: SendMessageCallback,
        ) {
            self.sent.lock().unwrap().push((peer.clone(), message));
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            callback(true, seq);
        }

        fn get_pending_transaction_groups(&self) -> (Vec<SignedTxGroup>, u64) {
            let pending = self.pending.lock().unwrap().clone();
            let latest_local = pending
                .iter()
                .filter(|g| g.locally_originated)
                .map(|g| g.group_counter)
                .max()
                .unwrap_or(0);
            (pending, latest_local)
        }

        fn incoming_transaction_groups(&self, _peer: &NetworkPeer, groups: Vec<SignedTxGroup>) {
            self.delivered.lock().unwrap().extend(groups);
        }
    }

    fn group(counter: u64, note: Vec<u8>) -> SignedTxGroup {
        SignedTxGroup {
            transactions: vec![SignedTransaction {
                version: 1,
                sender: [9; 32],
                first_valid: 0,
                last_valid: 100,
                note,
                signature: vec![0u8; 64],
            }],
            group_counter: counter,
            locally_originated: true,
        }
    }

    fn incoming_event(
        peer: &NetworkPeer,
        seq: u64,
        message: TransactionBlockMessage,
    ) -> IncomingEvent {
        let encoded_size = message.encode().unwrap().len();
        IncomingEvent {
            network_peer: peer.clone(),
            item: Some(MessageHeapItem { seq, message, encoded_size }),
        }
    }

    // ------------------------------------------------------------------
    // beta
    // ------------------------------------------------------------------

    #[test]
    fn beta_matches_reference_values() {
        // β(200) = 1 / (2 · 3.6923 · e^0.052) ≈ 128.6ms
        let b200 = beta(200);
        assert!((b200.as_secs_f64() - 0.1286).abs() < 0.001, "β(200) = {b200:?}");
        // β below the clamp equals β at the clamp
        assert_eq!(beta(0), beta(200));
        assert_eq!(beta(20_000), beta(10_000));
    }

    #[test]
    fn beta_is_monotone_nonincreasing() {
        let mut previous = beta(0);
        for size in (200..=10_000).step_by(100) {
            let current = beta(size);
            assert!(current <= previous, "β must not grow with pool size");
            previous = current;
        }
    }

    // ------------------------------------------------------------------
    // New round
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn new_round_partitions_id_space_for_non_relay() {
        let (node, keys) = TestNode::new(&[true, false, false]);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        for (i, key) in keys.iter().enumerate() {
            let (offset, modulator) = state.peers[key].local_request_params();
            assert_eq!(modulator, 3);
            assert_eq!(u64::from(offset), i as u64 % 3);
        }
        assert_eq!(state.round, 1);
        assert!(state.fetch_transactions);
        assert!(state.next_offset_roll.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn new_round_relay_asks_everyone_for_everything() {
        let (node, keys) = TestNode::new(&[true, false]);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::relay());
        state.on_new_round(1, true);

        for key in &keys {
            assert_eq!(state.peers[key].local_request_params(), (0, 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn relay_schedules_only_incoming_peers() {
        let (node, keys) = TestNode::new(&[true, false, false]);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::relay());
        state.on_new_round(1, true);

        assert_eq!(state.scheduler.len(), 2);
        assert!(state.scheduler.peer_deadline(&keys[0]).is_none(), "outgoing peer unscheduled");
        assert!(state.scheduler.peer_deadline(&keys[1]).is_some());
        assert!(state.scheduler.peer_deadline(&keys[2]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn non_relay_schedules_every_peer_with_jitter() {
        let (node, keys) = TestNode::new(&[true, true, false]);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        for key in &keys {
            let deadline = state.scheduler.peer_deadline(key).expect("scheduled");
            assert!(deadline >= Duration::from_millis(200));
            assert!(deadline < Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_prunes_disconnected_peers() {
        let (node, keys) = TestNode::new(&[false, false]);
        let peers_handle = Arc::clone(&node.peers);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);
        assert_eq!(state.peers.len(), 2);

        // drop the first connection from the transport's list
        peers_handle.lock().unwrap().remove(0);
        state.on_new_round(2, true);
        assert_eq!(state.peers.len(), 1);
        assert!(!state.peers.contains_key(&keys[0]));
        assert!(state.scheduler.peer_deadline(&keys[0]).is_none());
    }

    // ------------------------------------------------------------------
    // Pool change / β retuning
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn small_beta_change_is_a_noop() {
        let (node, keys) = TestNode::new(&[false]);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        let before = state.last_beta;
        state.interruptible.insert(keys[0].clone());
        state.peers.get_mut(&keys[0]).unwrap().state = PeerState::Interrupt;

        // β(300)/β(200) ≈ 0.97: inside the 10% band, nothing moves
        state.on_pool_changed(300);
        assert_eq!(state.last_beta, before);
        assert_eq!(state.peers[&keys[0]].state, PeerState::Interrupt);
        assert!(state.interruptible.contains(&keys[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn pool_growth_promotes_interruptible_peers_onto_new_grid() {
        let (node, keys) = TestNode::new(&[false, false]);
        let sent = Arc::clone(&node.sent);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        for key in &keys {
            let peer = state.peers.get_mut(key).unwrap();
            peer.state = PeerState::Interrupt;
            peer.update_request_params(1, 0);
            state.interruptible.insert(key.clone());
        }

        state.on_pool_changed(5_000);

        let new_beta = beta(5_000);
        assert_eq!(state.last_beta, new_beta);
        assert!(new_beta <= beta(200) * 9 / 10, "β(5000) shrinks past the gate");
        assert!(state.interruptible.is_empty());
        assert_eq!(sent.lock().unwrap().len(), 2, "one immediate send per promoted peer");

        for key in &keys {
            assert_eq!(state.peers[key].state, PeerState::Holdsoff);
            let deadline = state.scheduler.peer_deadline(key).expect("rescheduled");
            // paused clock: now == 0, so the deadline is an exact multiple
            let nanos = deadline.as_nanos();
            assert_eq!(
                nanos % new_beta.as_nanos(),
                0,
                "deadline {deadline:?} must sit on the β grid"
            );
            assert!(nanos > 0);
        }
    }

    // ------------------------------------------------------------------
    // Scheduler ticks
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn startup_fire_sends_and_holds_off() {
        let (node, keys) = TestNode::new(&[false]);
        let sent = Arc::clone(&node.sent);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        let fire_at = state.scheduler.peer_deadline(&keys[0]).unwrap();
        state.evaluate_peer_state_changes(fire_at);

        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(state.peers[&keys[0]].state, PeerState::Holdsoff);
        // rescheduled one β after the fire
        assert_eq!(
            state.scheduler.peer_deadline(&keys[0]),
            Some(fire_at + state.last_beta)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn holdsoff_fire_marks_interruptible_without_sending() {
        let (node, keys) = TestNode::new(&[false]);
        let sent = Arc::clone(&node.sent);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        let t0 = state.scheduler.peer_deadline(&keys[0]).unwrap();
        state.evaluate_peer_state_changes(t0); // Startup -> Holdsoff, sends
        let t1 = state.scheduler.peer_deadline(&keys[0]).unwrap();
        state.evaluate_peer_state_changes(t1); // Holdsoff -> Interrupt

        assert_eq!(sent.lock().unwrap().len(), 1, "interrupt transition sends nothing");
        assert_eq!(state.peers[&keys[0]].state, PeerState::Interrupt);
        assert!(state.interruptible.contains(&keys[0]));
        assert_eq!(
            state.scheduler.peer_deadline(&keys[0]),
            Some(t1 + state.last_beta)
        );
    }

    // ------------------------------------------------------------------
    // Offset rolling
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn offset_roll_increments_and_rearms() {
        let (node, _keys) = TestNode::new(&[]);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        assert_eq!(state.requests_offset, 0);
        state.roll_offsets();
        state.roll_offsets();
        assert_eq!(state.requests_offset, 2);
        assert_eq!(
            state.next_offset_roll,
            Some(state.clock.since() + state.last_beta * 2)
        );
    }

    // ------------------------------------------------------------------
    // Incoming evaluation
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn incoming_creates_peer_and_delivers_groups() {
        let (node, keys) = TestNode::new(&[false]);
        let delivered = Arc::clone(&node.delivered);
        let peers_handle = Arc::clone(&node.peers);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.round = 1;

        let g = group(0, b"payload".to_vec());
        let msg = TransactionBlockMessage {
            version: TXN_BLOCK_MESSAGE_VERSION,
            round: 1,
            transaction_groups: PackedTransactionGroups {
                groups: vec![g.transactions.clone()],
            },
            ..Default::default()
        };
        state.evaluate_incoming_message(incoming_event(&keys[0], 0, msg));

        assert_eq!(delivered.lock().unwrap().len(), 1);
        let peer = &state.peers[&keys[0]];
        assert_eq!(peer.next_received_seq, 1);
        assert!(peer.recently_sent(&g.id().unwrap()), "delivered ids must not echo back");
        // the record was bound to the transport
        assert!(peers_handle.lock().unwrap()[0].sync_peer.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_messages_wait_for_the_gap() {
        let (node, keys) = TestNode::new(&[false]);
        let delivered = Arc::clone(&node.delivered);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.round = 1;

        let make_msg = |note: &[u8]| TransactionBlockMessage {
            version: TXN_BLOCK_MESSAGE_VERSION,
            round: 1,
            transaction_groups: PackedTransactionGroups {
                groups: vec![group(0, note.to_vec()).transactions],
            },
            ..Default::default()
        };

        // seq 1 arrives first and must wait
        state.evaluate_incoming_message(incoming_event(&keys[0], 1, make_msg(b"second")));
        assert_eq!(delivered.lock().unwrap().len(), 0);
        assert_eq!(state.peers[&keys[0]].next_received_seq, 0);

        // seq 0 unblocks both
        state.evaluate_incoming_message(incoming_event(&keys[0], 0, make_msg(b"first")));
        assert_eq!(delivered.lock().unwrap().len(), 2);
        assert_eq!(state.peers[&keys[0]].next_received_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn below_sequence_messages_are_dropped() {
        let (node, keys) = TestNode::new(&[false]);
        let delivered = Arc::clone(&node.delivered);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.round = 1;

        let msg = |note: &[u8]| TransactionBlockMessage {
            version: TXN_BLOCK_MESSAGE_VERSION,
            round: 1,
            transaction_groups: PackedTransactionGroups {
                groups: vec![group(0, note.to_vec()).transactions],
            },
            ..Default::default()
        };

        state.evaluate_incoming_message(incoming_event(&keys[0], 0, msg(b"a")));
        assert_eq!(delivered.lock().unwrap().len(), 1);

        // a replay of seq 0 is silently discarded
        state.evaluate_incoming_message(incoming_event(&keys[0], 0, msg(b"replay")));
        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(state.peers[&keys[0]].next_received_seq, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_round_keeps_metadata_but_skips_payload() {
        let (node, keys) = TestNode::new(&[false]);
        let delivered = Arc::clone(&node.delivered);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.round = 5;

        let msg = TransactionBlockMessage {
            version: TXN_BLOCK_MESSAGE_VERSION,
            round: 3,
            updated_request_params: crate::protocol::RequestParams { offset: 2, modulator: 4 },
            transaction_groups: PackedTransactionGroups {
                groups: vec![group(0, b"late".to_vec()).transactions],
            },
            ..Default::default()
        };
        state.evaluate_incoming_message(incoming_event(&keys[0], 0, msg));

        assert_eq!(delivered.lock().unwrap().len(), 0, "payload from a stale round is skipped");
        let peer = &state.peers[&keys[0]];
        assert_eq!(peer.last_round, 3);
        assert_eq!(peer.requested_modulator, 4, "metadata still applies");
        assert_eq!(peer.requested_offset, 2);
        assert_eq!(peer.next_received_seq, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_outgoing_peer_replies_to_first_inbound() {
        let (node, keys) = TestNode::new(&[true]);
        let sent = Arc::clone(&node.sent);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::relay());
        state.on_new_round(1, true);
        assert!(state.scheduler.is_empty(), "outgoing peers are not timer-driven");

        let msg = TransactionBlockMessage {
            version: TXN_BLOCK_MESSAGE_VERSION,
            round: 1,
            updated_request_params: crate::protocol::RequestParams { offset: 0, modulator: 1 },
            msg_sync: crate::protocol::TimingParams {
                ref_seq: 0,
                responder_elapsed_ns: 0,
                next_min_delay_ns: Duration::from_millis(250).as_nanos() as u64,
            },
            ..Default::default()
        };
        state.evaluate_incoming_message(incoming_event(&keys[0], 0, msg));

        assert_eq!(sent.lock().unwrap().len(), 1, "the relay replies immediately");
        // a 250ms window at a 20ms message gap leaves room for several
        // messages, so the peer holds off rather than closing with the bloom
        assert_eq!(state.peers[&keys[0]].state, PeerState::Holdsoff);
        assert!(state.scheduler.peer_deadline(&keys[0]).is_some(), "follow-up scheduled");
    }

    // ------------------------------------------------------------------
    // Send-loop deadline
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_skips_remaining_peers() {
        let (node, keys) = TestNode::new(&[false, false, false]);
        let sent = Arc::clone(&node.sent);
        let (mut state, _handler) = SyncState::new(node, SyncConfig::node());
        state.on_new_round(1, true);

        for key in &keys {
            state.peers.get_mut(key).unwrap().update_request_params(1, 0);
        }

        // a monitor that is already expired: only the first peer sends
        let now = state.clock.since();
        let monitor = state.clock.deadline_monitor_at(now);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let now = state.clock.since();
        state.send_message_loop(now, monitor, &keys);

        assert_eq!(sent.lock().unwrap().len(), 1);
        for key in &keys[1..] {
            assert_eq!(
                state.peers[key].last_sent_size, 0,
                "skipped peers keep last_sent untouched"
            );
            assert!(state.scheduler.peer_deadline(key).is_some(), "skipped peers are requeued");
        }
    }
}
