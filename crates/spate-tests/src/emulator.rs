//! In-process network emulator.
//!
//! Builds a set of sync services wired together through per-direction FIFO
//! links with bandwidth-derived delivery delay. Everything runs on tokio's
//! paused test clock, so an 8.5-second scenario executes in milliseconds
//! while keeping realistic relative timing.
//!
//! Each emulated node owns a transaction pool (dedup by group id, pruned on
//! round advance) and a deterministic per-node RNG, and implements
//! [`NodeConnector`] for the engine under test.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use spate_core::types::{NetworkPeer, SignedTxGroup, TxId};
use spate_sync::interfaces::{
    Event, NodeConnector, PeerInfo, RoundSettings, SendMessageCallback, SyncPeerHandle,
};
use spate_sync::{IncomingMessageHandler, SyncConfig, TransactionSyncService};

use crate::helpers::make_group;

/// One node in the emulated network.
pub struct NodeSpec {
    /// Display name used in error reports.
    pub name: &'static str,
    /// Whether the node runs as a relay.
    pub is_relay: bool,
    /// Outgoing connections as `(target index, bytes/second)`.
    pub outgoing: Vec<(usize, u64)>,
}

struct Frame {
    bytes: Vec<u8>,
    seq: u64,
}

struct LinkSender {
    frames: mpsc::UnboundedSender<Frame>,
    next_seq: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    groups: Vec<SignedTxGroup>,
    next_counter: u64,
    known: HashSet<TxId>,
}

/// Shared state of one emulated node: its transport view and its pool.
pub struct EmulatedNode {
    name: String,
    peers: Mutex<Vec<PeerInfo>>,
    links: Mutex<HashMap<NetworkPeer, LinkSender>>,
    handler: Mutex<Option<IncomingMessageHandler>>,
    pool: Mutex<PoolState>,
    events_tx: mpsc::Sender<Event>,
    rng: Mutex<StdRng>,
}

impl EmulatedNode {
    fn new(name: &str, seed: u64, events_tx: mpsc::Sender<Event>) -> Self {
        Self {
            name: name.to_string(),
            peers: Mutex::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            pool: Mutex::new(PoolState::default()),
            events_tx,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Add a group to the pool, assigning the next group counter. Duplicate
    /// ids are ignored. Returns whether the pool changed.
    pub fn add_to_pool(&self, mut group: SignedTxGroup, locally_originated: bool) -> bool {
        let Some(id) = group.id() else { return false };
        let size = {
            let mut pool = self.pool.lock().unwrap();
            if !pool.known.insert(id) {
                return false;
            }
            group.group_counter = pool.next_counter;
            group.locally_originated = locally_originated;
            pool.next_counter += 1;
            pool.groups.push(group);
            pool.groups.len()
        };
        let _ = self.events_tx.try_send(Event::PoolChanged { size });
        true
    }

    /// Snapshot of the pool contents.
    pub fn pool_snapshot(&self) -> Vec<SignedTxGroup> {
        self.pool.lock().unwrap().groups.clone()
    }

    /// Drop groups whose last-valid round is below `round`.
    fn prune_expired(&self, round: u64) {
        let mut pool = self.pool.lock().unwrap();
        pool.groups.retain(|g| {
            g.transactions
                .first()
                .map(|tx| tx.last_valid >= round)
                .unwrap_or(false)
        });
    }

    fn peer_info(&self, handle: &NetworkPeer) -> Option<PeerInfo> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .find(|info| info.network_peer == *handle)
            .cloned()
    }
}

/// The [`NodeConnector`] half handed to the sync service.
struct Connector {
    shared: Arc<EmulatedNode>,
    events_rx: Option<mpsc::Receiver<Event>>,
}

impl NodeConnector for Connector {
    fn events(&mut self) -> mpsc::Receiver<Event> {
        self.events_rx.take().expect("events stream taken once")
    }

    fn current_round_settings(&self) -> RoundSettings {
        RoundSettings {
            round: 0,
            fetch_transactions: true,
        }
    }

    fn random(&self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.shared.rng.lock().unwrap().gen_range(0..bound)
    }

    fn get_peers(&self) -> Vec<PeerInfo> {
        self.shared.peers.lock().unwrap().clone()
    }

    fn get_peer(&self, network_peer: &NetworkPeer) -> Option<PeerInfo> {
        self.shared.peer_info(network_peer)
    }

    fn update_peers(&self, sync_peers: &[SyncPeerHandle], network_peers: &[NetworkPeer]) {
        let mut peers = self.shared.peers.lock().unwrap();
        for (handle, np) in sync_peers.iter().zip(network_peers) {
            if let Some(info) = peers.iter_mut().find(|i| i.network_peer == *np) {
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
        let links = self.shared.links.lock().unwrap();
        let Some(link) = links.get(peer) else {
            debug!(node = %self.shared.name, "emulator: send to unknown link");
            callback(false, 0);
            return;
        };
        let seq = link.next_seq.fetch_add(1, Ordering::Relaxed);
        callback(true, seq);
        let _ = link.frames.send(Frame { bytes: message, seq });
    }

    fn get_pending_transaction_groups(&self) -> (Vec<SignedTxGroup>, u64) {
        let pool = self.shared.pool.lock().unwrap();
        let latest_local = pool
            .groups
            .iter()
            .filter(|g| g.locally_originated)
            .map(|g| g.group_counter)
            .max()
            .unwrap_or(0);
        (pool.groups.clone(), latest_local)
    }

    fn incoming_transaction_groups(&self, _peer: &NetworkPeer, groups: Vec<SignedTxGroup>) {
        for group in groups {
            self.shared.add_to_pool(group, false);
        }
    }
}

/// Deliver frames of one link direction with bandwidth-derived latency.
async fn run_link(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    rate: u64,
    dest: Arc<EmulatedNode>,
    dest_handle: NetworkPeer,
    errors: Arc<Mutex<Vec<String>>>,
) {
    while let Some(frame) = frames.recv().await {
        let transfer =
            Duration::from_nanos(frame.bytes.len() as u64 * 1_000_000_000 / rate.max(1));
        tokio::time::sleep(transfer).await;

        let handler = dest.handler.lock().unwrap().clone();
        let Some(handler) = handler else { continue };
        let sync_peer = dest.peer_info(&dest_handle).and_then(|info| info.sync_peer);
        if let Err(err) =
            handler.on_message(&dest_handle, sync_peer.as_ref(), &frame.bytes, frame.seq)
        {
            // a real transport would disconnect here; scenarios treat any
            // hard error as a failure
            errors
                .lock()
                .unwrap()
                .push(format!("{}: {err}", dest.name));
        }
    }
}

/// A running emulated network.
pub struct Emulator {
    nodes: Vec<Arc<EmulatedNode>>,
    services: Vec<TransactionSyncService>,
    event_txs: Vec<mpsc::Sender<Event>>,
    errors: Arc<Mutex<Vec<String>>>,
    round: u64,
}

impl Emulator {
    /// Wire up the topology and start one sync service per node. Must run
    /// inside a tokio runtime.
    pub fn start(specs: &[NodeSpec]) -> Self {
        let errors = Arc::new(Mutex::new(Vec::new()));

        let mut event_txs = Vec::with_capacity(specs.len());
        let mut event_rxs = Vec::with_capacity(specs.len());
        let nodes: Vec<Arc<EmulatedNode>> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let (tx, rx) = mpsc::channel(64);
                event_txs.push(tx.clone());
                event_rxs.push(rx);
                Arc::new(EmulatedNode::new(spec.name, index as u64 + 1, tx))
            })
            .collect();

        // connections: one handle pair and two FIFO link tasks per edge
        for (from, spec) in specs.iter().enumerate() {
            for &(to, rate) in &spec.outgoing {
                let handle_at_from = NetworkPeer::new(format!("{}->{}", spec.name, specs[to].name));
                let handle_at_to = NetworkPeer::new(format!("{}<-{}", specs[to].name, spec.name));

                nodes[from].peers.lock().unwrap().push(PeerInfo {
                    sync_peer: None,
                    network_peer: handle_at_from.clone(),
                    is_outgoing: true,
                });
                nodes[to].peers.lock().unwrap().push(PeerInfo {
                    sync_peer: None,
                    network_peer: handle_at_to.clone(),
                    is_outgoing: false,
                });

                let (tx_out, rx_out) = mpsc::unbounded_channel();
                nodes[from].links.lock().unwrap().insert(
                    handle_at_from.clone(),
                    LinkSender { frames: tx_out, next_seq: AtomicU64::new(0) },
                );
                tokio::spawn(run_link(
                    rx_out,
                    rate,
                    Arc::clone(&nodes[to]),
                    handle_at_to.clone(),
                    Arc::clone(&errors),
                ));

                let (tx_back, rx_back) = mpsc::unbounded_channel();
                nodes[to].links.lock().unwrap().insert(
                    handle_at_to,
                    LinkSender { frames: tx_back, next_seq: AtomicU64::new(0) },
                );
                tokio::spawn(run_link(
                    rx_back,
                    rate,
                    Arc::clone(&nodes[from]),
                    handle_at_from,
                    Arc::clone(&errors),
                ));
            }
        }

        let services = specs
            .iter()
            .zip(nodes.iter())
            .zip(event_rxs)
            .map(|((spec, shared), events_rx)| {
                let connector = Connector {
                    shared: Arc::clone(shared),
                    events_rx: Some(events_rx),
                };
                let config = if spec.is_relay {
                    SyncConfig::relay()
                } else {
                    SyncConfig::node()
                };
                let service = TransactionSyncService::start(connector, config);
                *shared.handler.lock().unwrap() = Some(service.incoming_handler());
                service
            })
            .collect();

        Self {
            nodes,
            services,
            event_txs,
            errors,
            round: 0,
        }
    }

    /// Seed `count` fresh single-transaction groups into a node's pool.
    pub fn seed(&self, node: usize, count: usize, note_size: usize, last_valid: u64) {
        for i in 0..count {
            let seed = (node as u64) << 32 | i as u64;
            let added =
                self.nodes[node].add_to_pool(make_group(seed, note_size, last_valid), true);
            assert!(added, "seeded group must be fresh");
        }
    }

    /// Advance every node to the next round, pruning expired groups.
    pub async fn advance_round(&mut self) {
        self.round += 1;
        for (node, events) in self.nodes.iter().zip(&self.event_txs) {
            node.prune_expired(self.round);
            let _ = events
                .send(Event::NewRound {
                    round: self.round,
                    fetch_transactions: true,
                })
                .await;
        }
    }

    /// Run the network for `total`, advancing a round every
    /// `round_interval`.
    pub async fn run(&mut self, round_interval: Duration, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed + round_interval <= total {
            tokio::time::sleep(round_interval).await;
            elapsed += round_interval;
            self.advance_round().await;
        }
        if total > elapsed {
            tokio::time::sleep(total - elapsed).await;
        }
    }

    /// Pool contents of node `index`.
    pub fn pool(&self, index: usize) -> Vec<SignedTxGroup> {
        self.nodes[index].pool_snapshot()
    }

    /// Direct access to a node, for boundary scenarios.
    pub fn node(&self, index: usize) -> &Arc<EmulatedNode> {
        &self.nodes[index]
    }

    /// Stop every service and return any hard transport errors observed.
    pub async fn shutdown(self) -> Vec<String> {
        for service in self.services {
            service.stop().await;
        }
        self.errors.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pool_deduplicates_by_group_id() {
        let emulator = Emulator::start(&[NodeSpec {
            name: "solo",
            is_relay: false,
            outgoing: vec![],
        }]);

        let group = make_group(1, 250, 5);
        assert!(emulator.node(0).add_to_pool(group.clone(), false));
        assert!(!emulator.node(0).add_to_pool(group, false), "duplicate must be ignored");
        assert_eq!(emulator.pool(0).len(), 1);

        let errors = emulator.shutdown().await;
        assert!(errors.is_empty(), "unexpected transport errors: {errors:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_drops_expired_groups() {
        let mut emulator = Emulator::start(&[NodeSpec {
            name: "solo",
            is_relay: false,
            outgoing: vec![],
        }]);
        emulator.seed(0, 1, 100, 1);
        emulator.seed(0, 1, 100, 10);
        // the differing last-valid rounds give the two groups distinct ids
        assert_eq!(emulator.pool(0).len(), 2);

        emulator.advance_round().await; // round 1: both still valid
        assert_eq!(emulator.pool(0).len(), 2);
        emulator.advance_round().await; // round 2: last_valid=1 expires
        assert_eq!(emulator.pool(0).len(), 1);

        emulator.shutdown().await;
    }
}
