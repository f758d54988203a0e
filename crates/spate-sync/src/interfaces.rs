//! Contract between the sync engine and the embedding node.
//!
//! The engine owns nothing outside its main loop: the ledger, the
//! transaction pool, and the transport are all reached through
//! [`NodeConnector`]. The transport keeps one [`SyncPeerHandle`] per
//! connection (bound via [`NodeConnector::update_peers`]) so inbound bytes
//! can be enqueued without crossing into main-loop state.

use tokio::sync::mpsc;

use spate_core::types::{NetworkPeer, Round, SignedTxGroup};
use crate::ordering::MessageHeapItem;

/// External triggering events delivered by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The ledger moved to a new round.
    NewRound {
        /// The new round number.
        round: Round,
        /// Whether this node wants to receive transactions at all. Non-relays
        /// without participation keys have no reason to fetch.
        fetch_transactions: bool,
    },
    /// The pending transaction pool changed size.
    PoolChanged {
        /// Current number of pending transaction groups.
        size: usize,
    },
}

/// Round state as reported by the ledger at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundSettings {
    /// The current round.
    pub round: Round,
    /// Whether the node wants to receive transactions.
    pub fetch_transactions: bool,
}

/// Completion callback for [`NodeConnector::send_peer_message`].
///
/// Invoked on the transport thread with whether the message was enqueued and
/// the transport-assigned sequence number.
pub type SendMessageCallback = Box<dyn FnOnce(bool, u64) + Send + 'static>;

/// Producer-side handle to a peer's message ordering intake.
///
/// Held by the transport (via [`NodeConnector::update_peers`]) and used by
/// the [`IncomingMessageHandler`](crate::incoming::IncomingMessageHandler) to
/// enqueue parsed messages directly onto the owning peer's heap.
#[derive(Clone, Debug)]
pub struct SyncPeerHandle {
    pub(crate) intake: mpsc::Sender<MessageHeapItem>,
}

/// A single peer as reported by the node's transport.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// The sync engine's handle for this connection, if one has been bound.
    pub sync_peer: Option<SyncPeerHandle>,
    /// The transport's opaque handle for this connection.
    pub network_peer: NetworkPeer,
    /// Direction of the connection at establishment time; immutable.
    pub is_outgoing: bool,
}

/// Everything the sync engine needs from the embedding node.
///
/// All methods are non-blocking. `send_peer_message` completes
/// asynchronously through its callback; sequence numbers are assigned per
/// connection by the transport, starting at 0 and increasing by 1.
pub trait NodeConnector: Send + 'static {
    /// The external event stream. Called once, when the main loop starts.
    fn events(&mut self) -> mpsc::Receiver<Event>;

    /// Current round state from the ledger.
    fn current_round_settings(&self) -> RoundSettings;

    /// A uniform random integer in `[0, bound)`.
    fn random(&self, bound: u64) -> u64;

    /// All currently connected peers.
    fn get_peers(&self) -> Vec<PeerInfo>;

    /// A single peer by its network handle, or `None` if unknown.
    fn get_peer(&self, network_peer: &NetworkPeer) -> Option<PeerInfo>;

    /// Bind newly created sync handles to their network peers so future
    /// inbound messages can be routed without a main-loop round trip.
    fn update_peers(&self, sync_peers: &[SyncPeerHandle], network_peers: &[NetworkPeer]);

    /// Hand an encoded message to the transport for `peer`. Non-blocking;
    /// `callback` fires on the transport thread once the message is enqueued
    /// (or rejected).
    fn send_peer_message(
        &self,
        peer: &NetworkPeer,
        message: Vec<u8>,
        callback: SendMessageCallback,
    );

    /// Immutable snapshot of the pending pool, ordered by group counter,
    /// together with the group counter of the most recent locally-originated
    /// group.
    fn get_pending_transaction_groups(&self) -> (Vec<SignedTxGroup>, u64);

    /// Deliver decoded inbound transaction groups to the pool.
    fn incoming_transaction_groups(&self, peer: &NetworkPeer, groups: Vec<SignedTxGroup>);
}
