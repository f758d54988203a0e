//! Inbound message intake and evaluation.
//!
//! Two halves, split across the thread boundary:
//!
//! - [`IncomingMessageHandler`] runs on the transport thread. It parses the
//!   envelope, checks the version, enqueues the message onto the target
//!   peer's ordering heap, and posts a wake-up on the inbound channel. It
//!   never touches main-loop state. Any error it returns is a request to
//!   disconnect the peer.
//! - The main-loop evaluator drains each peer's heap in strict sequence
//!   order, applies metadata (round, filters, request params, timing), and
//!   delivers decoded transaction groups to the node.

use tracing::debug;

use spate_core::error::{OrderingError, SyncError};
use spate_core::types::{NetworkPeer, SignedTxGroup};
use tokio::sync::mpsc;

use crate::bloom::BloomFilter;
use crate::interfaces::{NodeConnector, SyncPeerHandle};
use crate::mainloop::SyncState;
use crate::ordering::MessageHeapItem;
use crate::peer::{Peer, PeerState};
use crate::protocol::TransactionBlockMessage;

/// Wake-up posted to the main loop for each inbound message.
///
/// When the transport had no bound [`SyncPeerHandle`] yet (a message from an
/// unrecognized peer), the parsed message rides along so the main loop can
/// create the record and enqueue it there.
pub(crate) struct IncomingEvent {
    pub network_peer: NetworkPeer,
    pub item: Option<MessageHeapItem>,
}

/// Transport-facing entry point for inbound bytes.
#[derive(Clone)]
pub struct IncomingMessageHandler {
    incoming_tx: mpsc::Sender<IncomingEvent>,
}

impl IncomingMessageHandler {
    pub(crate) fn new(incoming_tx: mpsc::Sender<IncomingEvent>) -> Self {
        Self { incoming_tx }
    }

    /// Handle one inbound message. Called from the transport's dispatch
    /// thread; never blocks and never touches peer state beyond the bound
    /// intake queue.
    ///
    /// A returned error (parse failure, unsupported version, or a full
    /// ordering heap) is a request to disconnect the peer.
    pub fn on_message(
        &self,
        network_peer: &NetworkPeer,
        peer: Option<&SyncPeerHandle>,
        message: &[u8],
        sequence_number: u64,
    ) -> Result<(), SyncError> {
        let decoded = TransactionBlockMessage::decode(message)?;
        let item = MessageHeapItem {
            seq: sequence_number,
            message: decoded,
            encoded_size: message.len(),
        };

        match peer {
            Some(handle) => {
                handle
                    .intake
                    .try_send(item)
                    .map_err(|_| OrderingError::Capacity)?;
                if self
                    .incoming_tx
                    .try_send(IncomingEvent {
                        network_peer: network_peer.clone(),
                        item: None,
                    })
                    .is_err()
                {
                    // the heap entry stays consistent; the next wake-up on
                    // this channel resyncs
                    debug!(peer = ?network_peer, "incoming: wake-up channel full");
                }
            }
            None => {
                // no record yet; peer creation must happen on the main loop
                if self
                    .incoming_tx
                    .try_send(IncomingEvent {
                        network_peer: network_peer.clone(),
                        item: Some(item),
                    })
                    .is_err()
                {
                    debug!(peer = ?network_peer, "incoming: dropping message for unbound peer");
                }
            }
        }
        Ok(())
    }
}

impl<N: NodeConnector> SyncState<N> {
    /// Process one inbound wake-up: locate or create the peer record, then
    /// drain every in-order message from its heap.
    pub(crate) fn evaluate_incoming_message(&mut self, event: IncomingEvent) {
        let key = event.network_peer;
        if !self.peers.contains_key(&key) {
            // lazily create the record; direction comes from the transport
            // when it knows the connection
            let is_outgoing = self
                .node
                .get_peer(&key)
                .map(|info| info.is_outgoing)
                .unwrap_or(false);
            let peer = Peer::new(key.clone(), is_outgoing, self.config.ordering_heap_capacity);
            self.node.update_peers(&[peer.handle()], &[key.clone()]);
            self.peers.insert(key.clone(), peer);
        }
        let Some(peer) = self.peers.get_mut(&key) else { return };

        if let Some(item) = event.item {
            if peer
                .incoming_messages
                .enqueue(item.message, item.seq, item.encoded_size)
                .is_err()
            {
                // a freshly created heap is practically never full
                debug!(peer = ?key, "incoming: intake full for new peer, dropping message");
            }
        }

        let mut processed_any = false;
        loop {
            let seq = match peer.incoming_messages.peek_seq() {
                Ok(seq) => seq,
                Err(_) => break, // drained
            };
            if seq < peer.next_received_seq {
                // duplicate or replayed sequence number
                let _ = peer.incoming_messages.pop();
                debug!(peer = ?key, seq, expected = peer.next_received_seq,
                    "incoming: dropping below-sequence message");
                continue;
            }
            if seq > peer.next_received_seq {
                // hold until the gap fills
                break;
            }
            let Ok(item) = peer.incoming_messages.pop() else { break };
            peer.next_received_seq += 1;
            processed_any = true;

            let msg = item.message;
            if msg.round > peer.last_round {
                peer.last_round = msg.round;
            }

            if let Some(encoded_filter) = &msg.bloom {
                match BloomFilter::decode(encoded_filter) {
                    Ok(filter) => peer.add_incoming_filter(msg.round, filter, self.round),
                    Err(err) => {
                        // soft error: the filter is advisory
                        debug!(peer = ?key, %err, "incoming: dropping undecodable filter");
                    }
                }
            }

            peer.update_request_params(
                msg.updated_request_params.modulator,
                msg.updated_request_params.offset,
            );
            let now = self.clock.since();
            peer.update_incoming_timing(&msg.msg_sync, self.round, now, item.encoded_size);

            if peer.last_round + 1 < self.round {
                // too far behind; let it catch up before feeding it payload
                debug!(peer = ?key, peer_round = peer.last_round, round = self.round,
                    "incoming: skipping payload from stale round");
                continue;
            }

            let groups: Vec<SignedTxGroup> = msg
                .transaction_groups
                .groups
                .into_iter()
                .filter(|txs| !txs.is_empty())
                .map(|transactions| SignedTxGroup {
                    transactions,
                    group_counter: 0,
                    locally_originated: false,
                })
                .collect();
            if groups.is_empty() {
                continue;
            }
            debug!(peer = ?key, count = groups.len(), "incoming: delivering transaction groups");
            peer.note_incoming(&groups);
            self.node.incoming_transaction_groups(&key, groups);
        }

        // on a relay, an outgoing peer in startup replies to the first
        // message of a response window rather than waiting for a timer
        if self.config.is_relay
            && processed_any
            && peer.is_outgoing()
            && peer.state == PeerState::Startup
        {
            let now = self.clock.since();
            let ops = peer.advance_state(now, true, self.config.message_time_window);
            if ops.send_message {
                let monitor = self
                    .clock
                    .deadline_monitor_at(now + self.config.send_messages_window);
                self.send_message_loop(now, monitor, &[key]);
            }
        }
    }
}
