//! Outgoing message assembly and the bounded send loop.
//!
//! The main loop hands the send loop a list of peers and a deadline monitor.
//! One snapshot of the pending pool is taken per invocation; each peer gets
//! a message assembled against it, encoded, and dispatched through the
//! node's non-blocking send primitive. The completion callback runs on the
//! transport thread and posts a [`MessageSentEvent`] back to the main loop,
//! which then folds the sent ids and timing into the peer record.

use std::time::Duration;
use tracing::{debug, warn};

use spate_core::error::ExchangeError;
use spate_core::types::{NetworkPeer, Round, SignedTxGroup, TxId};

use crate::bloom::BloomFilter;
use crate::clock::DeadlineMonitor;
use crate::interfaces::{NodeConnector, SendMessageCallback};
use crate::mainloop::SyncState;
use crate::peer::{Peer, PeerState, ScheduleOffset};
use crate::protocol::{
    RequestParams, TransactionBlockMessage, TXN_BLOCK_MESSAGE_VERSION,
};

/// Posted by the send-completion callback once the transport confirms a
/// message was enqueued with its sequence number.
pub(crate) struct MessageSentEvent {
    pub network_peer: NetworkPeer,
    pub round: Round,
    pub sent_ids: Vec<TxId>,
    pub bloom: Option<(RequestParams, u64, BloomFilter)>,
    pub encoded_size: usize,
    pub timestamp: Duration,
    pub sequence_number: u64,
}

/// Loop-state snapshot threaded into per-peer assembly.
pub(crate) struct AssembleContext {
    pub round: Round,
    pub fetch_transactions: bool,
    pub requests_offset: u64,
    pub is_relay: bool,
    pub beta: Duration,
    pub message_time_window: Duration,
    pub shuffler: u32,
    pub pool_watermark: u64,
}

/// A fully assembled, encoded message plus the metadata the completion
/// callback needs to update the peer record.
pub(crate) struct AssembledMessage {
    pub encoded: Vec<u8>,
    pub round: Round,
    pub sent_ids: Vec<TxId>,
    pub bloom: Option<(RequestParams, u64, BloomFilter)>,
    pub partial: bool,
}

/// Narrow a pool snapshot down to locally-originated groups. Used when the
/// node does not fetch transactions: it still pushes its own.
///
/// Counters are ascending, so nothing past the latest locally-originated
/// counter can qualify.
pub(crate) fn locally_generated_transactions(
    pending: Vec<SignedTxGroup>,
    latest_local_counter: u64,
) -> Vec<SignedTxGroup> {
    pending
        .into_iter()
        .take_while(|g| g.group_counter <= latest_local_counter)
        .filter(|g| g.locally_originated)
        .collect()
}

/// Compose a message for `peer` against the shared pool snapshot.
pub(crate) fn assemble_peer_message(
    peer: &mut Peer,
    pending: &[SignedTxGroup],
    ctx: &AssembleContext,
    now: Duration,
) -> Result<AssembledMessage, ExchangeError> {
    let mut msg = TransactionBlockMessage {
        version: TXN_BLOCK_MESSAGE_VERSION,
        round: ctx.round,
        ..Default::default()
    };

    let mut bloom_meta = None;
    if ctx.fetch_transactions {
        let (offset, modulator) = peer.local_request_params();
        msg.updated_request_params.modulator = modulator;
        if modulator > 0 {
            // the rolling offset rotates which residue class we ask for over
            // time; received request params are never rotated
            msg.updated_request_params.offset =
                ((ctx.requests_offset + u64::from(offset)) % u64::from(modulator)) as u8;
        }

        // an outgoing peer of a relay gets the filter only on the message
        // that closes its response window
        let include_bloom = if ctx.is_relay && peer.is_outgoing() {
            peer.state == PeerState::LateBloom
        } else {
            true
        };
        if include_bloom {
            let params = msg.updated_request_params;
            let filter = peer
                .cached_sent_bloom(params, ctx.pool_watermark)
                .unwrap_or_else(|| BloomFilter::build(params, pending, ctx.shuffler));
            if !filter.is_empty() {
                msg.bloom = Some(filter.encode());
                bloom_meta = Some((params, ctx.pool_watermark, filter));
            }
        }
    }

    let (selected, sent_ids, partial) =
        peer.select_pending_transactions(pending, ctx.message_time_window, ctx.round);
    msg.transaction_groups.groups = selected
        .iter()
        .map(|&idx| pending[idx].transactions.clone())
        .collect();

    msg.msg_sync.ref_seq = if peer.next_received_seq > 0 {
        (peer.next_received_seq - 1) as u32
    } else {
        0
    };
    msg.msg_sync.responder_elapsed_ns = if peer.next_received_seq > 0 {
        now.saturating_sub(peer.last_received_timestamp).as_nanos() as u64
    } else {
        0
    };
    msg.msg_sync.next_min_delay_ns = (ctx.beta * 2).as_nanos() as u64;

    let encoded = msg.encode()?;
    Ok(AssembledMessage {
        encoded,
        round: ctx.round,
        sent_ids,
        bloom: bloom_meta,
        partial,
    })
}

impl<N: NodeConnector> SyncState<N> {
    /// Send one message to each peer in `peer_keys`, stopping early when the
    /// deadline monitor expires. Peers skipped by an early exit keep their
    /// `last_sent` state untouched and are rescheduled for a near retry.
    pub(crate) fn send_message_loop(
        &mut self,
        now: Duration,
        deadline: DeadlineMonitor,
        peer_keys: &[NetworkPeer],
    ) {
        if peer_keys.is_empty() {
            return;
        }
        let (mut pending, latest_local) = self.node.get_pending_transaction_groups();
        if !self.fetch_transactions {
            pending = locally_generated_transactions(pending, latest_local);
        }
        let pool_watermark = pending.last().map(|g| g.group_counter).unwrap_or(0);

        for (idx, key) in peer_keys.iter().enumerate() {
            // the first peer always gets its message; after that the window
            // governs
            if idx > 0 && deadline.expired() {
                debug!(
                    skipped = peer_keys.len() - idx,
                    "outgoing: send window expired mid-loop"
                );
                for skipped in &peer_keys[idx..] {
                    self.reschedule_unsent(skipped, now);
                }
                break;
            }

            let Some(peer) = self.peers.get_mut(key) else { continue };
            let ctx = AssembleContext {
                round: self.round,
                fetch_transactions: self.fetch_transactions,
                requests_offset: self.requests_offset,
                is_relay: self.config.is_relay,
                beta: self.last_beta,
                message_time_window: self.config.message_time_window,
                shuffler: self.node.random(u64::from(u32::MAX)) as u32,
                pool_watermark,
            };
            let assembled = match assemble_peer_message(peer, &pending, &ctx, now) {
                Ok(assembled) => assembled,
                Err(err) => {
                    warn!(peer = ?key, %err, "outgoing: failed to assemble message");
                    continue;
                }
            };

            let event = MessageSentEvent {
                network_peer: key.clone(),
                round: assembled.round,
                sent_ids: assembled.sent_ids,
                bloom: assembled.bloom,
                encoded_size: assembled.encoded.len(),
                timestamp: Duration::ZERO,
                sequence_number: 0,
            };
            let outgoing_tx = self.outgoing_tx.clone();
            let clock = self.clock.clone();
            let callback: SendMessageCallback = Box::new(move |enqueued, sequence_number| {
                if !enqueued {
                    // the peer's next scheduled fire produces a fresh message
                    return;
                }
                let mut event = event;
                event.timestamp = clock.since();
                event.sequence_number = sequence_number;
                if outgoing_tx.try_send(event).is_err() {
                    debug!("outgoing: completion channel full, dropping confirmation");
                }
            });
            self.node.send_peer_message(key, assembled.encoded, callback);

            if let Some(offset) = peer.next_schedule_offset(
                self.config.is_relay,
                self.last_beta,
                assembled.partial,
                now,
                self.config.message_time_window,
            ) {
                let at = match offset {
                    ScheduleOffset::Relative(delta) => now + delta,
                    ScheduleOffset::Absolute(at) => at,
                };
                self.scheduler.schedule(key.clone(), at);
            }
        }
    }

    /// Requeue a peer the send loop never reached. Its send-tracking state
    /// is untouched; non-relay peers fall back to `Startup` so the retry
    /// fire sends immediately.
    fn reschedule_unsent(&mut self, key: &NetworkPeer, now: Duration) {
        let Some(peer) = self.peers.get_mut(key) else { return };
        if !self.config.is_relay {
            peer.state = PeerState::Startup;
        }
        self.scheduler
            .schedule(key.clone(), now + self.config.message_time_window);
    }

    /// Fold a confirmed send back into the peer record.
    pub(crate) fn evaluate_outgoing_message(&mut self, event: MessageSentEvent) {
        let Some(peer) = self.peers.get_mut(&event.network_peer) else {
            debug!(peer = ?event.network_peer, "outgoing: confirmation for unknown peer");
            return;
        };
        peer.update_message_sent(
            event.round,
            &event.sent_ids,
            event.timestamp,
            event.sequence_number,
            event.encoded_size,
            event.bloom,
        );
    }
}
