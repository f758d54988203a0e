//! Per-peer state: timing, pacing, selection filters, and the bandwidth
//! estimate.
//!
//! Each connected remote gets one [`Peer`] record, owned and mutated only by
//! the sync main loop. A peer advances through a small state machine driven
//! by scheduler fires (and, for a relay's outgoing peers, by inbound
//! messages), emitting operations for the main loop to execute.

use std::time::Duration;
use tracing::debug;

use spate_core::constants::{
    DEFAULT_DATA_EXCHANGE_RATE, MAX_DATA_EXCHANGE_RATE, MAX_INCOMING_FILTER_HISTORY,
    MAX_REQUEST_MODULATOR, MIN_DATA_EXCHANGE_RATE, RECENT_SENT_CACHE_CAPACITY,
};
use spate_core::types::{NetworkPeer, Round, SignedTxGroup, TxId};

use crate::bloom::BloomFilter;
use crate::interfaces::SyncPeerHandle;
use crate::ordering::MessageOrderingHeap;
use crate::protocol::{RequestParams, TimingParams};
use crate::recent::RecentTransactions;

/// Peer sub-state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Before the first message of the current cadence. For an outgoing peer
    /// of a relay this means waiting for an inbound message to respond to.
    Startup,
    /// A message was sent; holding off before sending more.
    Holdsoff,
    /// The holdoff expired; the peer can be preempted back to `Holdsoff`
    /// when the pacing interval shrinks materially.
    Interrupt,
    /// Outgoing peers of relays only: the next message closes the response
    /// window and carries the Bloom filter.
    LateBloom,
}

/// Operations requested by a state machine advance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdvanceOps {
    /// Assemble and send a message to this peer.
    pub send_message: bool,
    /// Add the peer to the interruptible set.
    pub set_interruptible: bool,
    /// Remove the peer from the interruptible set.
    pub clear_interruptible: bool,
    /// Reschedule the peer at `now + beta` without sending.
    pub reschedule: bool,
}

/// Where to schedule a peer's next fire after a send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleOffset {
    /// Offset from now.
    Relative(Duration),
    /// Absolute time on the round-local clock.
    Absolute(Duration),
}

/// A Bloom filter received from the peer, tagged with its round for pruning.
#[derive(Clone, Debug)]
struct IncomingFilter {
    round: Round,
    filter: BloomFilter,
}

/// The last Bloom filter we sent, cached so an identical one is not rebuilt.
#[derive(Clone, Debug)]
struct SentFilter {
    params: RequestParams,
    pool_watermark: u64,
    filter: BloomFilter,
}

/// Per-peer sync state. All mutation happens on the main-loop task.
pub struct Peer {
    network_peer: NetworkPeer,
    is_outgoing: bool,

    pub(crate) state: PeerState,
    pub(crate) last_round: Round,

    pub(crate) incoming_messages: MessageOrderingHeap,
    pub(crate) next_received_seq: u64,

    recent_incoming_filters: Vec<IncomingFilter>,
    recent_sent_transactions: RecentTransactions,

    // what the remote asked us to send
    pub(crate) requested_offset: u8,
    pub(crate) requested_modulator: u8,
    // what we want the remote to send back
    local_offset: u8,
    local_modulator: u8,

    pub(crate) last_sent_seq: u64,
    pub(crate) last_sent_round: Round,
    pub(crate) last_sent_timestamp: Duration,
    pub(crate) last_sent_size: usize,
    last_sent_bloom: Option<SentFilter>,

    pub(crate) last_confirmed_seq: u64,
    pub(crate) last_received_round: Round,
    pub(crate) last_received_timestamp: Duration,
    pub(crate) last_received_size: usize,
    pub(crate) last_received_next_min_delay: Duration,

    data_exchange_rate: u64,

    // cursor into the pending pool for round-robin selection across calls
    last_selection_counter: u64,
}

impl Peer {
    /// Create a peer record for a transport connection.
    pub fn new(network_peer: NetworkPeer, is_outgoing: bool, heap_capacity: usize) -> Self {
        Self {
            network_peer,
            is_outgoing,
            state: PeerState::Startup,
            last_round: 0,
            incoming_messages: MessageOrderingHeap::new(heap_capacity),
            next_received_seq: 0,
            recent_incoming_filters: Vec::new(),
            recent_sent_transactions: RecentTransactions::new(RECENT_SENT_CACHE_CAPACITY),
            requested_offset: 0,
            requested_modulator: 0,
            local_offset: 0,
            local_modulator: 0,
            last_sent_seq: 0,
            last_sent_round: 0,
            last_sent_timestamp: Duration::ZERO,
            last_sent_size: 0,
            last_sent_bloom: None,
            last_confirmed_seq: 0,
            last_received_round: 0,
            last_received_timestamp: Duration::ZERO,
            last_received_size: 0,
            last_received_next_min_delay: Duration::ZERO,
            data_exchange_rate: DEFAULT_DATA_EXCHANGE_RATE,
            last_selection_counter: 0,
        }
    }

    /// The transport handle this record belongs to.
    pub fn network_peer(&self) -> &NetworkPeer {
        &self.network_peer
    }

    /// Connection direction at establishment time.
    pub fn is_outgoing(&self) -> bool {
        self.is_outgoing
    }

    /// Producer-side handle for the transport to enqueue inbound messages.
    pub fn handle(&self) -> SyncPeerHandle {
        SyncPeerHandle {
            intake: self.incoming_messages.intake(),
        }
    }

    /// Current estimated exchange rate in bytes/second.
    pub fn data_exchange_rate(&self) -> u64 {
        self.data_exchange_rate
    }

    /// Whether `id` was recently sent to (or received from) this peer.
    pub fn recently_sent(&self, id: &TxId) -> bool {
        self.recent_sent_transactions.contains(id)
    }

    // ------------------------------------------------------------------
    // Outgoing side
    // ------------------------------------------------------------------

    /// Select pending groups for transmission, bounded by the byte budget
    /// derived from `send_window` and the estimated exchange rate.
    ///
    /// Returns indices into `pending`, the matching group ids, and whether
    /// eligible candidates remained beyond the budget. The selection cursor
    /// persists across calls so successive messages walk the pool
    /// round-robin instead of rescanning from the start.
    pub fn select_pending_transactions(
        &mut self,
        pending: &[SignedTxGroup],
        send_window: Duration,
        round: Round,
    ) -> (Vec<usize>, Vec<TxId>, bool) {
        // a peer that is too far behind gets no transactions, and neither
        // does one that asked for nothing
        if self.last_round < round.saturating_sub(1) || self.requested_modulator == 0 {
            return (Vec::new(), Vec::new(), false);
        }
        if pending.is_empty() {
            return (Vec::new(), Vec::new(), false);
        }

        let budget_bytes = (send_window.as_nanos()
            .saturating_mul(u128::from(self.data_exchange_rate))
            / 1_000_000_000) as usize;

        let start_index = pending
            .partition_point(|g| g.group_counter < self.last_selection_counter)
            % pending.len();

        let mut selected = Vec::new();
        let mut selected_ids = Vec::new();
        let mut accumulated = 0usize;
        let mut window_reached = false;
        let mut has_more = false;

        for scan in 0..pending.len() {
            let idx = (scan + start_index) % pending.len();
            let group = &pending[idx];
            let Some(id) = group.id() else { continue };

            // not in the residue class the peer asked for
            if self.requested_modulator > 1
                && id.prefix64() % u64::from(self.requested_modulator)
                    != u64::from(self.requested_offset)
            {
                continue;
            }

            // the peer would accept this group; advance the cursor whether or
            // not it ends up chosen
            self.last_selection_counter = group.group_counter;

            if self.recent_sent_transactions.contains(&id) {
                continue;
            }
            // skip anything a recent filter says the remote already holds
            if self
                .recent_incoming_filters
                .iter()
                .any(|f| f.filter.test(&id))
            {
                continue;
            }

            if window_reached {
                has_more = true;
                break;
            }
            accumulated += group.encoded_len();
            selected.push(idx);
            selected_ids.push(id);
            if accumulated > budget_bytes {
                window_reached = true;
            }
        }

        (selected, selected_ids, has_more)
    }

    /// Record a successfully enqueued message, once the transport confirms
    /// it with a sequence number.
    pub fn update_message_sent(
        &mut self,
        round: Round,
        sent_ids: &[TxId],
        timestamp: Duration,
        sequence_number: u64,
        message_size: usize,
        bloom: Option<(RequestParams, u64, BloomFilter)>,
    ) {
        for id in sent_ids {
            self.recent_sent_transactions.add(*id);
        }
        self.last_sent_seq = sequence_number;
        self.last_sent_round = round;
        self.last_sent_timestamp = timestamp;
        self.last_sent_size = message_size;
        if let Some((params, pool_watermark, filter)) = bloom {
            self.last_sent_bloom = Some(SentFilter {
                params,
                pool_watermark,
                filter,
            });
        }
    }

    /// The last filter we sent, if it was built against the same request
    /// params and the pool has not advanced past the same watermark.
    pub(crate) fn cached_sent_bloom(
        &self,
        params: RequestParams,
        pool_watermark: u64,
    ) -> Option<BloomFilter> {
        self.last_sent_bloom
            .as_ref()
            .filter(|sent| sent.params == params && sent.pool_watermark == pool_watermark)
            .map(|sent| sent.filter.clone())
    }

    /// The residue class we want the remote to send us.
    pub fn local_request_params(&self) -> (u8, u8) {
        (self.local_offset, self.local_modulator)
    }

    /// Store the residue class we want from this peer. Modulators beyond the
    /// representable range saturate.
    pub fn set_local_request_params(&mut self, offset: u64, modulator: u64) {
        let modulator = modulator.min(MAX_REQUEST_MODULATOR);
        self.local_modulator = modulator as u8;
        if modulator != 0 {
            self.local_offset = (offset % modulator) as u8;
        }
    }

    // ------------------------------------------------------------------
    // Incoming side
    // ------------------------------------------------------------------

    /// Install a filter received from this peer, pruning entries from rounds
    /// two or more behind the current round and capping the history length.
    pub fn add_incoming_filter(
        &mut self,
        round: Round,
        filter: BloomFilter,
        current_round: Round,
    ) {
        let horizon = current_round.saturating_sub(1);
        if round < horizon {
            return;
        }
        self.recent_incoming_filters.retain(|f| f.round >= horizon);
        self.recent_incoming_filters.push(IncomingFilter { round, filter });
        if self.recent_incoming_filters.len() > MAX_INCOMING_FILTER_HISTORY {
            self.recent_incoming_filters.remove(0);
        }
    }

    /// Number of retained incoming filters.
    pub fn incoming_filter_count(&self) -> usize {
        self.recent_incoming_filters.len()
    }

    /// Store the residue class the remote asked us for.
    pub fn update_request_params(&mut self, modulator: u8, offset: u8) {
        self.requested_modulator = modulator;
        self.requested_offset = offset;
    }

    /// Fold received group ids into the recently-sent cache so they are not
    /// echoed back to the peer that delivered them.
    pub fn note_incoming(&mut self, groups: &[SignedTxGroup]) {
        for group in groups {
            if let Some(id) = group.id() {
                self.recent_sent_transactions.add(id);
            }
        }
    }

    /// Apply a received timing block: acknowledgement, pacing window, and —
    /// when the message confirms our latest send within the same round — a
    /// fresh bandwidth sample.
    ///
    /// The estimator is deliberately crude: a single clamped sample, no
    /// smoothing.
    pub fn update_incoming_timing(
        &mut self,
        timings: &TimingParams,
        current_round: Round,
        now: Duration,
        incoming_size: usize,
    ) {
        self.last_confirmed_seq = u64::from(timings.ref_seq);
        if self.last_confirmed_seq == self.last_sent_seq && self.last_sent_round == current_round {
            if let Some(since_sent) = now.checked_sub(self.last_sent_timestamp) {
                let responder_elapsed = Duration::from_nanos(timings.responder_elapsed_ns);
                if since_sent > responder_elapsed {
                    let transmit_time = since_sent - responder_elapsed;
                    let message_bytes = (self.last_sent_size + incoming_size) as u128;
                    let rate = (message_bytes * 1_000_000_000
                        / transmit_time.as_nanos().max(1)) as u64;
                    self.data_exchange_rate =
                        rate.clamp(MIN_DATA_EXCHANGE_RATE, MAX_DATA_EXCHANGE_RATE);
                }
            }
        }
        self.last_received_round = current_round;
        self.last_received_timestamp = now;
        self.last_received_size = incoming_size;
        self.last_received_next_min_delay = Duration::from_nanos(timings.next_min_delay_ns);
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Advance the state machine on a scheduler fire (or, for a relay's
    /// outgoing peer, on the first inbound message of a response window).
    pub fn advance_state(
        &mut self,
        _now: Duration,
        is_relay: bool,
        message_time_window: Duration,
    ) -> AdvanceOps {
        let mut ops = AdvanceOps::default();
        if is_relay && self.is_outgoing {
            // outgoing peers of a relay respond rather than initiate
            match self.state {
                PeerState::Startup => {
                    let window = self.last_received_next_min_delay.as_nanos();
                    if window / message_time_window.as_nanos().max(1) > 1 {
                        // room for several messages; save the filter for last
                        self.state = PeerState::Holdsoff;
                    } else {
                        self.state = PeerState::LateBloom;
                    }
                    ops.send_message = true;
                }
                PeerState::Holdsoff | PeerState::LateBloom => {
                    // Holdsoff may flip to LateBloom after this send, once
                    // the remaining response window is down to one message
                    ops.send_message = true;
                }
                PeerState::Interrupt => {
                    debug!(peer = ?self.network_peer, state = ?self.state,
                        "peer: unexpected state on outgoing relay fire");
                }
            }
        } else {
            match self.state {
                PeerState::Startup | PeerState::Interrupt => {
                    self.state = PeerState::Holdsoff;
                    ops.send_message = true;
                    ops.clear_interruptible = true;
                }
                PeerState::Holdsoff => {
                    self.state = PeerState::Interrupt;
                    ops.reschedule = true;
                    ops.set_interruptible = true;
                }
                PeerState::LateBloom => {
                    debug!(peer = ?self.network_peer, state = ?self.state,
                        "peer: unexpected state on fire");
                }
            }
        }
        ops
    }

    /// Where to schedule the next fire after a message went out, applying
    /// the post-send state transitions.
    ///
    /// `None` means the peer waits for external input (an outgoing relay
    /// peer whose response window just closed).
    pub fn next_schedule_offset(
        &mut self,
        is_relay: bool,
        beta: Duration,
        partial_message: bool,
        now: Duration,
        message_time_window: Duration,
    ) -> Option<ScheduleOffset> {
        if partial_message {
            if is_relay {
                if self.is_outgoing {
                    if self.state == PeerState::Holdsoff {
                        // still inside the response window; keep draining
                        return Some(ScheduleOffset::Relative(message_time_window));
                    }
                    return None;
                }
                return Some(ScheduleOffset::Relative(message_time_window));
            }
            self.state = PeerState::Startup;
            return Some(ScheduleOffset::Relative(message_time_window));
        }

        if !is_relay {
            return Some(ScheduleOffset::Relative(beta));
        }
        if !self.is_outgoing {
            return Some(ScheduleOffset::Relative(beta * 2));
        }

        match self.state {
            PeerState::Holdsoff => {
                let window_end = self
                    .last_received_timestamp
                    .saturating_add(self.last_received_next_min_delay);
                if window_end.saturating_sub(now) <= message_time_window {
                    // only one message left in the window; it carries the bloom
                    self.state = PeerState::LateBloom;
                }
                let midpoint = self
                    .last_received_timestamp
                    .saturating_add(self.last_received_next_min_delay / 2);
                if midpoint > now {
                    Some(ScheduleOffset::Absolute(midpoint))
                } else {
                    Some(ScheduleOffset::Relative(message_time_window))
                }
            }
            PeerState::LateBloom => {
                // response window closed; wait for the next inbound message
                self.state = PeerState::Startup;
                None
            }
            PeerState::Startup | PeerState::Interrupt => None,
        }
    }
}
