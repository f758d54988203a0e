//! Protocol constants and tunables for the transaction sync engine.

use std::time::Duration;

/// Target false-positive rate for outgoing Bloom filters.
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Maximum number of `(round, filter)` pairs retained per peer.
///
/// Filters from rounds two or more behind the current round are pruned on
/// insert, so the history never grows beyond this bound.
pub const MAX_INCOMING_FILTER_HISTORY: usize = 20;

/// Capacity of the per-peer recently-sent transaction cache.
pub const RECENT_SENT_CACHE_CAPACITY: usize = 10_000;

/// Delay after a new round before the first peer message is scheduled.
pub const KICKOFF_TIME: Duration = Duration::from_millis(200);

/// Jitter range added to [`KICKOFF_TIME`] when seeding the peer scheduler,
/// spreading the first burst of messages across peers.
pub const KICKOFF_JITTER: Duration = Duration::from_millis(100);

/// Deadline for a single batch of the outgoing send loop.
pub const SEND_MESSAGES_WINDOW: Duration = Duration::from_millis(10);

/// Nominal gap between back-to-back messages to the same peer. Also the
/// send window used to convert a peer's data exchange rate into a per-message
/// byte budget.
pub const MESSAGE_TIME_WINDOW: Duration = Duration::from_millis(20);

/// Lower clamp for the per-peer estimated data exchange rate (bytes/second).
/// 100 KiB/s, roughly 0.8 Mbps.
pub const MIN_DATA_EXCHANGE_RATE: u64 = 100 * 1024;

/// Upper clamp for the per-peer estimated data exchange rate (bytes/second).
/// 100 Mbps expressed in bytes.
pub const MAX_DATA_EXCHANGE_RATE: u64 = 100 * 1024 * 1024 / 8;

/// Assumed data exchange rate for a peer before any measurement exists.
pub const DEFAULT_DATA_EXCHANGE_RATE: u64 = MIN_DATA_EXCHANGE_RATE;

/// Capacity of the per-peer message ordering intake channel.
pub const ORDERING_HEAP_CAPACITY: usize = 128;

/// Capacity of the inbound message wake-up channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the outbound send-completion channel.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Largest representable request modulator; larger peer counts saturate here.
pub const MAX_REQUEST_MODULATOR: u64 = 255;

/// Hard cap on an encoded transaction block message. Checked before decoding
/// to bound allocation on the receive path.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
