//! Wire format for the transaction sync exchange.
//!
//! A [`TransactionBlockMessage`] is the single framed message exchanged
//! between peers. All records are bincode-encoded with the standard
//! configuration and follow an omit-empty convention: an absent record is
//! equivalent to its zero value, and the optional Bloom filter is simply
//! omitted when empty. Byte-for-byte compatibility across implementations
//! sharing a network is required; `version` is the only evolution hinge.

use serde::{Deserialize, Serialize};
use spate_core::constants::MAX_MESSAGE_SIZE;
use spate_core::error::ExchangeError;
use spate_core::types::{Round, SignedTransaction};

/// Current transaction block message version.
pub const TXN_BLOCK_MESSAGE_VERSION: u8 = 1;

/// A residue-class filter over the low 64 bits of a transaction id.
///
/// The remote accepts ids satisfying `prefix64 mod modulator == offset`.
/// Modulator 0 means "send nothing"; modulator 1 means "send all".
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RequestParams {
    /// Residue the remote is interested in.
    pub offset: u8,
    /// Modulus of the residue class.
    pub modulator: u8,
}

/// Wire form of a Bloom filter summarizing the sender's pending pool.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct EncodedBloomFilter {
    /// Filter type tag; unknown tags fail decoding.
    pub filter_type: u8,
    /// The request params the filter was built against.
    pub encoding_params: RequestParams,
    /// Random seed mixed into the filter's hash functions.
    pub shuffler: u32,
    /// Number of bits in the filter.
    pub num_bits: u64,
    /// Number of hash functions.
    pub num_hashes: u32,
    /// Packed filter bits.
    pub filter: Vec<u8>,
}

/// The encoded transaction groups carried by a message.
///
/// Pool-local bookkeeping (group counters, origin flags) never crosses the
/// wire; each inner vector is one atomic group.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct PackedTransactionGroups {
    /// The groups, outermost order preserved.
    pub groups: Vec<Vec<SignedTransaction>>,
}

/// Timing block used for acknowledgement and bandwidth estimation.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TimingParams {
    /// Sequence number of the last message processed from the receiver.
    pub ref_seq: u32,
    /// Time the sender spent between receiving that message and responding,
    /// in nanoseconds.
    pub responder_elapsed_ns: u64,
    /// Minimum delay before the sender's next message, in nanoseconds. Grants
    /// the receiver a response window.
    pub next_min_delay_ns: u64,
}

/// The framed message exchanged between transaction sync peers.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq,
    bincode::Encode, bincode::Decode,
)]
pub struct TransactionBlockMessage {
    /// Message version; receivers reject anything but
    /// [`TXN_BLOCK_MESSAGE_VERSION`].
    pub version: u8,
    /// The sender's current round.
    pub round: Round,
    /// Optional summary of what the sender already holds.
    pub bloom: Option<EncodedBloomFilter>,
    /// What the sender wants the receiver to send back.
    pub updated_request_params: RequestParams,
    /// Pending transaction groups selected for the receiver.
    pub transaction_groups: PackedTransactionGroups,
    /// Acknowledgement and pacing information.
    pub msg_sync: TimingParams,
}

impl TransactionBlockMessage {
    /// Encode this message for transmission.
    pub fn encode(&self) -> Result<Vec<u8>, ExchangeError> {
        let buf = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ExchangeError::MessageTooLarge {
                size: buf.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(buf)
    }

    /// Decode a message, rejecting oversized payloads before deserialization
    /// and unsupported versions after.
    pub fn decode(data: &[u8]) -> Result<Self, ExchangeError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ExchangeError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let (msg, _): (Self, usize) =
            bincode::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        if msg.version != TXN_BLOCK_MESSAGE_VERSION {
            return Err(ExchangeError::UnsupportedVersion(msg.version));
        }
        Ok(msg)
    }

    /// Normalize the omit-empty convention: an attached filter that is empty
    /// is equivalent to no filter at all.
    pub fn normalize(mut self) -> Self {
        if let Some(bloom) = &self.bloom {
            if bloom.num_bits == 0 && bloom.filter.is_empty() {
                self.bloom = None;
            }
        }
        self
    }
}
