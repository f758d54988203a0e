//! Core protocol types: transaction ids, signed transactions, groups, and the
//! opaque network peer handle.
//!
//! Rounds are plain `u64` ledger epoch counters; all numeric fields use u64
//! per protocol convention.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Ledger-assigned epoch counter. Monotonically nondecreasing; defines
/// transaction validity horizons.
pub type Round = u64;

/// A 32-byte transaction identifier (BLAKE3 of the canonical encoding).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    /// The zero id (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The first 8 bytes of the id interpreted as a little-endian u64.
    ///
    /// This is the value every residue-class (offset/modulator) computation
    /// operates on.
    pub fn prefix64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for TxId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for TxId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A signed transaction as carried by the sync protocol.
///
/// Validation and execution belong to the transaction pool; the sync engine
/// only needs stable ids and realistic encoded sizes.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SignedTransaction {
    /// Protocol version.
    pub version: u64,
    /// Sender public key bytes.
    pub sender: [u8; 32],
    /// First round at which this transaction is valid.
    pub first_valid: Round,
    /// Last round at which this transaction is valid.
    pub last_valid: Round,
    /// Arbitrary note payload.
    pub note: Vec<u8>,
    /// Ed25519 signature bytes.
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    /// Compute the transaction ID (BLAKE3 hash of the canonical encoding).
    pub fn id(&self) -> TxId {
        // bincode of a fully-owned struct cannot fail; fall back to the zero
        // id rather than propagating an impossible error.
        let encoded =
            bincode::encode_to_vec(self, bincode::config::standard()).unwrap_or_default();
        TxId(*blake3::hash(&encoded).as_bytes())
    }

    /// Length of the canonical encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|buf| buf.len())
            .unwrap_or(0)
    }
}

/// An ordered, non-empty bundle of signed transactions treated atomically.
///
/// The group id is the id of the first transaction. `group_counter` and
/// `locally_originated` are local pool bookkeeping and never cross the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTxGroup {
    /// The transactions in the group, in order. Never empty in a well-formed
    /// group; consumers skip empty groups defensively.
    pub transactions: Vec<SignedTransaction>,
    /// Monotonically increasing counter assigned by the local pool.
    pub group_counter: u64,
    /// Whether this group originated at the local node.
    pub locally_originated: bool,
}

impl SignedTxGroup {
    /// The group id: the id of the first transaction, or `None` for a
    /// malformed empty group.
    pub fn id(&self) -> Option<TxId> {
        self.transactions.first().map(SignedTransaction::id)
    }

    /// Total canonical encoded length of all transactions in the group.
    pub fn encoded_len(&self) -> usize {
        self.transactions.iter().map(SignedTransaction::encoded_len).sum()
    }
}

/// Opaque capability handle for a remote peer, owned by the transport layer.
///
/// The sync engine never looks inside: it clones, compares, and hashes these
/// by identity only. The transport recovers its own state via
/// [`downcast_ref`](NetworkPeer::downcast_ref).
#[derive(Clone)]
pub struct NetworkPeer(Arc<dyn Any + Send + Sync>);

impl NetworkPeer {
    /// Wrap a transport-owned value in an opaque handle.
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Recover the transport-owned value, if the type matches.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for NetworkPeer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for NetworkPeer {}

impl Hash for NetworkPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for NetworkPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkPeer({:#x})", self.key())
    }
}
