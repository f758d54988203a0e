//! Bloom filter construction over the pending transaction pool.
//!
//! Each outgoing message may carry a filter summarizing the ids the local
//! node already holds, restricted to the residue class the message requests.
//! The receiver tests candidate ids against recent filters to avoid sending
//! transactions the remote already has.
//!
//! Membership hashing uses double hashing: two 64-bit values are taken from
//! SHA-256 over the seed and the id, and probe `i` lands on
//! `(h1 + i * h2) mod num_bits`.

use sha2::{Digest, Sha256};
use spate_core::constants::BLOOM_FALSE_POSITIVE_RATE;
use spate_core::error::FilterError;
use spate_core::types::{SignedTxGroup, TxId};
use crate::protocol::{EncodedBloomFilter, RequestParams};

/// Filter type tag for the double-hashing filter. Tag 0 is reserved for
/// "absent" so a zero-valued record never decodes as a valid filter.
pub const MULTI_HASH_FILTER_TYPE: u8 = 1;

/// Upper bound on decoded filter size (bits). Caps allocation when decoding
/// a hostile filter record.
const MAX_FILTER_BITS: u64 = 1 << 26; // 8 MiB of bits

/// A probabilistic membership summary of a set of transaction ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BloomFilter {
    encoding_params: RequestParams,
    seed: u32,
    num_bits: u64,
    num_hashes: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Build a filter over the pending pool for the given request params.
    ///
    /// Modulator 0 yields an empty filter (the remote asked for nothing);
    /// modulator 1 covers every group id; larger modulators cover only the
    /// matching residue class.
    pub fn build(params: RequestParams, pending: &[SignedTxGroup], seed: u32) -> Self {
        if params.modulator == 0 {
            return Self {
                encoding_params: params,
                seed,
                ..Self::default()
            };
        }

        let ids: Vec<TxId> = pending
            .iter()
            .filter_map(SignedTxGroup::id)
            .filter(|id| {
                params.modulator == 1
                    || id.prefix64() % u64::from(params.modulator) == u64::from(params.offset)
            })
            .collect();

        if ids.is_empty() {
            return Self {
                encoding_params: params,
                seed,
                ..Self::default()
            };
        }

        let (num_bits, num_hashes) = optimal(ids.len(), BLOOM_FALSE_POSITIVE_RATE);
        let mut filter = Self {
            encoding_params: params,
            seed,
            num_bits,
            num_hashes,
            bits: vec![0u8; ((num_bits + 7) / 8) as usize],
        };
        for id in &ids {
            filter.set(id);
        }
        filter
    }

    /// Whether the filter covers no ids at all. Empty filters are never
    /// attached to outgoing messages.
    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// The request params this filter was built against.
    pub fn encoding_params(&self) -> RequestParams {
        self.encoding_params
    }

    fn set(&mut self, id: &TxId) {
        let (h1, h2) = self.hash_pair(id);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Probabilistic membership test. False positives occur at roughly the
    /// configured rate; false negatives never.
    pub fn test(&self, id: &TxId) -> bool {
        if self.num_bits == 0 {
            return false;
        }
        let (h1, h2) = self.hash_pair(id);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    fn hash_pair(&self, id: &TxId) -> (u64, u64) {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(id.as_bytes());
        let digest = hasher.finalize();
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[..8]);
        h2.copy_from_slice(&digest[8..16]);
        // force the stride odd so probes don't collapse onto a short cycle
        (u64::from_le_bytes(h1), u64::from_le_bytes(h2) | 1)
    }

    /// Encode for transmission.
    pub fn encode(&self) -> EncodedBloomFilter {
        EncodedBloomFilter {
            filter_type: MULTI_HASH_FILTER_TYPE,
            encoding_params: self.encoding_params,
            shuffler: self.seed,
            num_bits: self.num_bits,
            num_hashes: self.num_hashes,
            filter: self.bits.clone(),
        }
    }

    /// Decode a received filter record.
    pub fn decode(enc: &EncodedBloomFilter) -> Result<Self, FilterError> {
        if enc.filter_type != MULTI_HASH_FILTER_TYPE {
            return Err(FilterError::InvalidEncoding(enc.filter_type));
        }
        if enc.num_bits > MAX_FILTER_BITS {
            return Err(FilterError::MalformedPayload(format!(
                "filter too large: {} bits",
                enc.num_bits
            )));
        }
        if enc.filter.len() as u64 != (enc.num_bits + 7) / 8 {
            return Err(FilterError::MalformedPayload(format!(
                "bit length mismatch: {} bytes for {} bits",
                enc.filter.len(),
                enc.num_bits
            )));
        }
        if enc.num_bits > 0 && enc.num_hashes == 0 {
            return Err(FilterError::MalformedPayload(
                "zero hash functions".to_string(),
            ));
        }
        Ok(Self {
            encoding_params: enc.encoding_params,
            seed: enc.shuffler,
            num_bits: enc.num_bits,
            num_hashes: enc.num_hashes,
            bits: enc.filter.clone(),
        })
    }
}

/// Standard optimal Bloom filter geometry for `n` elements at false-positive
/// rate `fp`: `m = -n ln(fp) / (ln 2)^2`, `k = (m / n) ln 2`.
pub fn optimal(n: usize, fp: f64) -> (u64, u32) {
    if n == 0 {
        return (0, 0);
    }
    let ln2 = std::f64::consts::LN_2;
    let m = (-(n as f64) * fp.ln() / (ln2 * ln2)).ceil().max(8.0);
    let k = ((m / n as f64) * ln2).round().max(1.0);
    (m as u64, k as u32)
}
