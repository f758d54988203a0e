//! Shared builders for emulator and property tests.

use spate_core::types::{SignedTransaction, SignedTxGroup};

/// A signed transaction with a note of `note_size` deterministic bytes.
pub fn make_transaction(seed: u64, note_size: usize, last_valid: u64) -> SignedTransaction {
    let mut note = Vec::with_capacity(note_size);
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
    for _ in 0..note_size {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        note.push(state as u8);
    }
    SignedTransaction {
        version: 1,
        sender: [(seed % 251) as u8; 32],
        first_valid: 0,
        last_valid,
        note,
        signature: vec![0u8; 64],
    }
}

/// A single-transaction group.
pub fn make_group(seed: u64, note_size: usize, last_valid: u64) -> SignedTxGroup {
    SignedTxGroup {
        transactions: vec![make_transaction(seed, note_size, last_valid)],
        group_counter: 0,
        locally_originated: false,
    }
}
