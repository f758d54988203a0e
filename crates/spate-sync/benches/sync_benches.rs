//! Criterion benchmarks for the sync engine hot paths: Bloom filter
//! construction and pending-transaction selection.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use spate_core::constants::ORDERING_HEAP_CAPACITY;
use spate_core::types::{NetworkPeer, SignedTransaction, SignedTxGroup};
use spate_sync::bloom::BloomFilter;
use spate_sync::peer::Peer;
use spate_sync::protocol::RequestParams;

/// Generate `n` deterministic single-transaction groups.
fn make_groups(n: u64) -> Vec<SignedTxGroup> {
    (0..n)
        .map(|i| SignedTxGroup {
            transactions: vec![SignedTransaction {
                version: 1,
                sender: [0xAA; 32],
                first_valid: 0,
                last_valid: 1_000,
                note: i.to_le_bytes().to_vec(),
                signature: vec![0u8; 64],
            }],
            group_counter: i,
            locally_originated: false,
        })
        .collect()
}

fn bench_bloom_build(c: &mut Criterion) {
    let pending = make_groups(1_000);
    let params = RequestParams { offset: 0, modulator: 1 };
    c.bench_function("bloom_build_1000", |b| {
        b.iter(|| BloomFilter::build(black_box(params), black_box(&pending), 7))
    });
}

fn bench_bloom_test(c: &mut Criterion) {
    let pending = make_groups(1_000);
    let params = RequestParams { offset: 0, modulator: 1 };
    let filter = BloomFilter::build(params, &pending, 7);
    let probe = pending[500].id().unwrap();
    c.bench_function("bloom_test", |b| {
        b.iter(|| filter.test(black_box(&probe)))
    });
}

fn bench_selection(c: &mut Criterion) {
    let pending = make_groups(2_000);
    c.bench_function("select_pending_2000", |b| {
        b.iter_batched(
            || {
                let mut peer =
                    Peer::new(NetworkPeer::new(()), false, ORDERING_HEAP_CAPACITY);
                peer.update_request_params(1, 0);
                peer
            },
            |mut peer| {
                peer.select_pending_transactions(
                    black_box(&pending),
                    Duration::from_millis(20),
                    0,
                )
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_bloom_build, bench_bloom_test, bench_selection);
criterion_main!(benches);
