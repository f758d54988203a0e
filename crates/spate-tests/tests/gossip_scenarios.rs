//! End-to-end gossip scenarios over the emulated network.
//!
//! Each scenario wires a small topology, seeds a pool, drives rounds over
//! 8.5 emulated seconds, and asserts that every node's pool converged to
//! the seeded contents. All run on tokio's paused clock.

use std::time::Duration;

use spate_core::types::SignedTxGroup;
use spate_tests::emulator::{Emulator, NodeSpec};
use spate_tests::helpers::make_group;

const LINK_RATE: u64 = 1_000_000; // 1 MB/s, symmetric
const TEST_DURATION: Duration = Duration::from_millis(8_500);
const ROUND_INTERVAL: Duration = Duration::from_secs(4);

/// Assert a pool holds exactly one group with the given shape.
fn assert_single_group(pool: &[SignedTxGroup], note_size: usize, last_valid: u64, who: &str) {
    assert_eq!(pool.len(), 1, "{who}: expected exactly one group, got {}", pool.len());
    let tx = &pool[0].transactions[0];
    assert_eq!(tx.note.len(), note_size, "{who}: wrong note size");
    assert_eq!(tx.last_valid, last_valid, "{who}: wrong expiration round");
}

// ======================================================================
// S1: non-relay seeds one group; it reaches the relay it dials into.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn non_relay_to_relay_exchange() {
    spate_tests::init_tracing();
    let mut emulator = Emulator::start(&[
        NodeSpec { name: "relay", is_relay: true, outgoing: vec![] },
        NodeSpec { name: "node", is_relay: false, outgoing: vec![(0, LINK_RATE)] },
    ]);

    emulator.seed(1, 1, 250, 5);
    emulator.run(ROUND_INTERVAL, TEST_DURATION).await;

    assert_single_group(&emulator.pool(0), 250, 5, "relay");
    assert_single_group(&emulator.pool(1), 250, 5, "node");

    let errors = emulator.shutdown().await;
    assert!(errors.is_empty(), "transport errors: {errors:?}");
}

// ======================================================================
// S2: the relay seeds; the group flows down to the dialing non-relay.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn relay_to_non_relay_exchange() {
    let mut emulator = Emulator::start(&[
        NodeSpec { name: "relay", is_relay: true, outgoing: vec![] },
        NodeSpec { name: "node", is_relay: false, outgoing: vec![(0, LINK_RATE)] },
    ]);

    emulator.seed(0, 1, 250, 5);
    emulator.run(ROUND_INTERVAL, TEST_DURATION).await;

    assert_single_group(&emulator.pool(0), 250, 5, "relay");
    assert_single_group(&emulator.pool(1), 250, 5, "node");

    let errors = emulator.shutdown().await;
    assert!(errors.is_empty(), "transport errors: {errors:?}");
}

// ======================================================================
// S3: relay-to-relay over an outgoing link, seeded on the dialing side.
// The outgoing relay only ever responds, so the group travels inside a
// response window.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn outgoing_relay_to_relay_exchange() {
    let mut emulator = Emulator::start(&[
        NodeSpec { name: "incoming-relay", is_relay: true, outgoing: vec![] },
        NodeSpec { name: "outgoing-relay", is_relay: true, outgoing: vec![(0, LINK_RATE)] },
    ]);

    emulator.seed(1, 1, 250, 5);
    emulator.run(ROUND_INTERVAL, TEST_DURATION).await;

    assert_single_group(&emulator.pool(0), 250, 5, "incoming-relay");
    assert_single_group(&emulator.pool(1), 250, 5, "outgoing-relay");

    let errors = emulator.shutdown().await;
    assert!(errors.is_empty(), "transport errors: {errors:?}");
}

// ======================================================================
// S3b: same topology, seeded on the incoming side.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn incoming_relay_to_relay_exchange() {
    let mut emulator = Emulator::start(&[
        NodeSpec { name: "incoming-relay", is_relay: true, outgoing: vec![] },
        NodeSpec { name: "outgoing-relay", is_relay: true, outgoing: vec![(0, LINK_RATE)] },
    ]);

    emulator.seed(0, 1, 250, 5);
    emulator.run(ROUND_INTERVAL, TEST_DURATION).await;

    assert_single_group(&emulator.pool(0), 250, 5, "incoming-relay");
    assert_single_group(&emulator.pool(1), 250, 5, "outgoing-relay");

    let errors = emulator.shutdown().await;
    assert!(errors.is_empty(), "transport errors: {errors:?}");
}

// ======================================================================
// S4: fan-in across two relays. A group seeded at a leaf node must cross
// its relay, the relay-to-relay link, and reach the far leaf.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn fan_in_across_two_relays() {
    let mut emulator = Emulator::start(&[
        NodeSpec { name: "relay1", is_relay: true, outgoing: vec![] },
        NodeSpec { name: "relay2", is_relay: true, outgoing: vec![(0, LINK_RATE)] },
        NodeSpec { name: "node1", is_relay: false, outgoing: vec![(0, LINK_RATE)] },
        NodeSpec { name: "node2", is_relay: false, outgoing: vec![(1, LINK_RATE)] },
    ]);

    emulator.seed(2, 1, 250, 5);
    emulator.run(ROUND_INTERVAL, TEST_DURATION).await;

    for (index, name) in ["relay1", "relay2", "node1", "node2"].iter().enumerate() {
        assert_single_group(&emulator.pool(index), 250, 5, name);
    }

    let errors = emulator.shutdown().await;
    assert!(errors.is_empty(), "transport errors: {errors:?}");
}

// ======================================================================
// S5: duplicate delivery is suppressed by the pool, not amplified.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_is_suppressed() {
    let emulator = Emulator::start(&[NodeSpec {
        name: "solo",
        is_relay: false,
        outgoing: vec![],
    }]);

    let group = make_group(42, 250, 5);
    assert!(emulator.node(0).add_to_pool(group.clone(), false));
    assert!(!emulator.node(0).add_to_pool(group, false));
    assert_eq!(emulator.pool(0).len(), 1, "pool must hold a single copy");

    emulator.shutdown().await;
}

// ======================================================================
// Bandwidth: a slow link still converges, just later.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn slow_link_still_converges() {
    let mut emulator = Emulator::start(&[
        NodeSpec { name: "relay", is_relay: true, outgoing: vec![] },
        NodeSpec { name: "node", is_relay: false, outgoing: vec![(0, 20_000)] },
    ]);

    emulator.seed(1, 1, 250, 5);
    emulator.run(ROUND_INTERVAL, TEST_DURATION).await;

    assert_single_group(&emulator.pool(0), 250, 5, "relay");

    let errors = emulator.shutdown().await;
    assert!(errors.is_empty(), "transport errors: {errors:?}");
}

// ======================================================================
// Larger seed: many groups cross under the per-message byte budget by
// spreading across successive messages. A longer horizon lets groups that
// an unlucky filter false-positive temporarily suppressed come through
// once the filter history rotates out.
// ======================================================================

#[tokio::test(start_paused = true)]
async fn many_groups_converge_across_messages() {
    let mut emulator = Emulator::start(&[
        NodeSpec { name: "relay", is_relay: true, outgoing: vec![] },
        NodeSpec { name: "node", is_relay: false, outgoing: vec![(0, LINK_RATE)] },
    ]);

    emulator.seed(1, 40, 500, 99);
    emulator.run(ROUND_INTERVAL, Duration::from_millis(16_500)).await;

    assert_eq!(emulator.pool(0).len(), 40, "relay should hold every seeded group");
    assert_eq!(emulator.pool(1).len(), 40);

    let errors = emulator.shutdown().await;
    assert!(errors.is_empty(), "transport errors: {errors:?}");
}
