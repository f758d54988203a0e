//! Per-peer reassembly of inbound messages by sequence number.
//!
//! The transport delivers messages on its own thread; the main loop consumes
//! them strictly in sequence order. The two sides never touch the heap
//! concurrently: producers enqueue through a bounded intake channel, and the
//! consumer drains the channel into a min-heap before any peek or pop. The
//! bounded channel is load-bearing for backpressure — a full intake is a
//! hard error and the transport is expected to disconnect the peer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::mpsc;

use spate_core::error::OrderingError;
use crate::protocol::TransactionBlockMessage;

/// One inbound message waiting for its turn.
#[derive(Clone, Debug)]
pub struct MessageHeapItem {
    /// Transport-assigned sequence number.
    pub seq: u64,
    /// The decoded message.
    pub message: TransactionBlockMessage,
    /// Size of the encoded form, for bandwidth accounting.
    pub encoded_size: usize,
}

// Min-heap ordering by sequence number only.
struct HeapEntry(MessageHeapItem);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the smallest seq on top
        other.0.seq.cmp(&self.0.seq)
    }
}

/// Reassembles a peer's inbound messages into sequence order.
pub struct MessageOrderingHeap {
    intake_tx: mpsc::Sender<MessageHeapItem>,
    intake_rx: mpsc::Receiver<MessageHeapItem>,
    heap: BinaryHeap<HeapEntry>,
}

impl MessageOrderingHeap {
    /// Create a heap whose intake holds at most `capacity` pending messages.
    pub fn new(capacity: usize) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(capacity);
        Self {
            intake_tx,
            intake_rx,
            heap: BinaryHeap::new(),
        }
    }

    /// A producer-side handle for the transport thread.
    pub fn intake(&self) -> mpsc::Sender<MessageHeapItem> {
        self.intake_tx.clone()
    }

    /// Enqueue a message from the transport side.
    ///
    /// Never blocks; returns [`OrderingError::Capacity`] when the intake is
    /// full.
    pub fn enqueue(
        &self,
        message: TransactionBlockMessage,
        seq: u64,
        encoded_size: usize,
    ) -> Result<(), OrderingError> {
        self.intake_tx
            .try_send(MessageHeapItem {
                seq,
                message,
                encoded_size,
            })
            .map_err(|_| OrderingError::Capacity)
    }

    fn flush(&mut self) {
        while let Ok(item) = self.intake_rx.try_recv() {
            self.heap.push(HeapEntry(item));
        }
    }

    /// Sequence number of the lowest-seq pending message.
    pub fn peek_seq(&mut self) -> Result<u64, OrderingError> {
        self.flush();
        self.heap
            .peek()
            .map(|entry| entry.0.seq)
            .ok_or(OrderingError::Empty)
    }

    /// Remove and return the lowest-seq pending message.
    pub fn pop(&mut self) -> Result<MessageHeapItem, OrderingError> {
        self.flush();
        self.heap.pop().map(|entry| entry.0).ok_or(OrderingError::Empty)
    }

    /// Number of messages currently held (after draining the intake).
    pub fn len(&mut self) -> usize {
        self.flush();
        self.heap.len()
    }

    /// Whether no messages are pending.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}
