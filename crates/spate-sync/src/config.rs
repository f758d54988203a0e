//! Configuration for the transaction sync engine.

use std::time::Duration;

use spate_core::constants::{
    INBOUND_CHANNEL_CAPACITY, MESSAGE_TIME_WINDOW, ORDERING_HEAP_CAPACITY,
    OUTBOUND_CHANNEL_CAPACITY, SEND_MESSAGES_WINDOW,
};

/// Configuration for a [`TransactionSyncService`](crate::TransactionSyncService).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Whether this node is a relay. Relays request the full id space and
    /// drive their outgoing connections by responding to inbound traffic.
    pub is_relay: bool,
    /// Capacity of the inbound message wake-up channel.
    pub incoming_channel_capacity: usize,
    /// Capacity of the outbound send-completion channel.
    pub outgoing_channel_capacity: usize,
    /// Capacity of each peer's message ordering intake.
    pub ordering_heap_capacity: usize,
    /// Deadline for one batch of the send loop.
    pub send_messages_window: Duration,
    /// Nominal gap between back-to-back messages to the same peer; also the
    /// window converted into a per-message byte budget.
    pub message_time_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            is_relay: false,
            incoming_channel_capacity: INBOUND_CHANNEL_CAPACITY,
            outgoing_channel_capacity: OUTBOUND_CHANNEL_CAPACITY,
            ordering_heap_capacity: ORDERING_HEAP_CAPACITY,
            send_messages_window: SEND_MESSAGES_WINDOW,
            message_time_window: MESSAGE_TIME_WINDOW,
        }
    }
}

impl SyncConfig {
    /// Configuration preset for a relay node.
    pub fn relay() -> Self {
        Self {
            is_relay: true,
            ..Self::default()
        }
    }

    /// Configuration preset for a non-relay (participating) node.
    pub fn node() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_not_relay() {
        assert!(!SyncConfig::default().is_relay);
    }

    #[test]
    fn relay_preset_sets_flag_only() {
        let relay = SyncConfig::relay();
        let node = SyncConfig::node();
        assert!(relay.is_relay);
        assert!(!node.is_relay);
        assert_eq!(relay.incoming_channel_capacity, node.incoming_channel_capacity);
        assert_eq!(relay.message_time_window, node.message_time_window);
    }

    #[test]
    fn defaults_match_constants() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.incoming_channel_capacity, INBOUND_CHANNEL_CAPACITY);
        assert_eq!(cfg.outgoing_channel_capacity, OUTBOUND_CHANNEL_CAPACITY);
        assert_eq!(cfg.ordering_heap_capacity, ORDERING_HEAP_CAPACITY);
        assert_eq!(cfg.send_messages_window, SEND_MESSAGES_WINDOW);
        assert_eq!(cfg.message_time_window, MESSAGE_TIME_WINDOW);
    }
}
