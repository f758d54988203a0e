//! # spate-sync — transaction gossip engine.
//!
//! A single-threaded cooperative state machine that propagates pending
//! transaction groups between nodes and relays with bounded bandwidth,
//! adaptive pacing, and probabilistic duplicate suppression.
//!
//! The engine is transport-agnostic: it consumes opaque
//! [`NetworkPeer`](spate_core::types::NetworkPeer) handles and a non-blocking
//! send primitive supplied by the embedding node through the
//! [`NodeConnector`] trait. The main entry point is
//! [`TransactionSyncService::start`], which spawns the main loop task and
//! returns a handle exposing the transport-facing
//! [`IncomingMessageHandler`].

pub mod bloom;
pub mod clock;
pub mod config;
pub mod incoming;
pub mod interfaces;
pub mod mainloop;
pub mod ordering;
pub mod outgoing;
pub mod peer;
pub mod protocol;
pub mod recent;
pub mod scheduler;
pub mod service;

pub use config::SyncConfig;
pub use incoming::IncomingMessageHandler;
pub use interfaces::{Event, NodeConnector, PeerInfo, RoundSettings, SyncPeerHandle};
pub use mainloop::beta;
pub use service::TransactionSyncService;
