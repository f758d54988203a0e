//! Service wrapper: owns the main-loop task and its stop signal.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::SyncConfig;
use crate::incoming::IncomingMessageHandler;
use crate::interfaces::NodeConnector;
use crate::mainloop::SyncState;

/// Handle to a running transaction sync engine.
///
/// Created with [`start`](TransactionSyncService::start), which spawns the
/// main loop on the current tokio runtime. Dropping the handle without
/// calling [`stop`](TransactionSyncService::stop) also shuts the loop down,
/// but without waiting for it to finish.
pub struct TransactionSyncService {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    incoming_handler: IncomingMessageHandler,
}

impl TransactionSyncService {
    /// Start the sync engine against `node`. Must be called from within a
    /// tokio runtime.
    pub fn start<N: NodeConnector>(node: N, config: SyncConfig) -> Self {
        let (state, incoming_handler) = SyncState::new(node, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(state.run(shutdown_rx));
        Self {
            shutdown_tx,
            task,
            incoming_handler,
        }
    }

    /// The transport-facing inbound message handler. Cloneable; hand one to
    /// each transport dispatch thread.
    pub fn incoming_handler(&self) -> IncomingMessageHandler {
        self.incoming_handler.clone()
    }

    /// Signal the main loop to stop and wait for it to exit. In-flight sends
    /// complete naturally on the transport; their callbacks are ignored.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(%err, "txsync: main loop task ended abnormally");
        }
    }
}
