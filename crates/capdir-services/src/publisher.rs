//! Publish worker: forwards registrations and removals to the remote
//! directory one at a time, in the order they were queued.
//!
//! The directory queues an operation while it still holds its mutation lock,
//! so the backend sees a participant's add and remove in call order even when
//! an earlier call is slow.

use std::sync::Arc;

use tokio::sync::mpsc;

use capdir_core::GlobalDiscoveryEntry;

use crate::remote::RemoteDirectory;

#[derive(Debug)]
pub(crate) enum RemoteOp {
    Add(GlobalDiscoveryEntry),
    Remove(Vec<String>),
}

/// Sending half, held by the directory.
pub(crate) struct Publisher {
    op_tx: mpsc::UnboundedSender<RemoteOp>,
}

impl Publisher {
    /// Spawn the worker on `runtime`. It exits once the publisher is dropped
    /// and the queue has drained.
    pub(crate) fn start(
        remote: Arc<dyn RemoteDirectory>,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        runtime.spawn(PublishWorker { remote, op_rx }.run());
        Self { op_tx }
    }

    pub(crate) fn add(&self, entry: GlobalDiscoveryEntry) {
        self.enqueue(RemoteOp::Add(entry));
    }

    pub(crate) fn remove(&self, participant_ids: Vec<String>) {
        if !participant_ids.is_empty() {
            self.enqueue(RemoteOp::Remove(participant_ids));
        }
    }

    fn enqueue(&self, op: RemoteOp) {
        if let Err(e) = self.op_tx.send(op) {
            tracing::warn!(op = ?e.0, "publish worker gone, backend update dropped");
        }
    }
}

struct PublishWorker {
    remote: Arc<dyn RemoteDirectory>,
    op_rx: mpsc::UnboundedReceiver<RemoteOp>,
}

impl PublishWorker {
    async fn run(mut self) -> anyhow::Result<()> {
        while let Some(op) = self.op_rx.recv().await {
            self.apply(op).await;
        }
        tracing::debug!("publisher dropped, publish worker exiting");
        Ok(())
    }

    async fn apply(&self, op: RemoteOp) {
        match op {
            RemoteOp::Add(entry) => {
                let participant_id = entry.entry.participant_id.clone();
                if let Err(e) = self.remote.add(entry).await {
                    tracing::warn!(error = %e, %participant_id, "remote registration failed");
                }
            }
            RemoteOp::Remove(participant_ids) => {
                if let Err(e) = self.remote.remove(&participant_ids).await {
                    tracing::warn!(error = %e, count = participant_ids.len(), "remote removal failed");
                }
            }
        }
    }
}
