//! The outcome stream between delivery tasks and the result aggregator.

use tokio::sync::mpsc;
use tracing::error;

use crate::model::{DeliveryOutcome, RequestId};

/// Detail recorded when a delivery task goes away without reporting.
pub const LOST_OUTCOME: &str = "delivery task ended without an outcome";

/// Create the unbounded outcome channel.
pub fn outcome_stream() -> (OutcomeSender, OutcomeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutcomeSender { tx }, OutcomeReceiver { rx })
}

/// Append-only producer handle.
#[derive(Debug, Clone)]
pub struct OutcomeSender {
    tx: mpsc::UnboundedSender<DeliveryOutcome>,
}

impl OutcomeSender {
    pub fn emit(&self, outcome: DeliveryOutcome) {
        if let Err(mpsc::error::SendError(outcome)) = self.tx.send(outcome) {
            error!(
                request_id = outcome.request_id(),
                status = %outcome.status(),
                "outcome_stream_closed"
            );
        }
    }

    /// Reserve the single outcome owed for `request_id`.
    pub fn pending(&self, request_id: RequestId) -> PendingOutcome {
        PendingOutcome {
            request_id,
            sender: Some(self.clone()),
        }
    }
}

/// Consumer half, owned by the aggregator.
#[derive(Debug)]
pub struct OutcomeReceiver {
    rx: mpsc::UnboundedReceiver<DeliveryOutcome>,
}

impl OutcomeReceiver {
    /// Next outcome, or `None` once every sender is gone and the stream
    /// is empty.
    pub async fn recv(&mut self) -> Option<DeliveryOutcome> {
        self.rx.recv().await
    }
}

/// An outcome that must be reported exactly once.
///
/// If the holder is dropped before [`resolve`](Self::resolve), for example
/// because the task panicked or was torn down, a `failed` outcome is
/// emitted in its place.
#[derive(Debug)]
pub struct PendingOutcome {
    request_id: RequestId,
    sender: Option<OutcomeSender>,
}

impl PendingOutcome {
    pub fn resolve(mut self, outcome: DeliveryOutcome) {
        debug_assert_eq!(outcome.request_id(), self.request_id);
        if let Some(sender) = self.sender.take() {
            sender.emit(outcome);
        }
    }
}

impl Drop for PendingOutcome {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            error!(request_id = self.request_id, "delivery_outcome_lost");
            sender.emit(DeliveryOutcome::failed(self.request_id, LOST_OUTCOME));
        }
    }
}
