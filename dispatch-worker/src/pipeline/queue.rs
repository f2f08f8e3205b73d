//! Bounded FIFO buffer between intake and the rate-limited dispatcher.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::SendRequest;

/// Returned by [`DispatchQueue::enqueue`] once the pipeline is shutting
/// down. The request is handed back so the caller can log it.
#[derive(Debug, Error)]
#[error("dispatch queue closed")]
pub struct QueueClosed(pub SendRequest);

/// Result of waiting on the queue.
#[derive(Debug)]
pub enum Dequeued {
    Item(SendRequest),
    Shutdown,
}

/// Producer handle. Cheap to clone; intake and the durable-queue poller
/// each hold one.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<SendRequest>,
    shutdown: CancellationToken,
}

/// Consumer half, owned by the dispatcher.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<SendRequest>,
    shutdown: CancellationToken,
}

/// Create a queue holding at most `capacity` requests.
pub fn dispatch_queue(
    capacity: usize,
    shutdown: CancellationToken,
) -> (DispatchQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        DispatchQueue {
            tx,
            shutdown: shutdown.clone(),
        },
        QueueReceiver { rx, shutdown },
    )
}

impl DispatchQueue {
    /// Append a request, waiting while the queue is full.
    ///
    /// Fails instead of waiting forever once shutdown has begun.
    pub async fn enqueue(&self, request: SendRequest) -> Result<(), QueueClosed> {
        if self.shutdown.is_cancelled() {
            return Err(QueueClosed(request));
        }

        let permit = tokio::select! {
            permit = self.tx.reserve() => permit,
            _ = self.shutdown.cancelled() => return Err(QueueClosed(request)),
        };

        match permit {
            Ok(permit) => {
                permit.send(request);
                Ok(())
            }
            Err(_) => Err(QueueClosed(request)),
        }
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

impl QueueReceiver {
    /// Wait for the next request, or for shutdown.
    ///
    /// Cancel safe: dropping the future never loses a request.
    pub async fn dequeue(&mut self) -> Dequeued {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Dequeued::Shutdown,
            item = self.rx.recv() => match item {
                Some(request) => Dequeued::Item(request),
                None => Dequeued::Shutdown,
            },
        }
    }

    /// Close the queue to new requests and take whatever is still buffered,
    /// in FIFO order.
    pub async fn close_and_drain(&mut self) -> Vec<SendRequest> {
        self.rx.close();
        let mut remaining = Vec::new();
        while let Some(request) = self.rx.recv().await {
            remaining.push(request);
        }
        remaining
    }
}
