//! Batch task queue.
//!
//! An in-process mediator between batch creation and batch processing.
//! The queue is volatile by design: it is rebuilt from the state store
//! by the resume controller after a restart, so losing it is never a
//! correctness problem. Delivery is at-least-once; the store's claim
//! operation makes redelivery harmless.

use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// One unit of dispatch: "there is work for this batch".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTask {
    pub job_id: Uuid,
    pub batch_id: Uuid,
}

/// Unbounded in-process task queue shared by all workers.
pub struct BatchQueue {
    tx: UnboundedSender<BatchTask>,
    rx: Mutex<UnboundedReceiver<BatchTask>>,
}

impl Default for BatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Push a task.
    pub fn enqueue(&self, task: BatchTask) -> Result<()> {
        self.tx.send(task).map_err(|_| PipelineError::Cancelled)
    }

    /// Push a task after a delay without occupying a worker.
    ///
    /// This is how retry backoff sleeps: the batch has already been
    /// returned to pending, and the timer fires on the runtime rather
    /// than inside a worker slot.
    pub fn enqueue_after(&self, task: BatchTask, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the pipeline shut down; nothing to do.
            let _ = tx.send(task);
        });
    }

    /// Pop the next task, waiting while the queue is empty.
    pub async fn dequeue(&self) -> Option<BatchTask> {
        self.rx.lock().await.recv().await
    }

    /// Pop a task if one is immediately available.
    pub async fn try_dequeue(&self) -> Option<BatchTask> {
        self.rx.lock().await.try_recv().ok()
    }
}
