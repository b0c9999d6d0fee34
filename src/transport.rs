//! Task transport seam.
//!
//! The queue broker itself is an external collaborator; Mender only needs to
//! republish retried tasks to their originating queue and learn whether they
//! completed. [`TaskTransport`] is that seam. [`ChannelTransport`] is the
//! in-process implementation used by the binary and the tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::types::RetryMessage;

/// Completion result of a resubmitted task, as reported by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCompletion {
    /// The retried task finished successfully.
    Succeeded,
    /// The retried task failed again, with the new error text.
    Failed(String),
}

/// Errors produced by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport is closed and no longer accepts messages.
    #[error("transport is closed")]
    Closed,
    /// The broker rejected or could not deliver the message.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Outbound seam to the task queue.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    /// Publish a retry message to its originating queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be delivered.
    async fn submit(&self, message: RetryMessage) -> Result<(), TransportError>;

    /// Check whether a completion result has arrived for the given task.
    ///
    /// Consuming: a returned completion is removed, so a task id reports each
    /// completion exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is unreachable.
    async fn poll_result(&self, task_id: &str) -> Result<Option<TaskCompletion>, TransportError>;
}

/// In-process transport backed by an mpsc channel and a completion map.
///
/// Submitted messages land on the channel for the consuming side; the
/// consumer posts completions back with [`ChannelTransport::post_completion`].
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<RetryMessage>,
    completions: Arc<Mutex<HashMap<String, TaskCompletion>>>,
}

impl ChannelTransport {
    /// Create a transport and the receiving half of its submission channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RetryMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                completions: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Record a completion result for a task (consumer side).
    pub async fn post_completion(&self, task_id: &str, completion: TaskCompletion) {
        let mut completions = self.completions.lock().await;
        completions.insert(task_id.to_owned(), completion);
    }
}

#[async_trait]
impl TaskTransport for ChannelTransport {
    async fn submit(&self, message: RetryMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn poll_result(&self, task_id: &str) -> Result<Option<TaskCompletion>, TransportError> {
        let mut completions = self.completions.lock().await;
        Ok(completions.remove(task_id))
    }
}
