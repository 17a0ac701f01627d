use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use slipcheck_core::{JobId, JobStatus, VerificationResult};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    Closed,
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Box<VerificationResult>),
    Error(String),
}

/// Fired once per job after its terminal state has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: JobId,
    pub status: JobStatus,
    pub outcome: Outcome,
}

/// Best-effort outbound delivery. Errors are logged by the queue, never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes each notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) -> Result<(), NotifyError> {
        match &n.outcome {
            Outcome::Result(r) => tracing::info!(
                job_id = %n.id,
                status = %n.status,
                matched = ?r.transaction_match,
                amount_match = ?r.amount_match,
                "Slip verified"
            ),
            Outcome::Error(e) => tracing::warn!(job_id = %n.id, status = %n.status, error = %e, "Slip failed"),
        }
        Ok(())
    }
}

/// Pushes notifications to an in-process subscriber.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.send(notification).map_err(|_| NotifyError::Closed)
    }
}
