//! Hand-off of accepted submissions to the downstream pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::submission::{Platform, Submission};

/// Record handed to the downstream content pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedSubmission {
    /// Explicit owner from the payload, else the sender.
    pub owner: String,
    pub sender: String,
    pub platform: Platform,
    pub account_id: Option<String>,
    pub username: Option<String>,
    pub verification_post_id: Option<String>,
    pub post_id: Option<String>,
    pub interaction_id: Option<String>,
    pub message_id: String,
    /// Unix seconds.
    pub received_at: u64,
    pub from_gossip: bool,
}

impl QueuedSubmission {
    pub fn new(
        submission: Submission,
        sender: &str,
        message_id: &str,
        received_at_millis: u64,
        from_gossip: bool,
    ) -> Self {
        let owner = submission.owner().unwrap_or(sender).to_string();
        Self {
            owner,
            sender: sender.to_string(),
            platform: submission.platform,
            account_id: submission.account_id,
            username: submission.username,
            verification_post_id: submission.verification_post_id,
            post_id: submission.post_id,
            interaction_id: submission.interaction_id,
            message_id: message_id.to_string(),
            received_at: received_at_millis / 1000,
            from_gossip,
        }
    }

    pub fn source(&self) -> &'static str {
        if self.from_gossip {
            "gossip"
        } else {
            "direct"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("submission queue is full")]
    Full,
    #[error("submission queue is closed")]
    Closed,
}

#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn enqueue(&self, submission: QueuedSubmission) -> Result<(), SinkError>;

    /// Submissions waiting to be consumed.
    fn depth(&self) -> usize;
}

/// Bounded in-process queue. Never waits for room.
pub struct ChannelSink {
    tx: mpsc::Sender<QueuedSubmission>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedSubmission>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SubmissionSink for ChannelSink {
    async fn enqueue(&self, submission: QueuedSubmission) -> Result<(), SinkError> {
        self.tx.try_send(submission).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}
