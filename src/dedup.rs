// Deduplicating message sender
//
// Every outbound message carries a `deduplicate_by` key; its truncated
// hash must be absent from the persisted store at the moment of send.
// A failed transport send rolls the hash back so a retry can pass.

use crate::clock::Clock;
use crate::config::Options;
use crate::digest::dedup_hash;
use crate::error::{Error, Result};
use crate::probe::PersistedHashes;
use crate::scheduler::{JobHandler, JobRequest};
use crate::transport::{OutboundMessage, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Job type the sender is registered under.
pub const SEND_MESSAGE_JOB: &str = "send-message";

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Duplicate,
}

/// Armed dedup entry; dropping it keeps the hash, `rollback` removes it.
pub struct SendGuard {
    hashes: Arc<PersistedHashes>,
    hash: String,
}

impl SendGuard {
    pub async fn rollback(self) {
        self.hashes.remove(&self.hash).await;
    }
}

/// Checks and records message hashes.
pub struct DuplicateDetector {
    hashes: Arc<PersistedHashes>,
}

impl DuplicateDetector {
    pub fn new(hashes: Arc<PersistedHashes>) -> Self {
        Self { hashes }
    }

    /// Arm the hash for `deduplicate_by`. `None` means the message was
    /// already sent and must be dropped.
    pub async fn try_send(&self, deduplicate_by: &str) -> Option<SendGuard> {
        let hash = dedup_hash(deduplicate_by);
        if !self.hashes.insert(&hash).await {
            return None;
        }
        Some(SendGuard {
            hashes: self.hashes.clone(),
            hash,
        })
    }
}

/// The `send-message` scheduler handler: dedup check, envelope, transport.
pub struct MessageSender {
    detector: DuplicateDetector,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    options: Options,
}

impl MessageSender {
    pub fn new(
        options: Options,
        detector: DuplicateDetector,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            detector,
            transport,
            clock,
            options,
        }
    }

    pub async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome> {
        let guard = match &message.deduplicate_by {
            Some(key) => match self.detector.try_send(key).await {
                Some(guard) => Some(guard),
                None => {
                    tracing::debug!(action = %message.action, "dropping duplicate message");
                    return Ok(SendOutcome::Duplicate);
                }
            },
            None => None,
        };

        let body = message.envelope(&self.options, &self.clock.day());
        match self.transport.send(body).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(err) => {
                // Re-arm the hash so the scheduler retry is not treated
                // as a duplicate.
                if let Some(guard) = guard {
                    guard.rollback().await;
                }
                Err(Error::transient(format!("transport send failed: {err:#}")))
            }
        }
    }
}

#[async_trait]
impl JobHandler for MessageSender {
    async fn run(&self, args: Value) -> Result<Vec<JobRequest>> {
        let message: OutboundMessage = serde_json::from_value(args)
            .map_err(|err| Error::BadJob(format!("malformed outbound message: {err}")))?;
        self.send(&message).await?;
        Ok(Vec::new())
    }
}
