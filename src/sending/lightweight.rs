use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use super::retry::{requeue, RetryAgent};
use super::{address_envelope, SendingAgent, SendingContext};
use crate::envelope::{Envelope, OutgoingMessageBatch};
use crate::error::BusError;
use crate::transport::{BatchedSender, SenderCallback};

/// Fire-and-forget delivery. Failed envelopes are retried from memory up
/// to the attempt ceiling and then discarded.
pub struct LightweightSendingAgent {
    destination: Url,
    sender: Arc<BatchedSender>,
    reply_uri: Option<Url>,
}

impl LightweightSendingAgent {
    /// Wire the retry callback into `sender` and start it.
    pub fn start(
        sender: Arc<BatchedSender>,
        reply_uri: Option<Url>,
        context: &SendingContext,
    ) -> Arc<Self> {
        let destination = sender.destination().clone();
        sender.start(Arc::new(LightweightCallback {
            sender: Arc::downgrade(&sender),
            retry: RetryAgent::new(destination.clone(), &context.settings, context.cancel.clone()),
            max_attempts: context.settings.max_attempts.max(1),
        }));
        Arc::new(Self {
            destination,
            sender,
            reply_uri,
        })
    }
}

#[async_trait]
impl SendingAgent for LightweightSendingAgent {
    fn destination(&self) -> &Url {
        &self.destination
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn latched(&self) -> bool {
        self.sender.latched()
    }

    fn queued_count(&self) -> usize {
        self.sender.queued_count()
    }

    fn default_reply_uri(&self) -> Option<&Url> {
        self.reply_uri.as_ref()
    }

    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<(), BusError> {
        let envelope = address_envelope(envelope, &self.destination, self.reply_uri.as_ref());
        self.sender.enqueue(envelope).await
    }

    async fn store_and_forward(&self, envelope: Envelope) -> Result<(), BusError> {
        self.enqueue_outgoing(envelope).await
    }

    fn dispose(&self) {
        self.sender.dispose();
    }
}

struct LightweightCallback {
    sender: Weak<BatchedSender>,
    retry: RetryAgent,
    max_attempts: u32,
}

impl LightweightCallback {
    fn retry_batch(&self, batch: OutgoingMessageBatch, reason: &str) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        self.retry.failed(&sender);
        let latched = sender.latched();

        let mut retries = Vec::with_capacity(batch.len());
        for mut envelope in batch.messages {
            envelope.attempts += 1;
            if !latched && envelope.attempts >= self.max_attempts {
                warn!(
                    destination = %batch.destination,
                    envelope = %envelope,
                    attempts = envelope.attempts,
                    reason,
                    "discarding envelope after repeated send failures"
                );
                continue;
            }
            retries.push(envelope);
        }
        requeue(&sender, retries);
    }
}

#[async_trait]
impl SenderCallback for LightweightCallback {
    async fn successful(&self, _batch: OutgoingMessageBatch) {
        self.retry.succeeded();
    }

    async fn timed_out(&self, batch: OutgoingMessageBatch) {
        self.retry_batch(batch, "timed out");
    }

    async fn queue_is_full(&self, batch: OutgoingMessageBatch) {
        self.retry_batch(batch, "receiver too busy");
    }

    async fn processing_failure(&self, batch: OutgoingMessageBatch, error: BusError) {
        self.retry_batch(batch, &error.to_string());
    }

    async fn sender_is_latched(&self, batch: &OutgoingMessageBatch) {
        debug!(destination = %batch.destination, count = batch.len(), "holding batch while latched");
    }
}
