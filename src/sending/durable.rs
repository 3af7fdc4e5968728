use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, warn};
use url::Url;

use super::retry::{requeue, RetryAgent};
use super::{address_envelope, SendingAgent, SendingContext};
use crate::config::NodeId;
use crate::envelope::{Envelope, OutgoingMessageBatch};
use crate::error::BusError;
use crate::persistence::{Direction, EnvelopePersistence};
use crate::transport::{BatchedSender, SenderCallback};

/// Store-and-forward delivery: the outgoing record is written before the
/// envelope reaches the sender and removed only once the destination has
/// acknowledged the batch.
pub struct DurableSendingAgent {
    destination: Url,
    node_id: NodeId,
    sender: Arc<BatchedSender>,
    persistence: Arc<dyn EnvelopePersistence>,
    reply_uri: Option<Url>,
}

impl DurableSendingAgent {
    pub fn start(
        sender: Arc<BatchedSender>,
        reply_uri: Option<Url>,
        context: &SendingContext,
    ) -> Arc<Self> {
        let destination = sender.destination().clone();
        sender.start(Arc::new(DurableCallback {
            sender: Arc::downgrade(&sender),
            retry: RetryAgent::new(destination.clone(), &context.settings, context.cancel.clone()),
            persistence: Arc::clone(&context.persistence),
            max_attempts: context.settings.max_attempts.max(1),
        }));
        Arc::new(Self {
            destination,
            node_id: context.node_id,
            sender,
            persistence: Arc::clone(&context.persistence),
            reply_uri,
        })
    }
}

#[async_trait]
impl SendingAgent for DurableSendingAgent {
    fn destination(&self) -> &Url {
        &self.destination
    }

    fn is_durable(&self) -> bool {
        true
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
        let mut envelope = address_envelope(envelope, &self.destination, self.reply_uri.as_ref());
        envelope.ensure_data()?;
        self.persistence
            .persist_outgoing(self.node_id, std::slice::from_ref(&envelope))
            .await?;
        self.sender.enqueue(envelope).await
    }

    fn dispose(&self) {
        self.sender.dispose();
    }
}

struct DurableCallback {
    sender: Weak<BatchedSender>,
    retry: RetryAgent,
    persistence: Arc<dyn EnvelopePersistence>,
    max_attempts: u32,
}

impl DurableCallback {
    async fn retry_batch(&self, batch: OutgoingMessageBatch, reason: &str) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        self.retry.failed(&sender);
        let latched = sender.latched();
        let destination = batch.destination;

        let mut envelopes = batch.messages;
        for envelope in envelopes.iter_mut() {
            envelope.attempts += 1;
        }
        if let Err(e) = self
            .persistence
            .increment_attempts(Direction::Outgoing, &envelopes)
            .await
        {
            error!(destination = %destination, error = %e, "could not record send attempts");
        }

        let mut retries = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            if latched || envelope.attempts < self.max_attempts {
                retries.push(envelope);
                continue;
            }
            warn!(
                destination = %destination,
                envelope = %envelope,
                attempts = envelope.attempts,
                reason,
                "moving outgoing envelope to dead letters"
            );
            if let Err(e) = self
                .persistence
                .move_to_dead_letter(Direction::Outgoing, &envelope, reason)
                .await
            {
                error!(envelope = %envelope, error = %e, "could not dead-letter envelope");
            }
        }
        requeue(&sender, retries);
    }
}

#[async_trait]
impl SenderCallback for DurableCallback {
    async fn successful(&self, batch: OutgoingMessageBatch) {
        self.retry.succeeded();
        if let Err(e) = self.persistence.delete_outgoing(&batch.ids()).await {
            // Left for outgoing recovery, which resends; receivers see a
            // duplicate.
            error!(destination = %batch.destination, error = %e, "could not delete delivered envelopes");
        }
    }

    async fn timed_out(&self, batch: OutgoingMessageBatch) {
        self.retry_batch(batch, "timed out").await;
    }

    async fn queue_is_full(&self, batch: OutgoingMessageBatch) {
        self.retry_batch(batch, "receiver too busy").await;
    }

    async fn processing_failure(&self, batch: OutgoingMessageBatch, error: BusError) {
        self.retry_batch(batch, &error.to_string()).await;
    }

    async fn sender_is_latched(&self, batch: &OutgoingMessageBatch) {
        debug!(destination = %batch.destination, count = batch.len(), "holding batch while latched");
    }
}
