use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::{address_envelope, SendingAgent};
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::workers::WorkerQueue;

/// `loopback://` destinations: envelopes go straight into a local worker
/// queue. A durable queue writes its own incoming record, so no outgoing
/// record is needed.
pub struct LoopbackSendingAgent {
    destination: Url,
    queue: Arc<dyn WorkerQueue>,
    reply_uri: Option<Url>,
}

impl LoopbackSendingAgent {
    pub fn new(destination: Url, queue: Arc<dyn WorkerQueue>, reply_uri: Option<Url>) -> Self {
        Self {
            destination,
            queue,
            reply_uri,
        }
    }
}

#[async_trait]
impl SendingAgent for LoopbackSendingAgent {
    fn destination(&self) -> &Url {
        &self.destination
    }

    fn is_durable(&self) -> bool {
        self.queue.is_durable()
    }

    fn latched(&self) -> bool {
        false
    }

    fn queued_count(&self) -> usize {
        self.queue.queued_count()
    }

    fn default_reply_uri(&self) -> Option<&Url> {
        self.reply_uri.as_ref()
    }

    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<(), BusError> {
        self.queue
            .enqueue(address_envelope(envelope, &self.destination, self.reply_uri.as_ref()))
            .await
    }

    async fn store_and_forward(&self, envelope: Envelope) -> Result<(), BusError> {
        self.enqueue_outgoing(envelope).await
    }

    fn dispose(&self) {}
}
