use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};
use url::Url;

use super::ReceiverCallback;
use crate::envelope::{BatchReply, Envelope};
use crate::workers::WorkerQueue;

/// Whether a listener takes new batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningStatus {
    Accepting,
    TooBusy,
}

/// Receiving side of one endpoint: hands accepted batches to its worker
/// queue and answers the sender.
pub struct Listener {
    address: Url,
    queue: Arc<dyn WorkerQueue>,
    too_busy: AtomicBool,
}

impl Listener {
    pub fn new(address: Url, queue: Arc<dyn WorkerQueue>) -> Self {
        Self {
            address,
            queue,
            too_busy: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    pub fn queue(&self) -> &Arc<dyn WorkerQueue> {
        &self.queue
    }

    pub fn status(&self) -> ListeningStatus {
        if self.too_busy.load(Ordering::SeqCst) {
            ListeningStatus::TooBusy
        } else {
            ListeningStatus::Accepting
        }
    }

    /// Work already accepted keeps running when the listener turns busy.
    pub fn set_status(&self, status: ListeningStatus) {
        let busy = status == ListeningStatus::TooBusy;
        if self.too_busy.swap(busy, Ordering::SeqCst) != busy {
            info!(listener = %self.address, ?status, "listener status changed");
        }
    }
}

#[async_trait]
impl ReceiverCallback for Listener {
    async fn received(&self, _destination: &Url, mut envelopes: Vec<Envelope>) -> BatchReply {
        if self.status() == ListeningStatus::TooBusy {
            debug!(listener = %self.address, count = envelopes.len(), "refusing batch, too busy");
            return BatchReply::TooBusy;
        }
        if envelopes.is_empty() {
            return BatchReply::Received;
        }

        for envelope in envelopes.iter_mut() {
            envelope.destination = Some(self.address.clone());
        }

        let count = envelopes.len();
        match self.queue.receive(envelopes).await {
            Ok(()) => {
                debug!(listener = %self.address, count, "batch received");
                BatchReply::Received
            }
            Err(e) => {
                error!(listener = %self.address, error = %e, "failed to accept batch");
                BatchReply::ProcessFailure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenerSettings, NodeId};
    use crate::persistence::{Direction, EnvelopePersistence, InMemoryEnvelopeStore};
    use crate::workers::{DurableWorkerQueue, HandlerGraph, HandlerPipeline};
    use crate::bus::ReplyWatcher;
    use tokio_util::sync::CancellationToken;

    fn durable_listener(store: &InMemoryEnvelopeStore) -> Listener {
        let settings = ListenerSettings::parse("memory://inbox/durable").unwrap();
        let pipeline = Arc::new(HandlerPipeline::new(
            HandlerGraph::new(),
            Arc::new(ReplyWatcher::new()),
            3,
        ));
        let queue = DurableWorkerQueue::new(
            &settings,
            NodeId::generate(),
            16,
            pipeline,
            Arc::new(store.clone()),
            CancellationToken::new(),
        );
        Listener::new(settings.uri, queue)
    }

    fn scheduled() -> Envelope {
        Envelope::from_data("later", crate::serialization::JSON, b"{}".to_vec())
            .with_execution_time(chrono::Utc::now() + chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn durable_listener_persists_before_answering() {
        let store = InMemoryEnvelopeStore::new();
        let listener = durable_listener(&store);
        let envelope = scheduled();
        let id = envelope.id;

        let reply = listener.received(listener.address(), vec![envelope]).await;

        assert_eq!(reply, BatchReply::Received);
        assert!(store.record(Direction::Incoming, id).is_some());
    }

    #[tokio::test]
    async fn received_attempts_are_kept() {
        let store = InMemoryEnvelopeStore::new();
        let listener = durable_listener(&store);
        let mut envelope = scheduled();
        envelope.attempts = 2;
        let id = envelope.id;

        listener.received(listener.address(), vec![envelope]).await;

        let stored = store.record(Direction::Incoming, id).unwrap();
        assert!(stored.envelope.attempts >= 2);
        assert_eq!(stored.envelope.destination.as_ref(), Some(listener.address()));
    }

    #[tokio::test]
    async fn busy_listener_refuses_without_touching_the_store() {
        let store = InMemoryEnvelopeStore::new();
        let listener = durable_listener(&store);
        listener.set_status(ListeningStatus::TooBusy);

        let reply = listener.received(listener.address(), vec![scheduled()]).await;

        assert_eq!(reply, BatchReply::TooBusy);
        assert_eq!(store.persisted_counts().await.unwrap().scheduled, 0);

        listener.set_status(ListeningStatus::Accepting);
        let reply = listener.received(listener.address(), vec![scheduled()]).await;
        assert_eq!(reply, BatchReply::Received);
    }

    #[tokio::test]
    async fn unpersistable_batch_answers_process_failure() {
        let store = InMemoryEnvelopeStore::new();
        let listener = durable_listener(&store);

        // Neither message nor data: nothing to write.
        let broken = Envelope::new();
        let reply = listener.received(listener.address(), vec![broken]).await;
        assert_eq!(reply, BatchReply::ProcessFailure);
    }
}
