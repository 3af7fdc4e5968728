use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::durable::DurableWorkerQueue;
use super::lightweight::LightweightWorkerQueue;
use super::pipeline::HandlerPipeline;
use super::WorkerQueue;
use crate::config::{ListenerSettings, NodeId};
use crate::envelope::{default_queue, durable_queue, replies_queue, Envelope, UriExt};
use crate::error::BusError;
use crate::persistence::EnvelopePersistence;

/// All worker queues of one node, keyed by normalized address.
///
/// Three loopback queues always exist: `loopback://default`,
/// `loopback://durable` and `loopback://replies`. Other loopback names are
/// created on first use.
pub struct WorkerRegistry {
    node_id: NodeId,
    capacity: usize,
    pipeline: Arc<HandlerPipeline>,
    persistence: Arc<dyn EnvelopePersistence>,
    cancel: CancellationToken,
    default: Arc<dyn WorkerQueue>,
    durable: Arc<dyn WorkerQueue>,
    queues: RwLock<HashMap<String, Arc<dyn WorkerQueue>>>,
}

impl WorkerRegistry {
    pub fn new(
        node_id: NodeId,
        capacity: usize,
        pipeline: Arc<HandlerPipeline>,
        persistence: Arc<dyn EnvelopePersistence>,
        cancel: CancellationToken,
    ) -> Result<Self, BusError> {
        let default = build_queue(
            &ListenerSettings::new(default_queue()?),
            node_id,
            capacity,
            &pipeline,
            &persistence,
            &cancel,
        );
        let durable = build_queue(
            &ListenerSettings::new(durable_queue()?).durably_persisted(),
            node_id,
            capacity,
            &pipeline,
            &persistence,
            &cancel,
        );
        let replies = build_queue(
            &ListenerSettings::new(replies_queue()?),
            node_id,
            capacity,
            &pipeline,
            &persistence,
            &cancel,
        );

        let mut queues = HashMap::new();
        for queue in [&default, &durable, &replies] {
            queues.insert(queue.address().endpoint_key(), Arc::clone(queue));
        }

        Ok(Self {
            node_id,
            capacity,
            pipeline,
            persistence,
            cancel,
            default,
            durable,
            queues: RwLock::new(queues),
        })
    }

    /// Queue for a listener. An existing queue at the same address is kept.
    pub fn add_queue(&self, settings: &ListenerSettings) -> Arc<dyn WorkerQueue> {
        let key = settings.uri.endpoint_key();
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(key).or_insert_with(|| {
            debug!(queue = %settings.uri, durable = settings.is_durable(), "creating worker queue");
            build_queue(
                settings,
                self.node_id,
                self.capacity,
                &self.pipeline,
                &self.persistence,
                &self.cancel,
            )
        }))
    }

    pub fn find(&self, uri: &Url) -> Option<Arc<dyn WorkerQueue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uri.endpoint_key())
            .cloned()
    }

    /// Queue serving `uri`. Unknown loopback addresses get a new queue;
    /// unknown remote addresses fall back to the default queue matching
    /// their durability.
    pub fn queue_for_uri(&self, uri: &Url) -> Arc<dyn WorkerQueue> {
        if let Some(queue) = self.find(uri) {
            return queue;
        }
        if uri.is_loopback() {
            return self.add_queue(&ListenerSettings::new(uri.clone()));
        }
        if uri.is_durable() {
            Arc::clone(&self.durable)
        } else {
            Arc::clone(&self.default)
        }
    }

    /// Durable queue that should execute a recovered envelope.
    pub fn durable_queue_for(&self, envelope: &Envelope) -> Arc<dyn WorkerQueue> {
        envelope
            .destination
            .as_ref()
            .and_then(|uri| self.find(uri))
            .filter(|queue| queue.is_durable())
            .unwrap_or_else(|| Arc::clone(&self.durable))
    }

    pub fn default_queue(&self) -> Arc<dyn WorkerQueue> {
        Arc::clone(&self.default)
    }

    pub fn durable_queue(&self) -> Arc<dyn WorkerQueue> {
        Arc::clone(&self.durable)
    }

    pub fn queues(&self) -> Vec<Arc<dyn WorkerQueue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Envelopes queued across every local queue.
    pub fn total_queued(&self) -> usize {
        self.queues().iter().map(|q| q.queued_count()).sum()
    }

    pub fn pipeline(&self) -> &Arc<HandlerPipeline> {
        &self.pipeline
    }
}

fn build_queue(
    settings: &ListenerSettings,
    node_id: NodeId,
    capacity: usize,
    pipeline: &Arc<HandlerPipeline>,
    persistence: &Arc<dyn EnvelopePersistence>,
    cancel: &CancellationToken,
) -> Arc<dyn WorkerQueue> {
    if settings.is_durable() {
        DurableWorkerQueue::new(
            settings,
            node_id,
            capacity,
            Arc::clone(pipeline),
            Arc::clone(persistence),
            cancel.clone(),
        )
    } else {
        LightweightWorkerQueue::new(
            settings,
            capacity,
            Arc::clone(pipeline),
            Arc::clone(persistence),
            cancel.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ReplyWatcher;
    use crate::persistence::InMemoryEnvelopeStore;
    use crate::workers::HandlerGraph;

    fn registry() -> WorkerRegistry {
        let pipeline = Arc::new(HandlerPipeline::new(
            HandlerGraph::new(),
            Arc::new(ReplyWatcher::new()),
            3,
        ));
        WorkerRegistry::new(
            NodeId::generate(),
            16,
            pipeline,
            Arc::new(InMemoryEnvelopeStore::new()),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn standard_loopback_queues_exist() {
        let registry = registry();
        assert!(!registry.queue_for_uri(&uri("loopback://default")).is_durable());
        assert!(registry.queue_for_uri(&uri("loopback://durable")).is_durable());
        assert!(registry.find(&uri("loopback://replies")).is_some());
    }

    #[tokio::test]
    async fn named_loopback_queue_is_created_once() {
        let registry = registry();
        let first = registry.queue_for_uri(&uri("loopback://orders"));
        let second = registry.queue_for_uri(&uri("loopback://Orders"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn listener_queue_durability_follows_settings() {
        let registry = registry();
        let queue = registry.add_queue(&ListenerSettings::parse("tcp://localhost:2201/durable").unwrap());
        assert!(queue.is_durable());
        let queue = registry.add_queue(&ListenerSettings::parse("tcp://localhost:2202").unwrap());
        assert!(!queue.is_durable());
    }

    #[tokio::test]
    async fn recovered_envelope_falls_back_to_durable_queue() {
        let registry = registry();
        let envelope = Envelope::new().with_destination(uri("tcp://elsewhere:9000"));
        let queue = registry.durable_queue_for(&envelope);
        assert_eq!(queue.address(), &uri("loopback://durable"));
    }
}
