use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use super::executor::WorkerExecutor;
use super::pipeline::HandlerPipeline;
use super::{MessageCallback, WorkerQueue};
use crate::config::{ListenerSettings, NodeId};
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::persistence::{Direction, EnvelopePersistence};

/// Worker queue that writes an incoming record before anything executes.
///
/// Delayed envelopes are stored as scheduled records and left to the
/// resiliency agent, which hands them back through
/// [`enqueue_persisted`](WorkerQueue::enqueue_persisted) once due.
pub struct DurableWorkerQueue {
    address: Url,
    node_id: NodeId,
    executor: WorkerExecutor,
    persistence: Arc<dyn EnvelopePersistence>,
}

impl DurableWorkerQueue {
    pub fn new(
        settings: &ListenerSettings,
        node_id: NodeId,
        capacity: usize,
        pipeline: Arc<HandlerPipeline>,
        persistence: Arc<dyn EnvelopePersistence>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let callback: Weak<dyn MessageCallback> = me.clone();
            Self {
                address: settings.uri.clone(),
                node_id,
                executor: WorkerExecutor::spawn(
                    settings.uri.clone(),
                    pipeline,
                    callback,
                    settings.parallelism(),
                    capacity,
                    cancel,
                ),
                persistence,
            }
        })
    }

    /// Hand a record this node could not settle back to incoming recovery.
    async fn release(&self, envelope: &Envelope) {
        match self.persistence.release_incoming(&[envelope.id]).await {
            Ok(()) => warn!(queue = %self.address, envelope = %envelope, "record released for recovery"),
            Err(e) => error!(
                queue = %self.address,
                envelope = %envelope,
                error = %e,
                "could not release record, it stays owned by this node"
            ),
        }
    }

    async fn persist_and_queue(&self, mut envelopes: Vec<Envelope>) -> Result<(), BusError> {
        for envelope in envelopes.iter_mut() {
            envelope.ensure_data()?;
        }
        self.persistence
            .persist_incoming(self.node_id, &envelopes)
            .await?;

        let now = Utc::now();
        for envelope in envelopes {
            if envelope.is_delayed(now) {
                debug!(queue = %self.address, envelope = %envelope, "stored as scheduled");
                continue;
            }
            self.executor.push(envelope).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageCallback for DurableWorkerQueue {
    async fn mark_complete(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.persistence.mark_complete(&[envelope.id]).await?;
        Ok(())
    }

    async fn requeue(&self, envelope: Envelope) -> Result<(), BusError> {
        // The in-memory count is authoritative until the store catches up.
        if let Err(e) = self
            .persistence
            .increment_attempts(Direction::Incoming, std::slice::from_ref(&envelope))
            .await
        {
            warn!(queue = %self.address, envelope = %envelope, error = %e, "could not store attempts");
        }
        self.executor.push_nowait(envelope)
    }

    async fn move_to_errors(&self, envelope: &Envelope, error: &str) -> Result<(), BusError> {
        error!(queue = %self.address, envelope = %envelope, error, "envelope moved to errors");
        if let Err(e) = self
            .persistence
            .move_to_dead_letter(Direction::Incoming, envelope, error)
            .await
        {
            self.release(envelope).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn move_to_delayed_until(
        &self,
        mut envelope: Envelope,
        at: DateTime<Utc>,
    ) -> Result<(), BusError> {
        envelope.execution_time = Some(at);
        if let Err(e) = self.persistence.schedule_execution(&envelope).await {
            self.release(&envelope).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerQueue for DurableWorkerQueue {
    fn address(&self) -> &Url {
        &self.address
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn queued_count(&self) -> usize {
        self.executor.queued()
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<(), BusError> {
        self.persist_and_queue(vec![envelope]).await
    }

    async fn enqueue_persisted(&self, envelope: Envelope) -> Result<(), BusError> {
        self.executor.push(envelope).await
    }

    async fn schedule_execution(&self, mut envelope: Envelope) -> Result<(), BusError> {
        envelope.ensure_data()?;
        self.persistence.schedule_execution(&envelope).await?;
        Ok(())
    }

    async fn receive(&self, envelopes: Vec<Envelope>) -> Result<(), BusError> {
        self.persist_and_queue(envelopes).await
    }
}
