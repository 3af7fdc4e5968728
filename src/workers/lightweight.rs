use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use url::Url;

use super::executor::WorkerExecutor;
use super::pipeline::HandlerPipeline;
use super::{MessageCallback, WorkerQueue};
use crate::config::ListenerSettings;
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::persistence::{Direction, EnvelopePersistence};

/// In-memory worker queue. Work that has not executed is lost if the
/// process dies; failures past the ceiling are still written to the store's
/// error sink.
pub struct LightweightWorkerQueue {
    address: Url,
    me: Weak<Self>,
    executor: WorkerExecutor,
    persistence: Arc<dyn EnvelopePersistence>,
    delayed: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl LightweightWorkerQueue {
    pub fn new(
        settings: &ListenerSettings,
        capacity: usize,
        pipeline: Arc<HandlerPipeline>,
        persistence: Arc<dyn EnvelopePersistence>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let callback: Weak<dyn MessageCallback> = me.clone();
            Self {
                address: settings.uri.clone(),
                me: me.clone(),
                executor: WorkerExecutor::spawn(
                    settings.uri.clone(),
                    pipeline,
                    callback,
                    settings.parallelism(),
                    capacity,
                    cancel.clone(),
                ),
                persistence,
                delayed: Arc::new(AtomicUsize::new(0)),
                cancel,
            }
        })
    }

    /// Hold the envelope on a timer, then queue it.
    fn delay(&self, mut envelope: Envelope, at: DateTime<Utc>) {
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        envelope.execution_time = None;
        let me = self.me.clone();
        let delayed = Arc::clone(&self.delayed);
        let cancel = self.cancel.clone();
        delayed.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    if let Some(queue) = me.upgrade() {
                        if let Err(e) = queue.executor.push(envelope).await {
                            warn!(error = %e, "could not queue delayed envelope");
                        }
                    }
                }
            }
            delayed.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn accept(&self, envelope: Envelope) -> Result<(), BusError> {
        match envelope.execution_time {
            Some(at) if at > Utc::now() => {
                self.delay(envelope, at);
                Ok(())
            }
            _ => self.executor.push(envelope).await,
        }
    }
}

#[async_trait]
impl MessageCallback for LightweightWorkerQueue {
    async fn mark_complete(&self, _envelope: &Envelope) -> Result<(), BusError> {
        Ok(())
    }

    async fn requeue(&self, envelope: Envelope) -> Result<(), BusError> {
        self.executor.push_nowait(envelope)
    }

    async fn move_to_errors(&self, envelope: &Envelope, error: &str) -> Result<(), BusError> {
        error!(queue = %self.address, envelope = %envelope, error, "envelope moved to errors");
        self.persistence
            .move_to_dead_letter(Direction::Incoming, envelope, error)
            .await?;
        Ok(())
    }

    async fn move_to_delayed_until(
        &self,
        envelope: Envelope,
        at: DateTime<Utc>,
    ) -> Result<(), BusError> {
        self.delay(envelope, at);
        Ok(())
    }
}

#[async_trait]
impl WorkerQueue for LightweightWorkerQueue {
    fn address(&self) -> &Url {
        &self.address
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn queued_count(&self) -> usize {
        self.executor.queued() + self.delayed.load(Ordering::SeqCst)
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<(), BusError> {
        self.accept(envelope).await
    }

    async fn enqueue_persisted(&self, envelope: Envelope) -> Result<(), BusError> {
        self.accept(envelope).await
    }

    async fn schedule_execution(&self, envelope: Envelope) -> Result<(), BusError> {
        let at = envelope.execution_time.unwrap_or_else(Utc::now);
        self.delay(envelope, at);
        Ok(())
    }

    async fn receive(&self, envelopes: Vec<Envelope>) -> Result<(), BusError> {
        for envelope in envelopes {
            self.accept(envelope).await?;
        }
        Ok(())
    }
}
