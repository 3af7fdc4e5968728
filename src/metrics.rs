//! Periodic sampling of store counts and queue depths.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::persistence::{EnvelopePersistence, PersistedCounts};
use crate::sending::ChannelGraph;
use crate::workers::WorkerRegistry;

/// Sink for sampled gauges.
pub trait Metrics: Send + Sync {
    fn log_persisted_counts(&self, counts: &PersistedCounts);

    fn log_local_worker_queue_depth(&self, queue: &Url, count: usize);

    fn log_sender_queue_depth(&self, destination: &Url, count: usize);
}

/// Writes every sample as a `tracing` event under the `durable_bus::metrics`
/// target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn log_persisted_counts(&self, counts: &PersistedCounts) {
        info!(
            target: "durable_bus::metrics",
            incoming = counts.incoming,
            scheduled = counts.scheduled,
            outgoing = counts.outgoing,
            dead_letters = counts.dead_letters,
            "persisted envelopes"
        );
    }

    fn log_local_worker_queue_depth(&self, queue: &Url, count: usize) {
        info!(target: "durable_bus::metrics", queue = %queue, count, "worker queue depth");
    }

    fn log_sender_queue_depth(&self, destination: &Url, count: usize) {
        info!(target: "durable_bus::metrics", destination = %destination, count, "sender queue depth");
    }
}

/// Samples on a fixed interval until cancelled. A failed sample is logged
/// and sampling goes on.
pub struct MetricsCollector {
    metrics: Arc<dyn Metrics>,
    persistence: Arc<dyn EnvelopePersistence>,
    workers: Arc<WorkerRegistry>,
    channels: Arc<ChannelGraph>,
    interval: Duration,
}

impl MetricsCollector {
    pub fn new(
        metrics: Arc<dyn Metrics>,
        persistence: Arc<dyn EnvelopePersistence>,
        workers: Arc<WorkerRegistry>,
        channels: Arc<ChannelGraph>,
        interval: Duration,
    ) -> Self {
        Self {
            metrics,
            persistence,
            workers,
            channels,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                self.sample().await;
            }
        })
    }

    pub async fn sample(&self) {
        for queue in self.workers.queues() {
            self.metrics
                .log_local_worker_queue_depth(queue.address(), queue.queued_count());
        }
        for (destination, count) in self.channels.queued_counts() {
            self.metrics.log_sender_queue_depth(&destination, count);
        }
        match self.persistence.persisted_counts().await {
            Ok(counts) => self.metrics.log_persisted_counts(&counts),
            Err(e) => warn!(error = %e, "could not read persisted counts"),
        }
    }
}
