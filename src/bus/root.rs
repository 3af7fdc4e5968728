use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use super::{MessagingBuilder, ServiceBus};
use crate::config::{BusSettings, NodeId};
use crate::error::{BusError, TransportEndpointError};
use crate::persistence::EnvelopePersistence;
use crate::resiliency::{AgentHandle, ConnectionState};
use crate::sending::ChannelGraph;
use crate::transport::{Listener, ListeningStatus, TransportRuntime};
use crate::workers::WorkerRegistry;

pub(super) struct RootParts {
    pub settings: Arc<BusSettings>,
    pub bus: ServiceBus,
    pub persistence: Arc<dyn EnvelopePersistence>,
    pub workers: Arc<WorkerRegistry>,
    pub channels: Arc<ChannelGraph>,
    pub runtimes: Vec<Arc<TransportRuntime>>,
    pub endpoint_errors: Vec<TransportEndpointError>,
    pub cancel: CancellationToken,
    pub agent_cancel: CancellationToken,
    pub agent: AgentHandle,
    pub metrics: Option<JoinHandle<()>>,
}

/// A started node. Owns every background task; dropping it cancels them
/// without the orderly [`shutdown`](MessagingRoot::shutdown).
pub struct MessagingRoot {
    settings: Arc<BusSettings>,
    bus: ServiceBus,
    persistence: Arc<dyn EnvelopePersistence>,
    workers: Arc<WorkerRegistry>,
    channels: Arc<ChannelGraph>,
    runtimes: Vec<Arc<TransportRuntime>>,
    endpoint_errors: Vec<TransportEndpointError>,
    cancel: CancellationToken,
    agent_cancel: CancellationToken,
    agent: Mutex<Option<AgentHandle>>,
    agent_state: watch::Receiver<ConnectionState>,
    metrics: Mutex<Option<JoinHandle<()>>>,
}

impl MessagingRoot {
    pub fn builder(settings: BusSettings) -> MessagingBuilder {
        MessagingBuilder::new(settings)
    }

    pub(super) fn new(parts: RootParts) -> Self {
        Self {
            settings: parts.settings,
            bus: parts.bus,
            persistence: parts.persistence,
            workers: parts.workers,
            channels: parts.channels,
            runtimes: parts.runtimes,
            endpoint_errors: parts.endpoint_errors,
            cancel: parts.cancel,
            agent_cancel: parts.agent_cancel,
            agent_state: parts.agent.watch(),
            agent: Mutex::new(Some(parts.agent)),
            metrics: Mutex::new(parts.metrics),
        }
    }

    pub fn bus(&self) -> &ServiceBus {
        &self.bus
    }

    pub fn node_id(&self) -> NodeId {
        self.settings.node_id
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// Listeners that failed to start. The rest of the node runs without
    /// them.
    pub fn endpoint_errors(&self) -> &[TransportEndpointError] {
        &self.endpoint_errors
    }

    pub fn persistence(&self) -> &Arc<dyn EnvelopePersistence> {
        &self.persistence
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    pub fn channels(&self) -> &Arc<ChannelGraph> {
        &self.channels
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.runtimes.iter().flat_map(|r| r.listeners()).collect()
    }

    /// Reply address advertised by the transport for `scheme`, if any.
    pub fn reply_uri(&self, scheme: &str) -> Option<Url> {
        self.runtimes
            .iter()
            .find(|r| r.protocol() == scheme)
            .and_then(|r| r.reply_uri())
    }

    /// Pause or resume every listener of the node.
    pub fn set_listening_status(&self, status: ListeningStatus) {
        for runtime in &self.runtimes {
            runtime.set_status(status);
        }
    }

    pub fn agent_state(&self) -> ConnectionState {
        *self.agent_state.borrow()
    }

    /// Resolve once the resiliency agent holds the node lock.
    pub async fn wait_for_node_lock(&self) -> Result<(), BusError> {
        let mut state = self.agent_state.clone();
        state
            .wait_for(|s| *s == ConnectionState::LockAcquired)
            .await
            .map(|_| ())
            .map_err(|_| BusError::Shutdown)
    }

    /// Orderly stop: refuse new batches, let the resiliency agent hand this
    /// node's records back to the store, stop the senders, then cancel
    /// everything else.
    pub async fn shutdown(&self) {
        info!(node_id = %self.settings.node_id, "shutting down messaging node");
        self.set_listening_status(ListeningStatus::TooBusy);

        self.agent_cancel.cancel();
        let agent = self.agent.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(agent) = agent {
            agent.join().await;
        }

        self.channels.dispose();
        self.cancel.cancel();

        let metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(metrics) = metrics {
            if let Err(e) = metrics.await {
                error!(error = %e, "metrics collector failed");
            }
        }
    }
}

impl Drop for MessagingRoot {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
