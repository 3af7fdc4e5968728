use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;
use url::Url;

use super::{LoopbackSendingAgent, SendingAgent, SendingContext};
use crate::envelope::{replies_queue, UriExt};
use crate::error::BusError;
use crate::transport::TransportRuntime;
use crate::workers::WorkerRegistry;

/// One sending agent per destination, built on first use and cached for
/// the life of the node.
pub struct ChannelGraph {
    agents: RwLock<HashMap<String, Arc<dyn SendingAgent>>>,
    transports: HashMap<String, Arc<TransportRuntime>>,
    workers: Arc<WorkerRegistry>,
    context: SendingContext,
}

impl ChannelGraph {
    pub fn new(
        transports: Vec<Arc<TransportRuntime>>,
        workers: Arc<WorkerRegistry>,
        context: SendingContext,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            transports: transports
                .into_iter()
                .map(|runtime| (runtime.protocol().to_string(), runtime))
                .collect(),
            workers,
            context,
        }
    }

    /// Agent for `uri`, building it on first use.
    pub fn get_or_build(&self, uri: &Url) -> Result<Arc<dyn SendingAgent>, BusError> {
        let key = uri.endpoint_key();
        if let Some(agent) = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(agent));
        }

        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = agents.get(&key) {
            return Ok(Arc::clone(agent));
        }
        let agent = self.build(uri)?;
        debug!(destination = %uri, durable = agent.is_durable(), "sending agent built");
        agents.insert(key, Arc::clone(&agent));
        Ok(agent)
    }

    fn build(&self, uri: &Url) -> Result<Arc<dyn SendingAgent>, BusError> {
        if uri.is_loopback() {
            return Ok(Arc::new(LoopbackSendingAgent::new(
                uri.clone(),
                self.workers.queue_for_uri(uri),
                Some(replies_queue()?),
            )));
        }
        let runtime = self
            .transports
            .get(uri.scheme())
            .ok_or_else(|| BusError::UnknownScheme(uri.scheme().to_string()))?;
        Ok(runtime.build_sending_agent(uri, &self.context)?)
    }

    pub fn agents(&self) -> Vec<Arc<dyn SendingAgent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Envelopes waiting in each remote agent.
    pub fn queued_counts(&self) -> Vec<(Url, usize)> {
        self.agents()
            .iter()
            .filter(|agent| !agent.destination().is_loopback())
            .map(|agent| (agent.destination().clone(), agent.queued_count()))
            .collect()
    }

    pub fn transport(&self, protocol: &str) -> Option<&Arc<TransportRuntime>> {
        self.transports.get(protocol)
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Stop every agent and forget it.
    pub fn dispose(&self) {
        let agents: Vec<_> = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, agent)| agent)
            .collect();
        for agent in agents {
            agent.dispose();
        }
    }
}
