//! Node-level resiliency: one agent per process keeps a store session,
//! holds this node's lock and periodically reconciles the store with the
//! running node.
//!
//! ```text
//!   Disconnected ──connect──► Connecting ──lock acquired──► LockAcquired
//!        ▲                                                      │
//!        └──────── connection error / lock lost / shutdown ─────┘
//!
//!   LockAcquired, every pass:
//!     heartbeat
//!     RunScheduledJobs          scheduled records due  -> durable queues
//!     RecoverIncomingMessages   unowned incoming       -> durable queues
//!     RecoverOutgoingMessages   unowned outgoing       -> sending agents
//!     ReassignFromDormantNodes  dead nodes' records    -> unowned
//! ```

mod actions;
mod agent;

pub use actions::{
    ReassignFromDormantNodes, RecoverIncomingMessages, RecoverOutgoingMessages, RunScheduledJobs,
};
pub use agent::{AgentHandle, ConnectionState, SchedulingAgent};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{DurabilitySettings, NodeId};
use crate::error::BusError;
use crate::persistence::{EnvelopePersistence, StoreSession};
use crate::sending::ChannelGraph;
use crate::workers::WorkerRegistry;

/// Everything an action may touch besides the session.
#[derive(Clone)]
pub struct AgentContext {
    pub node_id: NodeId,
    pub durability: DurabilitySettings,
    pub persistence: Arc<dyn EnvelopePersistence>,
    pub workers: Arc<WorkerRegistry>,
    pub channels: Arc<ChannelGraph>,
}

/// One periodic reconciliation step run by the [`SchedulingAgent`].
///
/// An error classified as a connection failure
/// ([`BusError::is_connection_failure`]) makes the agent drop its session;
/// any other error is logged and the next action runs.
#[async_trait]
pub trait MessagingAction: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self, durability: &DurabilitySettings) -> Duration;

    async fn execute(
        &self,
        session: &dyn StoreSession,
        context: &AgentContext,
    ) -> Result<(), BusError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bus::ReplyWatcher;
    use crate::config::BusSettings;
    use crate::persistence::InMemoryEnvelopeStore;
    use crate::sending::SendingContext;
    use crate::transport::{MemoryHub, MemoryTransport, TransportRuntime};
    use crate::workers::{HandlerGraph, HandlerPipeline};
    use tokio_util::sync::CancellationToken;

    pub(crate) fn context(
        store: &InMemoryEnvelopeStore,
        handlers: HandlerGraph,
        hub: &MemoryHub,
        settings: BusSettings,
    ) -> AgentContext {
        let persistence: Arc<dyn EnvelopePersistence> = Arc::new(store.clone());
        let cancel = CancellationToken::new();
        let pipeline = Arc::new(HandlerPipeline::new(
            handlers,
            Arc::new(ReplyWatcher::new()),
            settings.max_attempts,
        ));
        let workers = Arc::new(
            WorkerRegistry::new(
                settings.node_id,
                settings.stage_capacity,
                pipeline,
                Arc::clone(&persistence),
                cancel.clone(),
            )
            .unwrap(),
        );
        let memory = Arc::new(TransportRuntime::new(Arc::new(MemoryTransport::new(
            hub.clone(),
        ))));
        let channels = Arc::new(ChannelGraph::new(
            vec![memory],
            Arc::clone(&workers),
            SendingContext {
                node_id: settings.node_id,
                settings: settings.clone(),
                persistence: Arc::clone(&persistence),
                cancel,
            },
        ));
        AgentContext {
            node_id: settings.node_id,
            durability: settings.durability.clone(),
            persistence,
            workers,
            channels,
        }
    }
}
