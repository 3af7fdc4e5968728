use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::root::{MessagingRoot, RootParts};
use super::{EnvelopeSender, ReplyWatcher, ServiceBus};
use crate::config::BusSettings;
use crate::envelope::UriExt;
use crate::error::{BusError, TransportEndpointError};
use crate::metrics::{Metrics, MetricsCollector, TracingMetrics};
use crate::persistence::{EnvelopePersistence, InMemoryEnvelopeStore};
use crate::resiliency::{AgentContext, MessagingAction, SchedulingAgent};
use crate::routing::{InMemorySubscriptions, MessageRouter, SubscriptionsRepository};
use crate::sending::{ChannelGraph, OutgoingSender, SendingContext};
use crate::serialization::SerializerGraph;
use crate::transport::{Transport, TransportRuntime};
use crate::workers::{HandlerGraph, HandlerPipeline, WorkerRegistry};

/// Assembles and starts one messaging node.
///
/// Anything not supplied falls back to an in-process default: an
/// [`InMemoryEnvelopeStore`], [`InMemorySubscriptions`], the default
/// [`SerializerGraph`] and [`TracingMetrics`].
pub struct MessagingBuilder {
    settings: BusSettings,
    handlers: HandlerGraph,
    transports: Vec<Arc<dyn Transport>>,
    persistence: Option<Arc<dyn EnvelopePersistence>>,
    subscriptions: Option<Arc<dyn SubscriptionsRepository>>,
    serializers: SerializerGraph,
    metrics: Option<Arc<dyn Metrics>>,
    agent_actions: Option<Vec<Box<dyn MessagingAction>>>,
}

impl MessagingBuilder {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            handlers: HandlerGraph::new(),
            transports: Vec::new(),
            persistence: None,
            subscriptions: None,
            serializers: SerializerGraph::new(),
            metrics: None,
            agent_actions: None,
        }
    }

    pub fn handlers(mut self, handlers: HandlerGraph) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register a transport. Listeners and destinations are matched to
    /// transports by URI scheme.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn EnvelopePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn subscriptions(mut self, subscriptions: Arc<dyn SubscriptionsRepository>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn serializers(mut self, serializers: SerializerGraph) -> Self {
        self.serializers = serializers;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the resiliency agent's default actions.
    pub fn agent_actions(mut self, actions: Vec<Box<dyn MessagingAction>>) -> Self {
        self.agent_actions = Some(actions);
        self
    }

    /// Start listeners, the resiliency agent and the metrics collector.
    ///
    /// Invalid settings and duplicate transports fail the whole start. A
    /// listener that cannot start is recorded in
    /// [`MessagingRoot::endpoint_errors`] and the rest of the node starts.
    pub async fn start(self) -> Result<MessagingRoot, BusError> {
        let settings = Arc::new(self.settings);
        settings.validate()?;
        for (i, transport) in self.transports.iter().enumerate() {
            if self.transports[..i]
                .iter()
                .any(|other| other.protocol() == transport.protocol())
            {
                return Err(BusError::Configuration(format!(
                    "transport '{}' registered twice",
                    transport.protocol()
                )));
            }
        }

        let node_id = settings.node_id;
        let cancel = CancellationToken::new();
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryEnvelopeStore::new()));
        let subscriptions = self
            .subscriptions
            .unwrap_or_else(|| Arc::new(InMemorySubscriptions::new()));

        let replies = Arc::new(ReplyWatcher::new());
        let pipeline = Arc::new(HandlerPipeline::new(
            self.handlers,
            Arc::clone(&replies),
            settings.max_attempts,
        ));
        let workers = Arc::new(WorkerRegistry::new(
            node_id,
            settings.stage_capacity,
            Arc::clone(&pipeline),
            Arc::clone(&persistence),
            cancel.clone(),
        )?);

        let mut endpoint_errors = Vec::new();
        let mut runtimes = Vec::with_capacity(self.transports.len());
        for transport in self.transports {
            let runtime = Arc::new(TransportRuntime::new(transport));
            endpoint_errors.extend(
                runtime
                    .start_listening(&settings.listeners, &workers, &cancel)
                    .await,
            );
            runtimes.push(runtime);
        }
        for listener in &settings.listeners {
            if listener.uri.is_loopback() {
                workers.add_queue(listener);
                continue;
            }
            if !runtimes.iter().any(|r| r.protocol() == listener.uri.scheme()) {
                warn!(listener = %listener.uri, "no transport for listener");
                endpoint_errors.push(TransportEndpointError::new(
                    listener.uri.clone(),
                    "no transport for listener",
                    BusError::UnknownScheme(listener.uri.scheme().to_string()),
                ));
            }
        }

        let channels = Arc::new(ChannelGraph::new(
            runtimes.clone(),
            Arc::clone(&workers),
            SendingContext {
                node_id,
                settings: settings.as_ref().clone(),
                persistence: Arc::clone(&persistence),
                cancel: cancel.clone(),
            },
        ));
        let router = MessageRouter::new(settings.publishing.clone(), subscriptions, self.serializers);
        let sender = Arc::new(EnvelopeSender::new(
            settings.service_name.clone(),
            router,
            Arc::clone(&channels),
        ));
        let outgoing: Arc<dyn OutgoingSender> = sender.clone();
        pipeline.attach_sender(Arc::downgrade(&outgoing));

        let mut agent = SchedulingAgent::new(AgentContext {
            node_id,
            durability: settings.durability.clone(),
            persistence: Arc::clone(&persistence),
            workers: Arc::clone(&workers),
            channels: Arc::clone(&channels),
        });
        if let Some(actions) = self.agent_actions {
            agent = agent.with_actions(actions);
        }
        let agent_cancel = cancel.child_token();
        let agent = agent.spawn(agent_cancel.clone());

        // A zero interval turns sampling off.
        let metrics = (!settings.metrics_sampling_interval().is_zero()).then(|| {
            MetricsCollector::new(
                self.metrics.unwrap_or_else(|| Arc::new(TracingMetrics)),
                Arc::clone(&persistence),
                Arc::clone(&workers),
                Arc::clone(&channels),
                settings.metrics_sampling_interval(),
            )
            .spawn(cancel.child_token())
        });

        let bus = ServiceBus::new(
            sender,
            replies,
            pipeline,
            Arc::clone(&channels),
            Arc::clone(&settings),
        );

        info!(
            service = %settings.service_name,
            %node_id,
            transports = runtimes.len(),
            endpoint_errors = endpoint_errors.len(),
            "messaging node started"
        );

        Ok(MessagingRoot::new(RootParts {
            settings,
            bus,
            persistence,
            workers,
            channels,
            runtimes,
            endpoint_errors,
            cancel,
            agent_cancel,
            agent,
            metrics,
        }))
    }
}
