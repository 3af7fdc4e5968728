use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;

use super::{AgentContext, MessagingAction};
use crate::config::DurabilitySettings;
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::persistence::{Direction, StoreSession};

/// Moves due scheduled records into this node's durable queues.
#[derive(Debug, Default)]
pub struct RunScheduledJobs;

#[async_trait]
impl MessagingAction for RunScheduledJobs {
    fn name(&self) -> &'static str {
        "run-scheduled-jobs"
    }

    fn interval(&self, durability: &DurabilitySettings) -> Duration {
        durability.scheduled_job_polling()
    }

    async fn execute(
        &self,
        session: &dyn StoreSession,
        context: &AgentContext,
    ) -> Result<(), BusError> {
        let due = session
            .scheduled_before(
                context.node_id,
                Utc::now(),
                context.durability.recovery_batch_size,
            )
            .await?;
        if due.is_empty() {
            return Ok(());
        }

        info!(count = due.len(), "running scheduled envelopes");
        for mut envelope in due {
            envelope.execution_time = None;
            let queue = context.workers.durable_queue_for(&envelope);
            queue.enqueue_persisted(envelope).await?;
        }
        Ok(())
    }
}

/// Claims unowned incoming records and executes them here, as long as the
/// local queues are not already saturated.
#[derive(Debug, Default)]
pub struct RecoverIncomingMessages;

#[async_trait]
impl MessagingAction for RecoverIncomingMessages {
    fn name(&self) -> &'static str {
        "recover-incoming"
    }

    fn interval(&self, durability: &DurabilitySettings) -> Duration {
        durability.recovery_polling()
    }

    async fn execute(
        &self,
        session: &dyn StoreSession,
        context: &AgentContext,
    ) -> Result<(), BusError> {
        let queued = context.workers.total_queued();
        if queued >= context.durability.max_local_queued {
            debug!(queued, "local queues saturated, skipping incoming recovery");
            return Ok(());
        }
        let room = context.durability.max_local_queued - queued;
        let limit = context.durability.recovery_batch_size.min(room);

        let candidates = session.owned_incoming(None, limit).await?;
        if candidates.is_empty() {
            return Ok(());
        }
        let ids: Vec<_> = candidates.iter().map(|e| e.id).collect();
        let claimed = session
            .claim(Direction::Incoming, &ids, context.node_id)
            .await?;

        info!(count = claimed.len(), "recovering incoming envelopes");
        for envelope in candidates.into_iter().filter(|e| claimed.contains(&e.id)) {
            let queue = context.workers.durable_queue_for(&envelope);
            queue.enqueue_persisted(envelope).await?;
        }
        Ok(())
    }
}

/// Claims unowned outgoing records and hands them to their destination's
/// sending agent. Destinations whose sender is latched are left alone.
#[derive(Debug, Default)]
pub struct RecoverOutgoingMessages;

impl RecoverOutgoingMessages {
    async fn dead_letter(context: &AgentContext, envelope: &Envelope, error: &str) {
        warn!(envelope = %envelope, error, "outgoing envelope cannot be delivered");
        if let Err(e) = context
            .persistence
            .move_to_dead_letter(Direction::Outgoing, envelope, error)
            .await
        {
            warn!(envelope = %envelope, error = %e, "could not dead-letter envelope");
        }
    }
}

#[async_trait]
impl MessagingAction for RecoverOutgoingMessages {
    fn name(&self) -> &'static str {
        "recover-outgoing"
    }

    fn interval(&self, durability: &DurabilitySettings) -> Duration {
        durability.recovery_polling()
    }

    async fn execute(
        &self,
        session: &dyn StoreSession,
        context: &AgentContext,
    ) -> Result<(), BusError> {
        let candidates = session
            .owned_outgoing(None, context.durability.recovery_batch_size)
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let mut by_destination: BTreeMap<String, (Url, Vec<Envelope>)> = BTreeMap::new();
        for envelope in candidates {
            match envelope.destination.clone() {
                Some(destination) => by_destination
                    .entry(destination.to_string())
                    .or_insert_with(|| (destination, Vec::new()))
                    .1
                    .push(envelope),
                None => Self::dead_letter(context, &envelope, "no destination").await,
            }
        }

        for (destination, envelopes) in by_destination.into_values() {
            let agent = match context.channels.get_or_build(&destination) {
                Ok(agent) => agent,
                Err(e) => {
                    for envelope in &envelopes {
                        Self::dead_letter(context, envelope, &e.to_string()).await;
                    }
                    continue;
                }
            };
            if agent.latched() {
                debug!(destination = %destination, "sender latched, leaving outgoing envelopes");
                continue;
            }

            let ids: Vec<_> = envelopes.iter().map(|e| e.id).collect();
            let claimed = session
                .claim(Direction::Outgoing, &ids, context.node_id)
                .await?;
            info!(destination = %destination, count = claimed.len(), "recovering outgoing envelopes");
            for envelope in envelopes.into_iter().filter(|e| claimed.contains(&e.id)) {
                agent.enqueue_outgoing(envelope).await?;
            }
        }
        Ok(())
    }
}

/// Releases the records of nodes that stopped heartbeating and whose lock
/// is free, so live nodes can recover them.
#[derive(Debug, Default)]
pub struct ReassignFromDormantNodes;

#[async_trait]
impl MessagingAction for ReassignFromDormantNodes {
    fn name(&self) -> &'static str {
        "reassign-dormant-nodes"
    }

    fn interval(&self, durability: &DurabilitySettings) -> Duration {
        durability.dormant_node_polling()
    }

    async fn execute(
        &self,
        session: &dyn StoreSession,
        context: &AgentContext,
    ) -> Result<(), BusError> {
        let dormant = session
            .dormant_node_ids(context.durability.dormant_node_threshold(), context.node_id)
            .await?;

        for node in dormant {
            // A node that still holds its lock is alive, just slow.
            if !session.acquire_node_lock(node).await? {
                debug!(%node, "dormant candidate still holds its lock");
                continue;
            }
            let released = session.release_node_records(node).await;
            session.release_node_lock(node).await?;
            let released = released?;
            info!(%node, released, "reassigned records of dormant node");
        }
        Ok(())
    }
}
