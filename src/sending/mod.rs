//! Sending agents: one per destination, wrapping a
//! [`BatchedSender`](crate::transport::BatchedSender) with a delivery
//! policy.
//!
//! | agent                      | before enqueue          | on failure                        |
//! |----------------------------|-------------------------|-----------------------------------|
//! | [`LightweightSendingAgent`] | nothing                 | retry in memory, then discard     |
//! | [`DurableSendingAgent`]     | write outgoing record   | bump stored attempts, dead-letter |
//! | [`LoopbackSendingAgent`]    | nothing                 | handled by the local worker queue |
//!
//! Both remote agents latch their sender after repeated failures and ping
//! the destination until it answers.

mod channels;
mod durable;
mod lightweight;
mod loopback;
mod retry;

pub use channels::ChannelGraph;
pub use durable::DurableSendingAgent;
pub use lightweight::LightweightSendingAgent;
pub use loopback::LoopbackSendingAgent;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::config::{BusSettings, NodeId};
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::persistence::EnvelopePersistence;

/// Anything that can put a fully addressed envelope on its way. Worker
/// pipelines use it to send replies and acknowledgements.
#[async_trait]
pub trait OutgoingSender: Send + Sync {
    /// Route (when no destination is set) and send. Returns the ids of the
    /// envelopes actually sent.
    async fn send_envelope(&self, envelope: Envelope) -> Result<Vec<Uuid>, BusError>;
}

/// Delivery policy in front of one destination.
#[async_trait]
pub trait SendingAgent: Send + Sync {
    fn destination(&self) -> &Url;

    fn is_durable(&self) -> bool;

    /// True while the destination is considered unreachable.
    fn latched(&self) -> bool;

    fn queued_count(&self) -> usize;

    /// Where replies to envelopes sent by this agent should go.
    fn default_reply_uri(&self) -> Option<&Url>;

    /// Send an envelope whose outgoing record, if any, already exists.
    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Persist when durable, then send.
    async fn store_and_forward(&self, envelope: Envelope) -> Result<(), BusError>;

    fn dispose(&self);
}

/// What every agent needs from its node.
#[derive(Clone)]
pub struct SendingContext {
    pub node_id: NodeId,
    pub settings: BusSettings,
    pub persistence: Arc<dyn EnvelopePersistence>,
    pub cancel: CancellationToken,
}

/// Stamp destination, reply address and send time.
pub(crate) fn address_envelope(
    mut envelope: Envelope,
    destination: &Url,
    reply_uri: Option<&Url>,
) -> Envelope {
    envelope.destination = Some(destination.clone());
    if envelope.reply_uri.is_none() {
        envelope.reply_uri = reply_uri.cloned();
    }
    envelope.sent_at = Utc::now();
    envelope
}
