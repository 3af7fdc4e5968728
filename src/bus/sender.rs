use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::BusError;
use crate::routing::MessageRouter;
use crate::sending::{ChannelGraph, OutgoingSender};

/// Routes envelopes and hands them to the sending agent of each destination.
///
/// An envelope with a destination goes straight to that destination. An
/// envelope without one is routed by message type; with several routes the
/// first destination keeps the envelope id and the others get copies with
/// ids of their own.
pub struct EnvelopeSender {
    service_name: String,
    router: MessageRouter,
    channels: Arc<ChannelGraph>,
}

impl EnvelopeSender {
    pub fn new(service_name: impl Into<String>, router: MessageRouter, channels: Arc<ChannelGraph>) -> Self {
        Self {
            service_name: service_name.into(),
            router,
            channels,
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub async fn send(&self, mut envelope: Envelope) -> Result<Vec<Uuid>, BusError> {
        if envelope.source.is_none() {
            envelope.source = Some(self.service_name.clone());
        }
        if envelope.message_type.is_none() {
            envelope.message_type = envelope
                .message
                .as_ref()
                .map(|message| message.message_type().to_string());
        }

        if let Some(destination) = envelope.destination.clone() {
            return Ok(vec![self.dispatch(&destination, envelope).await?]);
        }

        let message_type = envelope.message_type.clone().unwrap_or_default();
        let routes = self.router.route(&message_type).await?;
        if routes.is_empty() {
            return Err(BusError::NoRoutes(message_type));
        }

        let mut ids = Vec::with_capacity(routes.len());
        for (index, route) in routes.into_iter().enumerate() {
            let mut outgoing = envelope.copy_for(route.destination.clone(), &route.content_type);
            if index == 0 {
                outgoing.id = envelope.id;
            }
            ids.push(self.dispatch(&route.destination, outgoing).await?);
        }
        Ok(ids)
    }

    async fn dispatch(&self, destination: &Url, envelope: Envelope) -> Result<Uuid, BusError> {
        let agent = self.channels.get_or_build(destination)?;
        let id = envelope.id;
        debug!(envelope = %envelope, durable = agent.is_durable(), "sending");
        if agent.is_durable() {
            agent.store_and_forward(envelope).await?;
        } else {
            agent.enqueue_outgoing(envelope).await?;
        }
        Ok(id)
    }
}

#[async_trait]
impl OutgoingSender for EnvelopeSender {
    async fn send_envelope(&self, envelope: Envelope) -> Result<Vec<Uuid>, BusError> {
        self.send(envelope).await
    }
}
