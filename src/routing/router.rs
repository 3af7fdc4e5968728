use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::subscriptions::{SubscriptionRole, SubscriptionsRepository};
use crate::config::PublishingRule;
use crate::envelope::UriExt;
use crate::error::BusError;
use crate::serialization::SerializerGraph;

/// A resolved (destination, content type) pair for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRoute {
    pub message_type: String,
    pub destination: Url,
    pub content_type: String,
}

/// Resolves message types to routes from static publishing rules and the
/// subscription store. Nothing is cached: every call reads the current
/// subscriptions.
pub struct MessageRouter {
    rules: Vec<PublishingRule>,
    subscriptions: Arc<dyn SubscriptionsRepository>,
    serializers: SerializerGraph,
}

impl MessageRouter {
    pub fn new(
        rules: Vec<PublishingRule>,
        subscriptions: Arc<dyn SubscriptionsRepository>,
        serializers: SerializerGraph,
    ) -> Self {
        Self {
            rules,
            subscriptions,
            serializers,
        }
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionsRepository> {
        &self.subscriptions
    }

    pub fn serializers(&self) -> &SerializerGraph {
        &self.serializers
    }

    /// One route per destination. Destinations whose accepted content types
    /// this node cannot write are skipped. An unrouted type yields an empty
    /// list.
    pub async fn route(&self, message_type: &str) -> Result<Vec<MessageRoute>, BusError> {
        let mut routes: Vec<MessageRoute> = Vec::new();

        for rule in self.rules.iter().filter(|r| r.message_type == message_type) {
            let accepted: Vec<String> = rule.content_type.iter().cloned().collect();
            push_route(&mut routes, &self.serializers, message_type, &rule.destination, &accepted);
        }

        let subscriptions = self
            .subscriptions
            .find(message_type, SubscriptionRole::Publishes)
            .await?;
        for subscription in &subscriptions {
            push_route(
                &mut routes,
                &self.serializers,
                message_type,
                &subscription.destination,
                &subscription.accepts,
            );
        }

        if routes.is_empty() {
            debug!(message_type, "no routes resolved");
        }
        Ok(routes)
    }
}

fn push_route(
    routes: &mut Vec<MessageRoute>,
    serializers: &SerializerGraph,
    message_type: &str,
    destination: &Url,
    accepted: &[String],
) {
    let key = destination.endpoint_key();
    if routes.iter().any(|r| r.destination.endpoint_key() == key) {
        return;
    }
    match serializers.choose_content_type(accepted) {
        Some(content_type) => routes.push(MessageRoute {
            message_type: message_type.to_string(),
            destination: destination.clone(),
            content_type,
        }),
        None => debug!(
            message_type,
            destination = %destination,
            ?accepted,
            "destination accepts no content type this node can write"
        ),
    }
}
