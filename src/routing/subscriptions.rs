use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionRole {
    /// Messages of this type are published to the destination.
    Publishes,
    /// The destination consumes messages of this type.
    Subscribes,
}

/// Declares that `message_type` flows to `destination`, which accepts the
/// listed content types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub message_type: String,
    pub destination: Url,
    /// Empty means JSON only.
    pub accepts: Vec<String>,
    pub role: SubscriptionRole,
    pub service_name: String,
}

impl Subscription {
    pub fn publishes(message_type: impl Into<String>, destination: Url) -> Self {
        Self {
            message_type: message_type.into(),
            destination,
            accepts: Vec::new(),
            role: SubscriptionRole::Publishes,
            service_name: String::new(),
        }
    }

    pub fn subscribes(message_type: impl Into<String>, destination: Url) -> Self {
        Self {
            role: SubscriptionRole::Subscribes,
            ..Self::publishes(message_type, destination)
        }
    }

    pub fn accepting<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepts = content_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    fn same_slot(&self, other: &Subscription) -> bool {
        self.message_type == other.message_type
            && self.destination == other.destination
            && self.role == other.role
    }
}

/// Storage for subscriptions, looked up by (message type, role).
#[async_trait]
pub trait SubscriptionsRepository: Send + Sync {
    /// Insert or replace subscriptions keyed by (message type, destination, role).
    async fn persist(&self, subscriptions: &[Subscription]) -> Result<(), PersistenceError>;

    async fn remove(&self, subscriptions: &[Subscription]) -> Result<(), PersistenceError>;

    async fn all(&self) -> Result<Vec<Subscription>, PersistenceError>;

    async fn find(
        &self,
        message_type: &str,
        role: SubscriptionRole,
    ) -> Result<Vec<Subscription>, PersistenceError>;
}

/// Subscription storage held in process memory.
#[derive(Debug, Default)]
pub struct InMemorySubscriptions {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl InMemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(subscriptions: Vec<Subscription>) -> Self {
        Self {
            subscriptions: RwLock::new(subscriptions),
        }
    }
}

#[async_trait]
impl SubscriptionsRepository for InMemorySubscriptions {
    async fn persist(&self, subscriptions: &[Subscription]) -> Result<(), PersistenceError> {
        let mut all = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for subscription in subscriptions {
            match all.iter_mut().find(|s| s.same_slot(subscription)) {
                Some(existing) => *existing = subscription.clone(),
                None => all.push(subscription.clone()),
            }
        }
        Ok(())
    }

    async fn remove(&self, subscriptions: &[Subscription]) -> Result<(), PersistenceError> {
        let mut all = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        all.retain(|s| !subscriptions.iter().any(|r| r.same_slot(s)));
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Subscription>, PersistenceError> {
        Ok(self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn find(
        &self,
        message_type: &str,
        role: SubscriptionRole,
    ) -> Result<Vec<Subscription>, PersistenceError> {
        Ok(self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.message_type == message_type && s.role == role)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn find_filters_by_type_and_role() {
        let repo = InMemorySubscriptions::new();
        repo.persist(&[
            Subscription::publishes("A", uri("tcp://one:2201")),
            Subscription::subscribes("A", uri("tcp://two:2201")),
            Subscription::publishes("B", uri("tcp://three:2201")),
        ])
        .await
        .unwrap();

        let found = repo.find("A", SubscriptionRole::Publishes).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].destination, uri("tcp://one:2201"));
    }

    #[tokio::test]
    async fn persist_replaces_same_slot() {
        let repo = InMemorySubscriptions::new();
        repo.persist(&[Subscription::publishes("A", uri("tcp://one:2201"))])
            .await
            .unwrap();
        repo.persist(&[Subscription::publishes("A", uri("tcp://one:2201")).accepting(["binary/bitcode"])])
            .await
            .unwrap();

        let all = repo.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].accepts, vec!["binary/bitcode".to_string()]);
    }

    #[tokio::test]
    async fn remove_drops_matching_subscriptions() {
        let sub = Subscription::publishes("A", uri("tcp://one:2201"));
        let repo = InMemorySubscriptions::with(vec![sub.clone()]);
        repo.remove(&[sub]).await.unwrap();
        assert!(repo.all().await.unwrap().is_empty());
    }
}
