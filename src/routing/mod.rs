//! Subscriptions and message routing.

mod router;
mod subscriptions;

pub use router::{MessageRoute, MessageRouter};
pub use subscriptions::{InMemorySubscriptions, Subscription, SubscriptionRole, SubscriptionsRepository};
