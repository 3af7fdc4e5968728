//! durable_bus: a durable message bus runtime.
//!
//! Applications hand messages to a [`ServiceBus`]; the runtime routes them,
//! batches them per destination, moves them over a transport and executes
//! them in local worker queues on the receiving node. Durable endpoints
//! keep an outbox/inbox record for every envelope, and a per-node
//! resiliency agent recovers work left behind by crashed or partitioned
//! nodes.
//!
//! ```text
//! ServiceBus ─► EnvelopeSender ─► MessageRouter
//!                    │
//!                    ▼
//!              ChannelGraph ─► SendingAgent ─► BatchedSender ─► Transport
//!                                                                  │
//!   handler ◄─ HandlerPipeline ◄─ WorkerQueue ◄─ Listener ◄────────┘
//!                    │
//!                    ▼
//!          EnvelopePersistence ◄─ SchedulingAgent (resiliency)
//! ```
//!
//! Delivery is at least once. Envelope ids survive every retry, so
//! handlers that must not run twice can deduplicate on
//! [`Envelope::id`](envelope::Envelope).

pub mod bus;
pub mod config;
pub mod envelope;
mod error;
pub mod metrics;
pub mod persistence;
pub mod resiliency;
pub mod routing;
pub mod sending;
pub mod serialization;
pub mod transport;
pub mod workers;

pub use bus::{MessagingBuilder, MessagingRoot, RequestOptions, ServiceBus};
pub use config::{BusSettings, DurabilitySettings, ListenerSettings, NodeId};
pub use envelope::{Envelope, Message};
pub use error::{BusError, HandlerError, PersistenceError, SerializationError, TransportEndpointError};
pub use workers::{ErrorPolicy, HandlerGraph};
