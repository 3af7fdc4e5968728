//! Local worker queues: the boundary between "received" and "executed".
//!
//! ```text
//!  listener / loopback / resiliency agent
//!                 │
//!                 ▼
//!   WorkerQueue (lightweight | durable)
//!     enqueue ─► WorkerExecutor ─► HandlerPipeline ─► handler
//!                                         │
//!                                         ▼
//!        MessageCallback: mark_complete | requeue | move_to_errors
//!                         | move_to_delayed_until
//! ```
//!
//! Lightweight queues keep work only in memory. Durable queues write an
//! incoming record before execution and update it from the callback.

mod durable;
mod error_policy;
mod executor;
mod handlers;
mod lightweight;
mod pipeline;
mod registry;

pub use durable::DurableWorkerQueue;
pub use error_policy::{Continuation, ErrorAction, ErrorPolicy};
pub use executor::WorkerExecutor;
pub use handlers::{HandlerGraph, HandlerResult};
pub use lightweight::LightweightWorkerQueue;
pub use pipeline::HandlerPipeline;
pub use registry::WorkerRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::envelope::Envelope;
use crate::error::BusError;

/// Completion surface handed to the pipeline with every execution.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    /// Success: forget the envelope. Completing twice is harmless.
    async fn mark_complete(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// Run the envelope again. The id and attempt count are kept.
    async fn requeue(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Terminal failure: the envelope lands in the error sink.
    async fn move_to_errors(&self, envelope: &Envelope, error: &str) -> Result<(), BusError>;

    /// Run the envelope again at or after `at`.
    async fn move_to_delayed_until(
        &self,
        envelope: Envelope,
        at: DateTime<Utc>,
    ) -> Result<(), BusError>;
}

/// A local queue feeding the handler pipeline.
#[async_trait]
pub trait WorkerQueue: MessageCallback {
    fn address(&self) -> &Url;

    fn is_durable(&self) -> bool;

    /// Envelopes waiting or executing, including delayed ones held locally.
    fn queued_count(&self) -> usize;

    /// Accept one envelope from this node. Durable queues persist it first.
    async fn enqueue(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Execute an envelope whose record already exists in the store.
    async fn enqueue_persisted(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Hold an envelope until its execution time.
    async fn schedule_execution(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Accept a batch from a listener. Returns once the batch is safe to
    /// acknowledge: persisted for durable queues, queued for lightweight ones.
    async fn receive(&self, envelopes: Vec<Envelope>) -> Result<(), BusError>;
}
