//! Durable outbox/inbox storage.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ EnvelopePersistence (shared by every component on a node)     │
//! │  persist incoming / scheduled / outgoing, mark complete,      │
//! │  attempts, dead letters, counts                               │
//! └───────────────────────────────────────────────────────────────┘
//!                              │ connect()
//!                              ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │ StoreSession (one per resiliency agent connection)            │
//! │  node lock, heartbeat, scheduled claims, ownership queries,   │
//! │  dormant node detection, reassignment                         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A session owns the node lock it acquired. When the session's
//! connection is lost the lock goes with it, and every further call on the
//! session fails with [`PersistenceError::ConnectionLost`].

mod in_memory;
mod node_locks;

pub use in_memory::{InMemoryEnvelopeStore, InMemorySession, StoreOperation};
pub use node_locks::{NodeLockTable, SessionId};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NodeId;
use crate::envelope::Envelope;
use crate::error::PersistenceError;

/// Lifecycle state of a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    Incoming,
    Scheduled,
    Outgoing,
}

impl EnvelopeStatus {
    pub fn direction(self) -> Direction {
        match self {
            EnvelopeStatus::Incoming | EnvelopeStatus::Scheduled => Direction::Incoming,
            EnvelopeStatus::Outgoing => Direction::Outgoing,
        }
    }
}

/// Inbox or outbox side of the store. The same envelope id may exist on both
/// sides when two nodes share one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Durable shadow of an envelope. `owner == None` marks the record as
/// eligible for any live node to claim.
#[derive(Debug, Clone)]
pub struct PersistedEnvelope {
    pub envelope: Envelope,
    pub status: EnvelopeStatus,
    pub owner: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounts {
    pub incoming: usize,
    pub scheduled: usize,
    pub outgoing: usize,
    pub dead_letters: usize,
}

/// An envelope that failed permanently.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub direction: Direction,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Store operations used by listeners, worker queues and sending agents.
#[async_trait]
pub trait EnvelopePersistence: Send + Sync {
    /// Write incoming records. Envelopes with a future execution time are
    /// stored as scheduled and left unowned.
    async fn persist_incoming(
        &self,
        owner: NodeId,
        envelopes: &[Envelope],
    ) -> Result<(), PersistenceError>;

    async fn persist_outgoing(
        &self,
        owner: NodeId,
        envelopes: &[Envelope],
    ) -> Result<(), PersistenceError>;

    /// Remove completed incoming records. Unknown ids are ignored, so
    /// completing twice is harmless.
    async fn mark_complete(&self, ids: &[Uuid]) -> Result<(), PersistenceError>;

    /// Remove delivered outgoing records. Unknown ids are ignored.
    async fn delete_outgoing(&self, ids: &[Uuid]) -> Result<(), PersistenceError>;

    /// Record the envelopes' current attempt counts. Stored counts never
    /// decrease.
    async fn increment_attempts(
        &self,
        direction: Direction,
        envelopes: &[Envelope],
    ) -> Result<(), PersistenceError>;

    /// Park an incoming envelope until its execution time. The record becomes
    /// scheduled and unowned.
    async fn schedule_execution(&self, envelope: &Envelope) -> Result<(), PersistenceError>;

    /// Remove the record and keep the envelope in the error sink.
    async fn move_to_dead_letter(
        &self,
        direction: Direction,
        envelope: &Envelope,
        error: &str,
    ) -> Result<(), PersistenceError>;

    /// Give up this node's claim on incoming records so that incoming
    /// recovery can pick them up again.
    async fn release_incoming(&self, ids: &[Uuid]) -> Result<(), PersistenceError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PersistenceError>;

    async fn persisted_counts(&self) -> Result<PersistedCounts, PersistenceError>;

    /// Administrative reset: drops records, dead letters and heartbeats.
    async fn delete_all(&self) -> Result<(), PersistenceError>;

    /// Open a dedicated session for the resiliency agent.
    async fn connect(&self) -> Result<Box<dyn StoreSession>, PersistenceError>;
}

/// A dedicated connection to the store, holding at most one node lock.
#[async_trait]
pub trait StoreSession: Send + Sync {
    fn is_open(&self) -> bool;

    /// Try to take the exclusive lock for `node`. `Ok(false)` means another
    /// session holds it.
    async fn acquire_node_lock(&self, node: NodeId) -> Result<bool, PersistenceError>;

    async fn release_node_lock(&self, node: NodeId) -> Result<(), PersistenceError>;

    /// Renew the liveness signal for `node`. Fails with
    /// [`PersistenceError::LockNotHeld`] when this session lost the lock.
    async fn heartbeat(&self, node: NodeId) -> Result<(), PersistenceError>;

    /// Claim scheduled records due at `before`: they become incoming records
    /// owned by `node` and are returned in persistence order.
    async fn scheduled_before(
        &self,
        node: NodeId,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, PersistenceError>;

    async fn owned_incoming(
        &self,
        owner: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<Envelope>, PersistenceError>;

    async fn owned_outgoing(
        &self,
        owner: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<Envelope>, PersistenceError>;

    /// Unconditionally set the owner of the given records.
    async fn reassign(
        &self,
        direction: Direction,
        ids: &[Uuid],
        owner: Option<NodeId>,
    ) -> Result<(), PersistenceError>;

    /// Take ownership of the given records that are still unowned. Returns
    /// the ids actually claimed.
    async fn claim(
        &self,
        direction: Direction,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Uuid>, PersistenceError>;

    /// Nodes other than `exclude` whose last heartbeat is older than
    /// `threshold`.
    async fn dormant_node_ids(
        &self,
        threshold: Duration,
        exclude: NodeId,
    ) -> Result<Vec<NodeId>, PersistenceError>;

    /// Make every record owned by `node` unowned and forget its heartbeat.
    /// Returns the number of records released.
    async fn release_node_records(&self, node: NodeId) -> Result<usize, PersistenceError>;

    async fn close(&self);
}
