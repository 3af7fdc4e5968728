use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::node_locks::{NodeLockTable, SessionId};
use super::{
    DeadLetter, Direction, EnvelopePersistence, EnvelopeStatus, PersistedCounts,
    PersistedEnvelope, StoreSession,
};
use crate::config::NodeId;
use crate::envelope::Envelope;
use crate::error::PersistenceError;

#[derive(Debug)]
struct Record {
    seq: u64,
    persisted: PersistedEnvelope,
}

/// Store writes that tests can make fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    IncrementAttempts,
    ScheduleExecution,
    MoveToDeadLetter,
    ReleaseIncoming,
}

#[derive(Debug)]
struct State {
    records: HashMap<(Direction, Uuid), Record>,
    next_seq: u64,
    dead_letters: Vec<DeadLetter>,
    heartbeats: HashMap<NodeId, DateTime<Utc>>,
    locks: NodeLockTable,
    open_sessions: HashSet<SessionId>,
    next_session: SessionId,
    accepting_connections: bool,
    connections_opened: usize,
    lock_acquisitions: usize,
    injected_failures: HashMap<StoreOperation, usize>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            next_seq: 0,
            dead_letters: Vec::new(),
            heartbeats: HashMap::new(),
            locks: NodeLockTable::new(),
            open_sessions: HashSet::new(),
            next_session: 1,
            accepting_connections: true,
            connections_opened: 0,
            lock_acquisitions: 0,
            injected_failures: HashMap::new(),
        }
    }
}

impl State {
    fn insert(&mut self, envelope: &Envelope, status: EnvelopeStatus, owner: Option<NodeId>) {
        let key = (status.direction(), envelope.id);
        if self.records.contains_key(&key) {
            return;
        }
        self.next_seq += 1;
        self.records.insert(
            key,
            Record {
                seq: self.next_seq,
                persisted: PersistedEnvelope {
                    envelope: envelope.clone(),
                    status,
                    owner,
                },
            },
        );
    }

    fn touch_node(&mut self, node: NodeId) {
        self.heartbeats.entry(node).or_insert_with(Utc::now);
    }

    /// Records matching `filter`, oldest first.
    fn select<F>(&self, limit: usize, filter: F) -> Vec<&Record>
    where
        F: Fn(&PersistedEnvelope) -> bool,
    {
        let mut selected: Vec<&Record> = self
            .records
            .values()
            .filter(|r| filter(&r.persisted))
            .collect();
        selected.sort_by_key(|r| r.seq);
        selected.truncate(limit);
        selected
    }

    fn injected(&mut self, operation: StoreOperation) -> Result<(), PersistenceError> {
        match self.injected_failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(PersistenceError::Unavailable(format!("injected {operation:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn ensure_open(&self, session: SessionId) -> Result<(), PersistenceError> {
        if self.open_sessions.contains(&session) {
            Ok(())
        } else {
            Err(PersistenceError::ConnectionLost)
        }
    }
}

/// Envelope store held in process memory.
///
/// Clones share the same state, so several nodes in one test process can
/// coordinate through one store exactly as they would through a database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEnvelopeStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every record, oldest first.
    pub fn records(&self) -> Vec<PersistedEnvelope> {
        let state = self.state();
        state
            .select(usize::MAX, |_| true)
            .into_iter()
            .map(|r| r.persisted.clone())
            .collect()
    }

    pub fn record(&self, direction: Direction, id: Uuid) -> Option<PersistedEnvelope> {
        self.state()
            .records
            .get(&(direction, id))
            .map(|r| r.persisted.clone())
    }

    /// Simulate a network partition: every open session is closed and the
    /// node locks they held are released.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let sessions: Vec<SessionId> = state.open_sessions.drain().collect();
        for session in sessions {
            state.locks.release_session(session);
        }
        debug!("in-memory store dropped all connections");
    }

    /// Refuse (or accept again) new sessions.
    pub fn set_accepting_connections(&self, accepting: bool) {
        self.state().accepting_connections = accepting;
    }

    pub fn set_heartbeat(&self, node: NodeId, at: DateTime<Utc>) {
        self.state().heartbeats.insert(node, at);
    }

    pub fn heartbeat_of(&self, node: NodeId) -> Option<DateTime<Utc>> {
        self.state().heartbeats.get(&node).copied()
    }

    pub fn lock_holder(&self, node: NodeId) -> Option<SessionId> {
        self.state().locks.holder(node)
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.state().lock_acquisitions
    }

    /// Make the next `times` calls of `operation` fail with
    /// [`PersistenceError::Unavailable`].
    pub fn fail_next(&self, operation: StoreOperation, times: usize) {
        self.state().injected_failures.insert(operation, times);
    }
}

#[async_trait]
impl EnvelopePersistence for InMemoryEnvelopeStore {
    async fn persist_incoming(
        &self,
        owner: NodeId,
        envelopes: &[Envelope],
    ) -> Result<(), PersistenceError> {
        let now = Utc::now();
        let mut state = self.state();
        state.touch_node(owner);
        for envelope in envelopes {
            if envelope.is_delayed(now) {
                state.insert(envelope, EnvelopeStatus::Scheduled, None);
            } else {
                state.insert(envelope, EnvelopeStatus::Incoming, Some(owner));
            }
        }
        Ok(())
    }

    async fn persist_outgoing(
        &self,
        owner: NodeId,
        envelopes: &[Envelope],
    ) -> Result<(), PersistenceError> {
        let mut state = self.state();
        state.touch_node(owner);
        for envelope in envelopes {
            state.insert(envelope, EnvelopeStatus::Outgoing, Some(owner));
        }
        Ok(())
    }

    async fn mark_complete(&self, ids: &[Uuid]) -> Result<(), PersistenceError> {
        let mut state = self.state();
        for id in ids {
            state.records.remove(&(Direction::Incoming, *id));
        }
        Ok(())
    }

    async fn delete_outgoing(&self, ids: &[Uuid]) -> Result<(), PersistenceError> {
        let mut state = self.state();
        for id in ids {
            state.records.remove(&(Direction::Outgoing, *id));
        }
        Ok(())
    }

    async fn increment_attempts(
        &self,
        direction: Direction,
        envelopes: &[Envelope],
    ) -> Result<(), PersistenceError> {
        let mut state = self.state();
        state.injected(StoreOperation::IncrementAttempts)?;
        for envelope in envelopes {
            if let Some(record) = state.records.get_mut(&(direction, envelope.id)) {
                let stored = &mut record.persisted.envelope.attempts;
                *stored = (*stored).max(envelope.attempts);
            }
        }
        Ok(())
    }

    async fn schedule_execution(&self, envelope: &Envelope) -> Result<(), PersistenceError> {
        let mut state = self.state();
        state.injected(StoreOperation::ScheduleExecution)?;
        let key = (Direction::Incoming, envelope.id);
        if !state.records.contains_key(&key) {
            state.insert(envelope, EnvelopeStatus::Scheduled, None);
            return Ok(());
        }
        if let Some(record) = state.records.get_mut(&key) {
            let attempts = record.persisted.envelope.attempts.max(envelope.attempts);
            record.persisted.envelope = envelope.clone();
            record.persisted.envelope.attempts = attempts;
            record.persisted.status = EnvelopeStatus::Scheduled;
            record.persisted.owner = None;
        }
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        direction: Direction,
        envelope: &Envelope,
        error: &str,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state();
        state.injected(StoreOperation::MoveToDeadLetter)?;
        state.records.remove(&(direction, envelope.id));
        state.dead_letters.push(DeadLetter {
            envelope: envelope.clone(),
            direction,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn release_incoming(&self, ids: &[Uuid]) -> Result<(), PersistenceError> {
        let mut state = self.state();
        state.injected(StoreOperation::ReleaseIncoming)?;
        for id in ids {
            if let Some(record) = state.records.get_mut(&(Direction::Incoming, *id)) {
                if record.persisted.status == EnvelopeStatus::Incoming {
                    record.persisted.owner = None;
                }
            }
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PersistenceError> {
        Ok(self.state().dead_letters.clone())
    }

    async fn persisted_counts(&self) -> Result<PersistedCounts, PersistenceError> {
        let state = self.state();
        let mut counts = PersistedCounts {
            dead_letters: state.dead_letters.len(),
            ..PersistedCounts::default()
        };
        for record in state.records.values() {
            match record.persisted.status {
                EnvelopeStatus::Incoming => counts.incoming += 1,
                EnvelopeStatus::Scheduled => counts.scheduled += 1,
                EnvelopeStatus::Outgoing => counts.outgoing += 1,
            }
        }
        Ok(counts)
    }

    async fn delete_all(&self) -> Result<(), PersistenceError> {
        let mut state = self.state();
        state.records.clear();
        state.dead_letters.clear();
        state.heartbeats.clear();
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn StoreSession>, PersistenceError> {
        let mut state = self.state();
        if !state.accepting_connections {
            return Err(PersistenceError::Unavailable(
                "store is not accepting connections".into(),
            ));
        }
        let id = state.next_session;
        state.next_session += 1;
        state.open_sessions.insert(id);
        state.connections_opened += 1;
        Ok(Box::new(InMemorySession {
            id,
            state: self.state.clone(),
        }))
    }
}

/// A session on an [`InMemoryEnvelopeStore`].
#[derive(Debug)]
pub struct InMemorySession {
    id: SessionId,
    state: Arc<Mutex<State>>,
}

impl InMemorySession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Lock the shared state, failing when this session was closed.
    fn open_state(&self) -> Result<MutexGuard<'_, State>, PersistenceError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ensure_open(self.id)?;
        Ok(state)
    }

    fn owned(
        &self,
        direction: Direction,
        owner: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<Envelope>, PersistenceError> {
        let state = self.open_state()?;
        let wanted = match direction {
            Direction::Incoming => EnvelopeStatus::Incoming,
            Direction::Outgoing => EnvelopeStatus::Outgoing,
        };
        Ok(state
            .select(limit, |p| p.status == wanted && p.owner == owner)
            .into_iter()
            .map(|r| r.persisted.envelope.clone())
            .collect())
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open_sessions
            .contains(&self.id)
    }

    async fn acquire_node_lock(&self, node: NodeId) -> Result<bool, PersistenceError> {
        let mut state = self.open_state()?;
        let acquired = state.locks.try_acquire(node, self.id);
        if acquired {
            state.lock_acquisitions += 1;
        }
        Ok(acquired)
    }

    async fn release_node_lock(&self, node: NodeId) -> Result<(), PersistenceError> {
        let mut state = self.open_state()?;
        state.locks.release(node, self.id);
        Ok(())
    }

    async fn heartbeat(&self, node: NodeId) -> Result<(), PersistenceError> {
        let mut state = self.open_state()?;
        if !state.locks.is_held_by(node, self.id) {
            return Err(PersistenceError::LockNotHeld(node.to_string()));
        }
        state.heartbeats.insert(node, Utc::now());
        Ok(())
    }

    async fn scheduled_before(
        &self,
        node: NodeId,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, PersistenceError> {
        let mut state = self.open_state()?;
        let due: Vec<(Direction, Uuid)> = state
            .select(limit, |p| {
                p.status == EnvelopeStatus::Scheduled
                    && p.envelope.execution_time.map_or(true, |at| at <= before)
            })
            .into_iter()
            .map(|r| (Direction::Incoming, r.persisted.envelope.id))
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for key in due {
            if let Some(record) = state.records.get_mut(&key) {
                record.persisted.status = EnvelopeStatus::Incoming;
                record.persisted.owner = Some(node);
                claimed.push(record.persisted.envelope.clone());
            }
        }
        Ok(claimed)
    }

    async fn owned_incoming(
        &self,
        owner: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<Envelope>, PersistenceError> {
        self.owned(Direction::Incoming, owner, limit)
    }

    async fn owned_outgoing(
        &self,
        owner: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<Envelope>, PersistenceError> {
        self.owned(Direction::Outgoing, owner, limit)
    }

    async fn reassign(
        &self,
        direction: Direction,
        ids: &[Uuid],
        owner: Option<NodeId>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.open_state()?;
        for id in ids {
            if let Some(record) = state.records.get_mut(&(direction, *id)) {
                record.persisted.owner = owner;
            }
        }
        Ok(())
    }

    async fn claim(
        &self,
        direction: Direction,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Uuid>, PersistenceError> {
        let mut state = self.open_state()?;
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(record) = state.records.get_mut(&(direction, *id)) {
                if record.persisted.owner.is_none()
                    && record.persisted.status != EnvelopeStatus::Scheduled
                {
                    record.persisted.owner = Some(node);
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn dormant_node_ids(
        &self,
        threshold: Duration,
        exclude: NodeId,
    ) -> Result<Vec<NodeId>, PersistenceError> {
        let state = self.open_state()?;
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| PersistenceError::Other(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let mut candidates: BTreeSet<NodeId> = state.heartbeats.keys().copied().collect();
        candidates.extend(state.records.values().filter_map(|r| r.persisted.owner));

        Ok(candidates
            .into_iter()
            .filter(|node| *node != exclude)
            .filter(|node| match state.heartbeats.get(node) {
                Some(last) => *last < cutoff,
                None => true,
            })
            .collect())
    }

    async fn release_node_records(&self, node: NodeId) -> Result<usize, PersistenceError> {
        let mut state = self.open_state()?;
        let mut released = 0;
        for record in state.records.values_mut() {
            if record.persisted.owner == Some(node) {
                record.persisted.owner = None;
                released += 1;
            }
        }
        state.heartbeats.remove(&node);
        Ok(released)
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open_sessions.remove(&self.id);
        state.locks.release_session(self.id);
    }
}
