use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actions::{
    ReassignFromDormantNodes, RecoverIncomingMessages, RecoverOutgoingMessages, RunScheduledJobs,
};
use super::{AgentContext, MessagingAction};
use crate::error::{BusError, PersistenceError};
use crate::persistence::StoreSession;

/// Where the agent is in its connect/lock cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    LockAcquired,
}

/// Keeps one store session open for the node, holds the node lock and runs
/// the reconciliation actions on their own cadences.
pub struct SchedulingAgent {
    context: AgentContext,
    actions: Vec<Box<dyn MessagingAction>>,
}

impl SchedulingAgent {
    pub fn new(context: AgentContext) -> Self {
        Self {
            context,
            actions: vec![
                Box::new(RunScheduledJobs),
                Box::new(RecoverIncomingMessages),
                Box::new(RecoverOutgoingMessages),
                Box::new(ReassignFromDormantNodes),
            ],
        }
    }

    /// Replace the default action set.
    pub fn with_actions(mut self, actions: Vec<Box<dyn MessagingAction>>) -> Self {
        self.actions = actions;
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> AgentHandle {
        let (state, watch) = watch::channel(ConnectionState::Disconnected);
        let join = tokio::spawn(self.run(cancel, state));
        AgentHandle { state: watch, join }
    }

    async fn run(self, cancel: CancellationToken, state: watch::Sender<ConnectionState>) {
        let node = self.context.node_id;
        let mut due = vec![Instant::now(); self.actions.len()];

        while !cancel.is_cancelled() {
            state.send_replace(ConnectionState::Connecting);
            let session = match self.connect().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(%node, error = %e, "resiliency agent could not take the node lock");
                    state.send_replace(ConnectionState::Disconnected);
                    if !self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            info!(%node, "resiliency agent holds the node lock");
            state.send_replace(ConnectionState::LockAcquired);

            match self.serve(session.as_ref(), &cancel, &mut due).await {
                Ok(()) => {
                    self.release(session.as_ref()).await;
                    break;
                }
                Err(e) => {
                    warn!(%node, error = %e, "resiliency agent lost its store session");
                    session.close().await;
                    state.send_replace(ConnectionState::Disconnected);
                    if !self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }

        state.send_replace(ConnectionState::Disconnected);
        debug!(%node, "resiliency agent stopped");
    }

    async fn connect(&self) -> Result<Box<dyn StoreSession>, BusError> {
        let node = self.context.node_id;
        let session = self.context.persistence.connect().await?;
        match session.acquire_node_lock(node).await {
            Ok(true) => Ok(session),
            Ok(false) => {
                session.close().await;
                Err(PersistenceError::LockNotHeld(node.to_string()).into())
            }
            Err(e) => {
                session.close().await;
                Err(e.into())
            }
        }
    }

    /// Run passes until cancelled (`Ok`) or the session fails (`Err`).
    async fn serve(
        &self,
        session: &dyn StoreSession,
        cancel: &CancellationToken,
        due: &mut [Instant],
    ) -> Result<(), BusError> {
        let node = self.context.node_id;
        let durability = &self.context.durability;
        // Several heartbeats per threshold, whatever the action cadences.
        let heartbeat_every = (durability.dormant_node_threshold() / 4).max(Duration::from_millis(1));

        loop {
            session.heartbeat(node).await?;

            let now = Instant::now();
            for (action, next) in self.actions.iter().zip(due.iter_mut()) {
                if *next > now {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match action.execute(session, &self.context).await {
                    Ok(()) => {}
                    Err(e) if e.is_connection_failure() => return Err(e),
                    Err(e) => error!(%node, action = action.name(), error = %e, "resiliency action failed"),
                }
                *next = Instant::now() + action.interval(durability);
            }

            let wake = due
                .iter()
                .copied()
                .min()
                .unwrap_or(now)
                .min(Instant::now() + heartbeat_every);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep_until(wake) => {}
            }
        }
    }

    /// Wait out the reconnect delay. `false` when cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.context.durability.reconnect_delay()) => true,
        }
    }

    /// Graceful exit: hand this node's records to the other nodes and drop
    /// the lock.
    async fn release(&self, session: &dyn StoreSession) {
        let node = self.context.node_id;
        match session.release_node_records(node).await {
            Ok(released) => info!(%node, released, "released node records on shutdown"),
            Err(e) => warn!(%node, error = %e, "could not release node records"),
        }
        if let Err(e) = session.release_node_lock(node).await {
            warn!(%node, error = %e, "could not release node lock");
        }
        session.close().await;
    }
}

/// Handle on a running [`SchedulingAgent`].
pub struct AgentHandle {
    state: watch::Receiver<ConnectionState>,
    join: JoinHandle<()>,
}

impl AgentHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver following every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolve once the agent reaches `target`.
    pub async fn wait_for(&mut self, target: ConnectionState) -> Result<(), BusError> {
        self.state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| BusError::Shutdown)
    }

    /// Wait for the agent task to finish after its token was cancelled.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(error = %e, "resiliency agent task failed");
        }
    }
}
