use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::BusError;

/// Pending reply watches keyed by the id of the envelope awaiting an answer.
#[derive(Debug, Default)]
pub struct ReplyWatcher {
    watches: Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
}

impl ReplyWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn watches(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Envelope>>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a watch for replies to envelope `id`.
    pub fn start_watch(self: &Arc<Self>, id: Uuid) -> ReplyWatch {
        let (sender, receiver) = oneshot::channel();
        self.watches().insert(id, sender);
        ReplyWatch {
            id,
            receiver,
            watcher: Arc::clone(self),
        }
    }

    /// Hand a response to its watch. Returns false when nobody is waiting.
    pub fn deliver(&self, envelope: &Envelope) -> bool {
        let Some(original) = envelope.response_id else {
            return false;
        };
        match self.watches().remove(&original) {
            Some(sender) => {
                debug!(envelope_id = %original, "reply delivered to watch");
                sender.send(envelope.clone()).is_ok()
            }
            None => false,
        }
    }

    pub fn has_watch(&self, id: Uuid) -> bool {
        self.watches().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.watches().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches().is_empty()
    }

    fn remove(&self, id: Uuid) {
        self.watches().remove(&id);
    }
}

/// A registered watch. Dropping it removes the registration.
#[derive(Debug)]
pub struct ReplyWatch {
    id: Uuid,
    receiver: oneshot::Receiver<Envelope>,
    watcher: Arc<ReplyWatcher>,
}

impl ReplyWatch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the reply envelope, failing with [`BusError::Timeout`].
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope, BusError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(BusError::ReplyAbandoned(self.id)),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

impl Drop for ReplyWatch {
    fn drop(&mut self) {
        self.watcher.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_to(id: Uuid) -> Envelope {
        let mut envelope = Envelope::new();
        envelope.response_id = Some(id);
        envelope
    }

    #[tokio::test]
    async fn delivers_matching_reply() {
        let watcher = Arc::new(ReplyWatcher::new());
        let id = Uuid::new_v4();
        let watch = watcher.start_watch(id);

        assert!(watcher.deliver(&response_to(id)));
        let reply = watch.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.response_id, Some(id));
        assert!(watcher.is_empty());
    }

    #[tokio::test]
    async fn unmatched_reply_is_not_delivered() {
        let watcher = Arc::new(ReplyWatcher::new());
        let _watch = watcher.start_watch(Uuid::new_v4());
        assert!(!watcher.deliver(&response_to(Uuid::new_v4())));
        assert!(!watcher.deliver(&Envelope::new()));
        assert_eq!(watcher.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_watch() {
        let watcher = Arc::new(ReplyWatcher::new());
        let id = Uuid::new_v4();
        let watch = watcher.start_watch(id);

        let err = watch.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!watcher.has_watch(id));
    }

    #[tokio::test]
    async fn dropping_watch_removes_registration() {
        let watcher = Arc::new(ReplyWatcher::new());
        let id = Uuid::new_v4();
        drop(watcher.start_watch(id));
        assert!(!watcher.has_watch(id));
    }
}
