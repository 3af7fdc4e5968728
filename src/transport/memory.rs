use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{ListeningAgent, ReceiverCallback, SenderProtocol, Transport};
use crate::config::ListenerSettings;
use crate::envelope::{BatchReply, OutgoingMessageBatch, UriExt, WireBatch};
use crate::error::BusError;

pub const MEMORY_SCHEME: &str = "memory";

#[derive(Default)]
struct HubState {
    receivers: HashMap<String, Arc<dyn ReceiverCallback>>,
    offline: HashSet<String>,
    transmissions: HashMap<String, usize>,
}

/// In-process network shared by every node of a test or a single-process
/// deployment. Batches are encoded to wire frames and decoded on the other
/// side, the same way a socket transport would.
///
/// Addresses can be taken offline to simulate an unreachable destination.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, uri: &Url, callback: Arc<dyn ReceiverCallback>) -> Result<(), BusError> {
        let mut state = self.state();
        let key = uri.endpoint_key();
        if state.receivers.contains_key(&key) {
            return Err(BusError::Transport(format!("{uri} is already in use")));
        }
        state.receivers.insert(key, callback);
        Ok(())
    }

    fn unregister(&self, uri: &Url) {
        self.state().receivers.remove(&uri.endpoint_key());
    }

    /// Make `uri` unreachable (`true`) or reachable again (`false`).
    pub fn set_offline(&self, uri: &Url, offline: bool) {
        let key = uri.endpoint_key();
        let mut state = self.state();
        if offline {
            state.offline.insert(key);
        } else {
            state.offline.remove(&key);
        }
    }

    pub fn is_listening(&self, uri: &Url) -> bool {
        self.state().receivers.contains_key(&uri.endpoint_key())
    }

    /// Batches, pings included, that reached `uri`.
    pub fn transmissions_to(&self, uri: &Url) -> usize {
        self.state()
            .transmissions
            .get(&uri.endpoint_key())
            .copied()
            .unwrap_or(0)
    }

    async fn deliver(&self, batch: &OutgoingMessageBatch) -> Result<BatchReply, BusError> {
        let key = batch.destination.endpoint_key();
        let receiver = {
            let mut state = self.state();
            if state.offline.contains(&key) {
                return Err(BusError::Transport(format!(
                    "{} is unreachable",
                    batch.destination
                )));
            }
            let receiver = state.receivers.get(&key).cloned().ok_or_else(|| {
                BusError::Transport(format!("nothing is listening at {}", batch.destination))
            })?;
            *state.transmissions.entry(key).or_default() += 1;
            receiver
        };

        let frame = WireBatch::from_batch(batch)?.to_bytes()?;
        let received = WireBatch::from_bytes(&frame)?;
        let destination = received.destination()?;
        let envelopes = received.into_envelopes()?;
        Ok(receiver.received(&destination, envelopes).await)
    }
}

/// Transport for `memory://` addresses.
pub struct MemoryTransport {
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl Transport for MemoryTransport {
    fn protocol(&self) -> &str {
        MEMORY_SCHEME
    }

    fn create_sender(&self, _uri: &Url) -> Result<Arc<dyn SenderProtocol>, BusError> {
        Ok(Arc::new(MemorySender {
            hub: self.hub.clone(),
        }))
    }

    fn build_listening_agent(
        &self,
        settings: &ListenerSettings,
    ) -> Result<Box<dyn ListeningAgent>, BusError> {
        Ok(Box::new(MemoryListeningAgent {
            address: settings.uri.clone(),
            hub: self.hub.clone(),
        }))
    }
}

struct MemorySender {
    hub: MemoryHub,
}

#[async_trait]
impl SenderProtocol for MemorySender {
    async fn send_batch(&self, batch: &OutgoingMessageBatch) -> Result<BatchReply, BusError> {
        self.hub.deliver(batch).await
    }
}

struct MemoryListeningAgent {
    address: Url,
    hub: MemoryHub,
}

#[async_trait]
impl ListeningAgent for MemoryListeningAgent {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn start(
        &self,
        callback: Arc<dyn ReceiverCallback>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        self.hub.register(&self.address, callback)?;
        debug!(listener = %self.address, "memory listener registered");

        let hub = self.hub.clone();
        let address = self.address.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            hub.unregister(&address);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Inbox {
        received: StdMutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl ReceiverCallback for Inbox {
        async fn received(&self, _destination: &Url, envelopes: Vec<Envelope>) -> BatchReply {
            self.received.lock().unwrap().extend(envelopes);
            BatchReply::Received
        }
    }

    fn uri() -> Url {
        Url::parse("memory://inbox").unwrap()
    }

    #[tokio::test]
    async fn batch_crosses_the_hub_as_a_frame() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());
        let inbox = Arc::new(Inbox::default());
        let agent = transport
            .build_listening_agent(&ListenerSettings::new(uri()))
            .unwrap();
        agent.start(inbox.clone(), CancellationToken::new()).await.unwrap();

        let envelope = Envelope::from_data("note", crate::serialization::JSON, b"\"hi\"".to_vec())
            .with_header("tenant", "a");
        let id = envelope.id;
        let sender = transport.create_sender(&uri()).unwrap();
        let reply = sender
            .send_batch(&OutgoingMessageBatch::new(uri(), vec![envelope]))
            .await
            .unwrap();

        assert_eq!(reply, BatchReply::Received);
        let received = inbox.received.lock().unwrap();
        assert_eq!(received[0].id, id);
        assert_eq!(received[0].headers.get("tenant").map(String::as_str), Some("a"));
        assert_eq!(hub.transmissions_to(&uri()), 1);
    }

    #[tokio::test]
    async fn offline_and_unknown_addresses_fail() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());
        let sender = transport.create_sender(&uri()).unwrap();
        let ping = OutgoingMessageBatch::for_ping(uri());
        assert!(sender.send_batch(&ping).await.is_err());

        let agent = transport
            .build_listening_agent(&ListenerSettings::new(uri()))
            .unwrap();
        agent
            .start(Arc::new(Inbox::default()), CancellationToken::new())
            .await
            .unwrap();
        hub.set_offline(&uri(), true);
        assert!(sender.send_batch(&ping).await.is_err());
        hub.set_offline(&uri(), false);
        assert_eq!(sender.send_batch(&ping).await.unwrap(), BatchReply::Received);
    }

    #[tokio::test]
    async fn address_can_only_be_bound_once() {
        let transport = MemoryTransport::new(MemoryHub::new());
        let settings = ListenerSettings::new(uri());
        let first = transport.build_listening_agent(&settings).unwrap();
        let second = transport.build_listening_agent(&settings).unwrap();
        first
            .start(Arc::new(Inbox::default()), CancellationToken::new())
            .await
            .unwrap();
        let err = second
            .start(Arc::new(Inbox::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
    }
}
