//! Transports: moving batches of envelopes between nodes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Transport (one per scheme: memory, tcp, http)                │
//! │  create_sender(uri)          -> SenderProtocol               │
//! │  build_listening_agent(uri)  -> ListeningAgent               │
//! └──────────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌──────────────────────┐          ┌───────────────────────────┐
//! │ BatchedSender        │  frame   │ ListeningAgent            │
//! │ serialize ─► batch ─►│ ───────► │  ─► Listener              │
//! │ transmit (1 in flight)│ ◄─────── │     (ReceiverCallback)    │
//! │ ─► SenderCallback    │ BatchReply│     ─► WorkerQueue       │
//! └──────────────────────┘          └───────────────────────────┘
//! ```
//!
//! [`TransportRuntime`] owns one transport's listeners and builds sending
//! agents for its scheme.

mod listener;
mod memory;
mod orchestrator;
mod sender;

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "tcp")]
mod tcp;

pub use listener::{Listener, ListeningStatus};
pub use memory::{MemoryHub, MemoryTransport, MEMORY_SCHEME};
pub use orchestrator::TransportRuntime;
pub use sender::{BatchedSender, SenderSettings};

#[cfg(feature = "http")]
pub use http::{HttpTransport, BATCH_PATH, HTTP_SCHEME};
#[cfg(feature = "tcp")]
pub use tcp::{TcpTransport, TCP_SCHEME};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::config::ListenerSettings;
use crate::envelope::{BatchReply, Envelope, OutgoingMessageBatch, WireBatch};
use crate::error::BusError;

/// Puts one batch on the wire and returns the receiver's verdict.
#[async_trait]
pub trait SenderProtocol: Send + Sync {
    async fn send_batch(&self, batch: &OutgoingMessageBatch) -> Result<BatchReply, BusError>;
}

/// Outcome of every transmitted batch. The whole batch is reported; the
/// sending agent decides what to retry.
#[async_trait]
pub trait SenderCallback: Send + Sync {
    async fn successful(&self, batch: OutgoingMessageBatch);

    async fn timed_out(&self, batch: OutgoingMessageBatch);

    async fn queue_is_full(&self, batch: OutgoingMessageBatch);

    async fn processing_failure(&self, batch: OutgoingMessageBatch, error: BusError);

    /// The batch is held until the sender is unlatched.
    async fn sender_is_latched(&self, batch: &OutgoingMessageBatch);
}

/// Receiving end of a listening agent.
#[async_trait]
pub trait ReceiverCallback: Send + Sync {
    async fn received(&self, destination: &Url, envelopes: Vec<Envelope>) -> BatchReply;
}

/// Accepts batches at one address and hands them to a [`ReceiverCallback`].
#[async_trait]
pub trait ListeningAgent: Send + Sync {
    fn address(&self) -> &Url;

    /// Bind and start accepting. Returns once the address is bound; the
    /// accept loop runs until `cancel` fires.
    async fn start(
        &self,
        callback: Arc<dyn ReceiverCallback>,
        cancel: CancellationToken,
    ) -> Result<(), BusError>;
}

/// A pluggable transport for one uri scheme.
pub trait Transport: Send + Sync {
    fn protocol(&self) -> &str;

    fn create_sender(&self, uri: &Url) -> Result<Arc<dyn SenderProtocol>, BusError>;

    fn build_listening_agent(
        &self,
        settings: &ListenerSettings,
    ) -> Result<Box<dyn ListeningAgent>, BusError>;

    /// Check this transport's listeners and pick the address that replies
    /// should come back to: the listener flagged for replies, otherwise the
    /// first one.
    fn validate_and_choose_reply_channel(
        &self,
        listeners: &[ListenerSettings],
    ) -> Result<Option<Url>, BusError> {
        for settings in listeners {
            if settings.uri.scheme() != self.protocol() {
                return Err(BusError::Configuration(format!(
                    "listener {} does not use the {} scheme",
                    settings.uri,
                    self.protocol()
                )));
            }
        }
        Ok(listeners
            .iter()
            .find(|settings| settings.use_for_replies)
            .or_else(|| listeners.first())
            .map(|settings| settings.uri.clone()))
    }
}

/// Decode a batch frame and hand it to `callback`. Undecodable frames are
/// answered with [`BatchReply::ProcessFailure`].
pub(crate) async fn receive_frame(
    uri: &Url,
    bytes: &[u8],
    callback: &dyn ReceiverCallback,
) -> BatchReply {
    let decoded = WireBatch::from_bytes(bytes).and_then(|batch| {
        let destination = batch.destination()?;
        Ok((destination, batch.into_envelopes()?))
    });
    match decoded {
        Ok((destination, envelopes)) => callback.received(&destination, envelopes).await,
        Err(e) => {
            warn!(listener = %uri, error = %e, "could not decode batch");
            BatchReply::ProcessFailure
        }
    }
}

/// `host:port` for a socket address uri.
pub(crate) fn socket_address(uri: &Url) -> Result<String, BusError> {
    let host = uri
        .host_str()
        .ok_or_else(|| BusError::Configuration(format!("{uri} has no host")))?;
    let port = uri
        .port_or_known_default()
        .ok_or_else(|| BusError::Configuration(format!("{uri} has no port")))?;
    Ok(format!("{host}:{port}"))
}
