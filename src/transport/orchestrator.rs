use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use super::{BatchedSender, Listener, ListeningStatus, SenderSettings, Transport};
use crate::config::ListenerSettings;
use crate::envelope::UriExt;
use crate::error::TransportEndpointError;
use crate::sending::{DurableSendingAgent, LightweightSendingAgent, SendingAgent, SendingContext};
use crate::workers::WorkerRegistry;

/// Runs one [`Transport`]: starts its listeners and builds sending agents
/// for its scheme.
pub struct TransportRuntime {
    transport: Arc<dyn Transport>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    reply_uri: OnceLock<Option<Url>>,
}

impl TransportRuntime {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            listeners: Mutex::new(Vec::new()),
            reply_uri: OnceLock::new(),
        }
    }

    pub fn protocol(&self) -> &str {
        self.transport.protocol()
    }

    /// Start every listener in `settings` that uses this transport's
    /// scheme. A listener that fails is reported and skipped; the others
    /// still start.
    pub async fn start_listening(
        &self,
        settings: &[ListenerSettings],
        workers: &WorkerRegistry,
        cancel: &CancellationToken,
    ) -> Vec<TransportEndpointError> {
        let mine: Vec<ListenerSettings> = settings
            .iter()
            .filter(|s| s.uri.scheme() == self.protocol())
            .cloned()
            .collect();
        let mut errors = Vec::new();

        match self.transport.validate_and_choose_reply_channel(&mine) {
            Ok(reply_uri) => {
                let _ = self.reply_uri.set(reply_uri);
            }
            Err(e) => {
                let _ = self.reply_uri.set(None);
                if let Some(first) = mine.first() {
                    errors.push(TransportEndpointError::new(
                        first.uri.clone(),
                        "invalid listener configuration",
                        e,
                    ));
                }
                return errors;
            }
        }

        for listener_settings in &mine {
            match self.start_listener(listener_settings, workers, cancel).await {
                Ok(listener) => self
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(listener),
                Err(e) => {
                    error!(listener = %e.uri, error = %e.source, "{}", e.message);
                    errors.push(e);
                }
            }
        }
        errors
    }

    async fn start_listener(
        &self,
        settings: &ListenerSettings,
        workers: &WorkerRegistry,
        cancel: &CancellationToken,
    ) -> Result<Arc<Listener>, TransportEndpointError> {
        let agent = self.transport.build_listening_agent(settings).map_err(|e| {
            TransportEndpointError::new(settings.uri.clone(), "could not build listening agent", e)
        })?;
        let queue = workers.add_queue(settings);
        let listener = Arc::new(Listener::new(settings.uri.clone(), queue));
        agent
            .start(listener.clone(), cancel.child_token())
            .await
            .map_err(|e| {
                TransportEndpointError::new(settings.uri.clone(), "could not start listening", e)
            })?;
        info!(
            listener = %settings.uri,
            durable = settings.is_durable(),
            parallelism = settings.parallelism(),
            "listening"
        );
        Ok(listener)
    }

    /// Where replies to envelopes sent over this transport should go.
    pub fn reply_uri(&self) -> Option<Url> {
        self.reply_uri.get().cloned().flatten()
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pause (`TooBusy`) or resume (`Accepting`) every listener.
    pub fn set_status(&self, status: ListeningStatus) {
        for listener in self.listeners() {
            listener.set_status(status);
        }
    }

    /// Sending agent for `uri`: durable when the address is marked durable,
    /// lightweight otherwise. The agent's sender is started before it is
    /// returned.
    pub fn build_sending_agent(
        &self,
        uri: &Url,
        context: &SendingContext,
    ) -> Result<Arc<dyn SendingAgent>, TransportEndpointError> {
        let protocol = self.transport.create_sender(uri).map_err(|e| {
            TransportEndpointError::new(uri.clone(), "could not build sender", e)
        })?;
        let sender = Arc::new(BatchedSender::new(
            uri.clone(),
            protocol,
            SenderSettings::from_bus(&context.settings),
            context.cancel.clone(),
        ));
        let reply_uri = self.reply_uri();

        let agent: Arc<dyn SendingAgent> = if uri.is_durable() {
            DurableSendingAgent::start(sender, reply_uri, context)
        } else {
            LightweightSendingAgent::start(sender, reply_uri, context)
        };
        Ok(agent)
    }
}

impl std::fmt::Debug for TransportRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRuntime")
            .field("protocol", &self.protocol())
            .field("reply_uri", &self.reply_uri())
            .finish()
    }
}
