use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use super::{receive_frame, socket_address, ListeningAgent, ReceiverCallback, SenderProtocol, Transport};
use crate::config::ListenerSettings;
use crate::envelope::{BatchReply, OutgoingMessageBatch, WireBatch};
use crate::error::BusError;

pub const HTTP_SCHEME: &str = "http";

/// Route every listener serves batches on.
pub const BATCH_PATH: &str = "/_bus/batch";

const OCTET_STREAM: &str = "application/octet-stream";

/// Posts the same bitcode batch frame the socket transport uses.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn protocol(&self) -> &str {
        HTTP_SCHEME
    }

    fn create_sender(&self, uri: &Url) -> Result<Arc<dyn SenderProtocol>, BusError> {
        Ok(Arc::new(HttpSender {
            client: self.client.clone(),
            endpoint: uri.join(BATCH_PATH)?,
        }))
    }

    fn build_listening_agent(
        &self,
        settings: &ListenerSettings,
    ) -> Result<Box<dyn ListeningAgent>, BusError> {
        Ok(Box::new(HttpListeningAgent {
            uri: settings.uri.clone(),
            address: socket_address(&settings.uri)?,
        }))
    }
}

struct HttpSender {
    client: reqwest::Client,
    endpoint: Url,
}

#[async_trait]
impl SenderProtocol for HttpSender {
    async fn send_batch(&self, batch: &OutgoingMessageBatch) -> Result<BatchReply, BusError> {
        let frame = WireBatch::from_batch(batch)?.to_bytes()?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, OCTET_STREAM)
            .body(frame)
            .send()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BusError::Transport(format!(
                "{} answered {}",
                self.endpoint,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(BatchReply::from_bytes(&body)?)
    }
}

#[derive(Clone)]
struct BatchState {
    uri: Url,
    callback: Arc<dyn ReceiverCallback>,
}

struct HttpListeningAgent {
    uri: Url,
    address: String,
}

#[async_trait]
impl ListeningAgent for HttpListeningAgent {
    fn address(&self) -> &Url {
        &self.uri
    }

    async fn start(
        &self,
        callback: Arc<dyn ReceiverCallback>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        let app = Router::new()
            .route(BATCH_PATH, post(accept_batch))
            .with_state(BatchState {
                uri: self.uri.clone(),
                callback,
            });
        info!(listener = %self.uri, "http listener bound");

        let uri = self.uri.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
            if let Err(e) = served {
                warn!(listener = %uri, error = %e, "http listener stopped");
            }
        });
        Ok(())
    }
}

async fn accept_batch(State(state): State<BatchState>, body: Bytes) -> impl IntoResponse {
    let reply = receive_frame(&state.uri, &body, state.callback.as_ref()).await;
    match reply.to_bytes() {
        Ok(encoded) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OCTET_STREAM)],
            encoded,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
