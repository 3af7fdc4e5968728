use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    receive_frame, socket_address, ListeningAgent, ReceiverCallback, SenderProtocol, Transport,
};
use crate::config::ListenerSettings;
use crate::envelope::{BatchReply, OutgoingMessageBatch, WireBatch};
use crate::error::BusError;

pub const TCP_SCHEME: &str = "tcp";

/// Length-delimited batch frames over TCP. Each batch opens its own
/// connection and waits for a one-frame reply.
#[derive(Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> &str {
        TCP_SCHEME
    }

    fn create_sender(&self, uri: &Url) -> Result<Arc<dyn SenderProtocol>, BusError> {
        Ok(Arc::new(TcpSender {
            address: socket_address(uri)?,
        }))
    }

    fn build_listening_agent(
        &self,
        settings: &ListenerSettings,
    ) -> Result<Box<dyn ListeningAgent>, BusError> {
        Ok(Box::new(TcpListeningAgent {
            uri: settings.uri.clone(),
            address: socket_address(&settings.uri)?,
        }))
    }
}

struct TcpSender {
    address: String,
}

#[async_trait]
impl SenderProtocol for TcpSender {
    async fn send_batch(&self, batch: &OutgoingMessageBatch) -> Result<BatchReply, BusError> {
        let frame = WireBatch::from_batch(batch)?.to_bytes()?;
        let stream = TcpStream::connect(&self.address).await?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        framed.send(Bytes::from(frame)).await?;

        match framed.next().await {
            Some(reply) => Ok(BatchReply::from_bytes(&reply?)?),
            None => Err(BusError::Transport(format!(
                "{} closed the connection without answering",
                self.address
            ))),
        }
    }
}

struct TcpListeningAgent {
    uri: Url,
    address: String,
}

#[async_trait]
impl ListeningAgent for TcpListeningAgent {
    fn address(&self) -> &Url {
        &self.uri
    }

    async fn start(
        &self,
        callback: Arc<dyn ReceiverCallback>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let listener = TcpListener::bind(&self.address).await?;
        info!(listener = %self.uri, "tcp listener bound");
        tokio::spawn(accept_loop(listener, self.uri.clone(), callback, cancel));
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    uri: Url,
    callback: Arc<dyn ReceiverCallback>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(listener = %uri, %peer, "connection accepted");
                tokio::spawn(serve_connection(
                    stream,
                    uri.clone(),
                    Arc::clone(&callback),
                    cancel.clone(),
                ));
            }
            Err(e) => warn!(listener = %uri, error = %e, "accept failed"),
        }
    }
    debug!(listener = %uri, "tcp listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    uri: Url,
    callback: Arc<dyn ReceiverCallback>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        let reply = match frame {
            Some(Ok(bytes)) => receive_frame(&uri, &bytes, callback.as_ref()).await,
            Some(Err(e)) => {
                warn!(listener = %uri, error = %e, "bad frame");
                break;
            }
            None => break,
        };
        let encoded = match reply.to_bytes() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(listener = %uri, error = %e, "could not encode reply");
                break;
            }
        };
        if let Err(e) = framed.send(Bytes::from(encoded)).await {
            debug!(listener = %uri, error = %e, "could not answer sender");
            break;
        }
    }
}
