use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::{EnvelopeSender, ReplyWatcher};
use crate::config::BusSettings;
use crate::envelope::{
    default_queue, durable_queue, loopback_uri, replies_queue, Acknowledgement, Envelope, Message,
};
use crate::error::BusError;
use crate::sending::ChannelGraph;
use crate::workers::HandlerPipeline;

/// Overrides for [`ServiceBus::request`] and [`ServiceBus::send_and_wait_with`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub destination: Option<Url>,
    /// Falls back to `BusSettings::reply_timeout_ms`.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to(mut self, destination: Url) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Cheap to clone handle used by application code to send, enqueue and
/// invoke messages.
#[derive(Clone)]
pub struct ServiceBus {
    sender: Arc<EnvelopeSender>,
    replies: Arc<ReplyWatcher>,
    pipeline: Arc<HandlerPipeline>,
    channels: Arc<ChannelGraph>,
    settings: Arc<BusSettings>,
}

impl ServiceBus {
    pub(crate) fn new(
        sender: Arc<EnvelopeSender>,
        replies: Arc<ReplyWatcher>,
        pipeline: Arc<HandlerPipeline>,
        channels: Arc<ChannelGraph>,
        settings: Arc<BusSettings>,
    ) -> Self {
        Self {
            sender,
            replies,
            pipeline,
            channels,
            settings,
        }
    }

    /// Send to every route of the message type.
    pub async fn send<M: Message>(&self, message: M) -> Result<Vec<Uuid>, BusError> {
        self.sender.send(Envelope::for_message(message)).await
    }

    /// Send to one destination, ignoring routing.
    pub async fn send_to<M: Message>(&self, destination: Url, message: M) -> Result<Uuid, BusError> {
        let envelope = Envelope::for_message(message).with_destination(destination);
        let id = envelope.id;
        self.sender.send(envelope).await?;
        Ok(id)
    }

    /// Send after adjusting the envelope, e.g. headers or content type.
    pub async fn send_with<M, F>(&self, message: M, customize: F) -> Result<Vec<Uuid>, BusError>
    where
        M: Message,
        F: FnOnce(&mut Envelope),
    {
        let mut envelope = Envelope::for_message(message);
        customize(&mut envelope);
        self.sender.send(envelope).await
    }

    pub async fn send_envelope(&self, envelope: Envelope) -> Result<Vec<Uuid>, BusError> {
        self.sender.send(envelope).await
    }

    /// Send and wait until the receiver acknowledges successful handling.
    pub async fn send_and_wait<M: Message>(&self, message: M) -> Result<(), BusError> {
        self.send_and_wait_with(message, RequestOptions::default()).await
    }

    pub async fn send_and_wait_to<M: Message>(&self, destination: Url, message: M) -> Result<(), BusError> {
        self.send_and_wait_with(message, RequestOptions::new().to(destination))
            .await
    }

    pub async fn send_and_wait_with<M: Message>(
        &self,
        message: M,
        options: RequestOptions,
    ) -> Result<(), BusError> {
        let mut envelope = Envelope::for_message(message);
        envelope.ack_requested = true;
        envelope.destination = options.destination;

        let watch = self.replies.start_watch(envelope.id);
        self.sender.send(envelope).await?;
        let ack = watch.wait(options.timeout.unwrap_or(self.settings.reply_timeout())).await?;
        debug!(envelope = %ack, "acknowledged");
        ack.decode::<Acknowledgement>()?;
        Ok(())
    }

    /// Send `request` and wait for a reply of type `R`.
    pub async fn request<Q, R>(&self, request: Q, options: RequestOptions) -> Result<R, BusError>
    where
        Q: Message,
        R: Message,
    {
        let mut envelope = Envelope::for_message(request);
        envelope.reply_requested = Some(R::MESSAGE_TYPE.to_string());
        envelope.accepted_content_types = self.sender.router().serializers().content_types().to_vec();
        envelope.destination = options.destination;

        let watch = self.replies.start_watch(envelope.id);
        self.sender.send(envelope).await?;
        let reply = watch.wait(options.timeout.unwrap_or(self.settings.reply_timeout())).await?;
        Ok(reply.decode::<R>()?)
    }

    /// Send now; receivers hold the message until `at`.
    pub async fn delay_send<M: Message>(&self, message: M, at: DateTime<Utc>) -> Result<Vec<Uuid>, BusError> {
        self.sender
            .send(Envelope::for_message(message).with_execution_time(at))
            .await
    }

    pub async fn delay_send_for<M: Message>(&self, message: M, delay: Duration) -> Result<Vec<Uuid>, BusError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| BusError::Configuration(format!("delay out of range: {e}")))?;
        self.delay_send(message, Utc::now() + delay).await
    }

    /// Execute locally through a loopback queue. Message types registered
    /// as durable-local go through the durable queue.
    pub async fn enqueue<M: Message>(&self, message: M) -> Result<Uuid, BusError> {
        let queue = if self.settings.is_durable_local(M::MESSAGE_TYPE) {
            durable_queue()?
        } else {
            default_queue()?
        };
        self.enqueue_to(&queue, message).await
    }

    /// Execute locally through the named loopback queue.
    pub async fn enqueue_to_queue<M: Message>(&self, queue: &str, message: M) -> Result<Uuid, BusError> {
        self.enqueue_to(&loopback_uri(queue)?, message).await
    }

    async fn enqueue_to<M: Message>(&self, queue: &Url, message: M) -> Result<Uuid, BusError> {
        let envelope = Envelope::for_message(message);
        let id = envelope.id;
        self.channels
            .get_or_build(queue)?
            .store_and_forward(envelope)
            .await?;
        Ok(id)
    }

    /// Run the handler right now on the calling task, bypassing every
    /// queue. Handler errors are returned.
    pub async fn invoke<M: Message>(&self, message: M) -> Result<(), BusError> {
        let envelope = Envelope::for_message(message).with_reply_uri(replies_queue()?);
        self.pipeline.invoke_now(envelope).await
    }

    pub fn replies(&self) -> &Arc<ReplyWatcher> {
        &self.replies
    }
}
