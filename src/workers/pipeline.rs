use std::sync::{Arc, OnceLock, Weak};

use chrono::Utc;
use tracing::{debug, error, warn};

use super::error_policy::Continuation;
use super::handlers::HandlerGraph;
use super::MessageCallback;
use crate::bus::ReplyWatcher;
use crate::envelope::{Acknowledgement, Envelope, Message};
use crate::error::BusError;
use crate::sending::OutgoingSender;

/// Runs one envelope through reply matching, its handler and the
/// completion callback.
pub struct HandlerPipeline {
    handlers: HandlerGraph,
    replies: Arc<ReplyWatcher>,
    outgoing: OnceLock<Weak<dyn OutgoingSender>>,
    max_attempts: u32,
}

impl HandlerPipeline {
    pub fn new(handlers: HandlerGraph, replies: Arc<ReplyWatcher>, max_attempts: u32) -> Self {
        Self {
            handlers,
            replies,
            outgoing: OnceLock::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Sender used for replies and acknowledgements. Only the first call
    /// has an effect.
    pub fn attach_sender(&self, sender: Weak<dyn OutgoingSender>) {
        let _ = self.outgoing.set(sender);
    }

    pub fn handlers(&self) -> &HandlerGraph {
        &self.handlers
    }

    pub fn replies(&self) -> &Arc<ReplyWatcher> {
        &self.replies
    }

    pub async fn invoke(&self, mut envelope: Envelope, callback: &dyn MessageCallback) {
        if envelope.is_response() && self.replies.deliver(&envelope) {
            complete(callback, &envelope).await;
            return;
        }

        let message_type = envelope.message_type.clone().unwrap_or_default();
        if message_type == Acknowledgement::MESSAGE_TYPE && !self.handlers.has_handler(&message_type)
        {
            debug!(envelope = %envelope, "acknowledgement arrived after its watch was gone");
            complete(callback, &envelope).await;
            return;
        }

        let now = Utc::now();
        if let Some(at) = envelope.execution_time.filter(|at| *at > now) {
            if let Err(e) = callback.move_to_delayed_until(envelope, at).await {
                error!(error = %e, "failed to park delayed envelope");
            }
            return;
        }

        envelope.attempts += 1;
        match self.handlers.execute(envelope.clone()).await {
            Ok(reply) => {
                if envelope.ack_requested {
                    self.send_outgoing(envelope.acknowledgement()).await;
                }
                if let Some(reply) = reply {
                    self.send_outgoing(reply).await;
                }
                complete(callback, &envelope).await;
            }
            Err(failure) => {
                let policy = self.handlers.policy_for(&message_type);
                let outcome = match policy.decide(&failure, envelope.attempts, self.max_attempts) {
                    Continuation::Requeue => {
                        debug!(
                            envelope = %envelope,
                            attempts = envelope.attempts,
                            error = %failure,
                            "handler failed, requeueing"
                        );
                        callback.requeue(envelope).await
                    }
                    Continuation::RetryLater(delay) => {
                        let at = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        debug!(envelope = %envelope, %at, error = %failure, "handler failed, retrying later");
                        callback.move_to_delayed_until(envelope, at).await
                    }
                    Continuation::MoveToErrors => {
                        warn!(
                            envelope = %envelope,
                            attempts = envelope.attempts,
                            error = %failure,
                            "handler failed permanently, moving to errors"
                        );
                        callback.move_to_errors(&envelope, &failure.to_string()).await
                    }
                };
                if let Err(e) = outcome {
                    error!(error = %e, "completion callback failed");
                }
            }
        }
    }

    /// Execute immediately, bypassing every queue. Handler failures are
    /// returned to the caller.
    pub async fn invoke_now(&self, mut envelope: Envelope) -> Result<(), BusError> {
        envelope.attempts += 1;
        if let Some(reply) = self.handlers.execute(envelope).await? {
            self.send_outgoing(reply).await;
        }
        Ok(())
    }

    async fn send_outgoing(&self, envelope: Envelope) {
        if envelope.destination.is_none() {
            debug!(envelope = %envelope, "reply has no destination, dropping");
            return;
        }
        let Some(sender) = self.outgoing.get().and_then(Weak::upgrade) else {
            warn!(envelope = %envelope, "no outgoing sender attached, dropping reply");
            return;
        };
        if let Err(e) = sender.send_envelope(envelope).await {
            warn!(error = %e, "failed to send reply");
        }
    }
}

async fn complete(callback: &dyn MessageCallback, envelope: &Envelope) {
    if let Err(e) = callback.mark_complete(envelope).await {
        error!(envelope = %envelope, error = %e, "failed to mark envelope complete");
    }
}
