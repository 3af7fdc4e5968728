use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::error_policy::ErrorPolicy;
use crate::envelope::{Envelope, Message};
use crate::error::HandlerError;

/// Outcome of one handler execution: an optional reply envelope.
pub type HandlerResult = Result<Option<Envelope>, HandlerError>;

type BoxedHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Handler registry keyed by message type alias.
///
/// ```ignore
/// let handlers = HandlerGraph::new()
///     .handle(|order: PlaceOrder, _envelope| async move {
///         println!("placing {}", order.order_id);
///         Ok(())
///     })
///     .respond(|query: GetPrice, _envelope| async move {
///         Ok(Price { amount: lookup(&query.sku) })
///     })
///     .policy::<PlaceOrder>(ErrorPolicy::new().requeue_on("deadlock", 10));
/// ```
#[derive(Clone, Default)]
pub struct HandlerGraph {
    handlers: HashMap<String, BoxedHandler>,
    policies: HashMap<String, ErrorPolicy>,
}

impl HandlerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `M`. A later registration for the same type
    /// replaces the earlier one.
    pub fn handle<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: Message,
        F: Fn(M, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |envelope: Envelope| -> BoxFuture<'static, HandlerResult> {
            let handler = Arc::clone(&handler);
            async move {
                let message = envelope.decode::<M>()?;
                (*handler)(message, envelope).await?;
                Ok(None)
            }
            .boxed()
        });
        self.handlers.insert(M::MESSAGE_TYPE.to_string(), boxed);
        self
    }

    /// Register a handler for `M` whose result is sent back to the
    /// envelope's reply address.
    pub fn respond<M, R, F, Fut>(mut self, handler: F) -> Self
    where
        M: Message,
        R: Message,
        F: Fn(M, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |envelope: Envelope| -> BoxFuture<'static, HandlerResult> {
            let handler = Arc::clone(&handler);
            async move {
                let message = envelope.decode::<M>()?;
                let original = envelope.clone();
                let reply = (*handler)(message, envelope).await?;
                Ok(Some(original.reply(reply)))
            }
            .boxed()
        });
        self.handlers.insert(M::MESSAGE_TYPE.to_string(), boxed);
        self
    }

    /// Attach an error policy to the handler for `M`.
    pub fn policy<M: Message>(mut self, policy: ErrorPolicy) -> Self {
        self.policies.insert(M::MESSAGE_TYPE.to_string(), policy);
        self
    }

    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn message_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub(crate) fn policy_for(&self, message_type: &str) -> ErrorPolicy {
        self.policies.get(message_type).cloned().unwrap_or_default()
    }

    /// Run the handler registered for the envelope's message type.
    pub(crate) async fn execute(&self, envelope: Envelope) -> HandlerResult {
        let message_type = envelope.message_type.clone().unwrap_or_default();
        let handler = self
            .handlers
            .get(&message_type)
            .cloned()
            .ok_or(HandlerError::NoHandler(message_type))?;
        (*handler)(envelope).await
    }
}
