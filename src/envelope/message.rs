use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SerializationError;
use crate::serialization;

/// An application message that can travel in an [`Envelope`](super::Envelope).
///
/// `MESSAGE_TYPE` is the short alias carried on the wire and used for
/// routing and handler lookup; it must be unique per message type.
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct PlaceOrder { order_id: String }
///
/// impl Message for PlaceOrder {
///     const MESSAGE_TYPE: &'static str = "place-order";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// Object-safe view of a [`Message`] held in memory by an envelope.
pub trait ErasedMessage: Debug + Send + Sync {
    fn message_type(&self) -> &'static str;

    fn write(&self, content_type: &str) -> Result<Vec<u8>, SerializationError>;
}

impl<M: Message> ErasedMessage for M {
    fn message_type(&self) -> &'static str {
        M::MESSAGE_TYPE
    }

    fn write(&self, content_type: &str) -> Result<Vec<u8>, SerializationError> {
        serialization::encode(self, content_type)
    }
}

/// Sent back to the reply address when a sender asked for an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub correlation_id: Uuid,
}

impl Message for Acknowledgement {
    const MESSAGE_TYPE: &'static str = "bus-acknowledgement";
}
