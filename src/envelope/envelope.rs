use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

use super::message::{Acknowledgement, ErasedMessage, Message};
use super::uri::UriExt;
use crate::error::SerializationError;
use crate::serialization::{self, JSON};

/// The unit of transmission: a message payload plus routing and delivery
/// metadata.
///
/// `id` is minted once and survives every retry, requeue and recovery of
/// the same delivery. Payload bytes are written at most once by
/// [`ensure_data`](Envelope::ensure_data).
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub message_type: Option<String>,
    pub content_type: Option<String>,
    pub data: Option<Vec<u8>>,
    /// Materialized message, never persisted or sent.
    pub message: Option<Arc<dyn ErasedMessage>>,
    /// Name of the sending service.
    pub source: Option<String>,
    pub destination: Option<Url>,
    pub reply_uri: Option<Url>,
    /// Conversation id shared by every envelope caused by the same origin.
    pub correlation_id: Option<Uuid>,
    /// Id of the envelope this one answers.
    pub response_id: Option<Uuid>,
    /// Message type the sender is waiting for as a reply.
    pub reply_requested: Option<String>,
    pub ack_requested: bool,
    /// `None` means execute immediately.
    pub execution_time: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub accepted_content_types: Vec<String>,
    pub sent_at: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: None,
            content_type: None,
            data: None,
            message: None,
            source: None,
            destination: None,
            reply_uri: None,
            correlation_id: None,
            response_id: None,
            reply_requested: None,
            ack_requested: false,
            execution_time: None,
            attempts: 0,
            accepted_content_types: Vec::new(),
            sent_at: Utc::now(),
            headers: BTreeMap::new(),
        }
    }
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a message; bytes are written later by the sending pipeline.
    pub fn for_message<M: Message>(message: M) -> Self {
        Self {
            message_type: Some(M::MESSAGE_TYPE.to_string()),
            message: Some(Arc::new(message)),
            ..Self::default()
        }
    }

    /// Build an envelope from already serialized bytes.
    pub fn from_data(
        message_type: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            message_type: Some(message_type.into()),
            content_type: Some(content_type.into()),
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn with_destination(mut self, destination: Url) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_reply_uri(mut self, reply_uri: Url) -> Self {
        self.reply_uri = Some(reply_uri);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_execution_time(mut self, at: DateTime<Utc>) -> Self {
        self.execution_time = Some(at);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Write payload bytes if they are not there yet. Existing bytes are
    /// never replaced.
    pub fn ensure_data(&mut self) -> Result<&[u8], SerializationError> {
        if self.data.is_none() {
            let message = self
                .message
                .as_ref()
                .ok_or(SerializationError::MissingData(self.id))?;
            let content_type = self
                .content_type
                .get_or_insert_with(|| JSON.to_string())
                .clone();
            self.data = Some(message.write(&content_type)?);
        }
        self.data
            .as_deref()
            .ok_or(SerializationError::MissingData(self.id))
    }

    /// Read the payload as `M`.
    pub fn decode<M: Message>(&self) -> Result<M, SerializationError> {
        if let Some(actual) = &self.message_type {
            if actual != M::MESSAGE_TYPE {
                return Err(SerializationError::MessageTypeMismatch {
                    expected: M::MESSAGE_TYPE.to_string(),
                    actual: actual.clone(),
                });
            }
        }
        let content_type = self.content_type.as_deref().unwrap_or(JSON);
        match (&self.data, &self.message) {
            (Some(bytes), _) => serialization::decode(bytes, content_type),
            (None, Some(message)) => {
                let bytes = message.write(JSON)?;
                serialization::decode(&bytes, JSON)
            }
            (None, None) => Err(SerializationError::MissingData(self.id)),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.destination.as_ref().is_some_and(|d| d.is_durable())
    }

    /// True when the envelope must wait until a future execution time.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.execution_time.is_some_and(|at| at > now)
    }

    pub fn is_response(&self) -> bool {
        self.response_id.is_some()
    }

    /// Copy for another destination of a fan-out. The copy gets its own id
    /// and drops bytes written for a different content type.
    pub fn copy_for(&self, destination: Url, content_type: &str) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.destination = Some(destination);
        // Serialized-only envelopes keep their bytes and content type.
        if copy.message.is_some() || copy.data.is_none() {
            if copy.content_type.as_deref() != Some(content_type) {
                copy.data = None;
            }
            copy.content_type = Some(content_type.to_string());
        }
        copy
    }

    /// Envelope answering this one with `reply`.
    pub fn reply<M: Message>(&self, reply: M) -> Self {
        let mut envelope = Envelope::for_message(reply);
        envelope.response_id = Some(self.id);
        envelope.correlation_id = Some(self.correlation_id.unwrap_or(self.id));
        envelope.destination = self.reply_uri.clone();
        if let Some(preferred) = self.accepted_content_types.first() {
            envelope.content_type = Some(preferred.clone());
        }
        envelope
    }

    /// Acknowledgement of this envelope, addressed to its reply uri.
    pub fn acknowledgement(&self) -> Self {
        self.reply(Acknowledgement {
            correlation_id: self.id,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope #{} ({})",
            self.id,
            self.message_type.as_deref().unwrap_or("unknown")
        )?;
        if let Some(destination) = &self.destination {
            write!(f, " to {destination}")?;
        }
        if let Some(response_id) = &self.response_id {
            write!(f, " in response to #{response_id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::BITCODE;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PlaceOrder {
        order_id: String,
    }

    impl Message for PlaceOrder {
        const MESSAGE_TYPE: &'static str = "place-order";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Message for OrderPlaced {
        const MESSAGE_TYPE: &'static str = "order-placed";
    }

    fn order() -> PlaceOrder {
        PlaceOrder {
            order_id: "o-1".into(),
        }
    }

    #[test]
    fn ensure_data_writes_once() {
        let mut envelope = Envelope::for_message(order());
        let first = envelope.ensure_data().unwrap().to_vec();
        envelope.message = Some(Arc::new(PlaceOrder {
            order_id: "changed".into(),
        }));
        let second = envelope.ensure_data().unwrap().to_vec();
        assert_eq!(first, second);
        assert_eq!(envelope.content_type.as_deref(), Some(JSON));
    }

    #[test]
    fn ensure_data_uses_chosen_content_type() {
        let mut envelope = Envelope::for_message(order()).with_content_type(BITCODE);
        envelope.ensure_data().unwrap();
        assert_eq!(envelope.decode::<PlaceOrder>().unwrap(), order());
    }

    #[test]
    fn decode_in_memory_message() {
        let envelope = Envelope::for_message(order());
        assert_eq!(envelope.decode::<PlaceOrder>().unwrap(), order());
    }

    #[test]
    fn decode_rejects_other_message_type() {
        let envelope = Envelope::for_message(order());
        let err = envelope.decode::<OrderPlaced>().unwrap_err();
        assert!(matches!(err, SerializationError::MessageTypeMismatch { .. }));
    }

    #[test]
    fn missing_payload_is_an_error() {
        let mut envelope = Envelope::new();
        let expected = envelope.id;
        assert!(matches!(
            envelope.ensure_data(),
            Err(SerializationError::MissingData(id)) if id == expected
        ));
    }

    #[test]
    fn reply_points_back_at_original() {
        let original = Envelope::for_message(order())
            .with_reply_uri(Url::parse("tcp://client:2201").unwrap());
        let reply = original.reply(OrderPlaced {
            order_id: "o-1".into(),
        });

        assert_ne!(reply.id, original.id);
        assert_eq!(reply.response_id, Some(original.id));
        assert_eq!(reply.correlation_id, Some(original.id));
        assert_eq!(reply.destination, original.reply_uri);
    }

    #[test]
    fn acknowledgement_carries_original_id() {
        let original = Envelope::for_message(order());
        let ack = original.acknowledgement();
        let body: Acknowledgement = ack.decode().unwrap();
        assert_eq!(body.correlation_id, original.id);
        assert_eq!(ack.response_id, Some(original.id));
    }

    #[test]
    fn fan_out_copy_gets_new_id() {
        let original = Envelope::for_message(order());
        let copy = original.copy_for(Url::parse("tcp://other:2202").unwrap(), BITCODE);
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.content_type.as_deref(), Some(BITCODE));
        assert!(copy.data.is_none());
    }

    #[test]
    fn delayed_only_when_execution_time_in_future() {
        let now = Utc::now();
        let envelope = Envelope::for_message(order());
        assert!(!envelope.is_delayed(now));
        let later = envelope.with_execution_time(now + chrono::Duration::seconds(30));
        assert!(later.is_delayed(now));
        assert!(!later.is_delayed(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn durability_follows_destination() {
        let envelope = Envelope::for_message(order())
            .with_destination(Url::parse("tcp://server:2201/durable").unwrap());
        assert!(envelope.is_durable());
        assert!(!Envelope::for_message(order()).is_durable());
    }
}
