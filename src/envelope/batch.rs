//! Batches and the batch wire format.
//!
//! ```text
//!   sender                               listener
//!   ------                               --------
//!   OutgoingMessageBatch
//!     -> WireBatch (bitcode) ---frame--> WireBatch -> Vec<Envelope>
//!                          <--frame---  BatchReply
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::envelope::Envelope;
use crate::error::SerializationError;

/// An ordered group of envelopes for one destination. A batch with no
/// messages is a ping.
#[derive(Debug, Clone)]
pub struct OutgoingMessageBatch {
    pub destination: Url,
    pub messages: Vec<Envelope>,
}

impl OutgoingMessageBatch {
    pub fn new(destination: Url, messages: Vec<Envelope>) -> Self {
        Self {
            destination,
            messages,
        }
    }

    pub fn for_ping(destination: Url) -> Self {
        Self::new(destination, Vec::new())
    }

    pub fn is_ping(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.messages.iter().map(|e| e.id).collect()
    }
}

/// Receiver's verdict on a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchReply {
    Received,
    ProcessFailure,
    TooBusy,
}

impl BatchReply {
    pub fn to_bytes(self) -> Result<Vec<u8>, SerializationError> {
        Ok(bitcode::serialize(&self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(bitcode::deserialize(bytes)?)
    }
}

/// An envelope as it travels between nodes. Ids, addresses and times are
/// carried as plain strings and millisecond timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub id: String,
    pub message_type: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub reply_uri: Option<String>,
    pub correlation_id: Option<String>,
    pub response_id: Option<String>,
    pub reply_requested: Option<String>,
    pub ack_requested: bool,
    pub execution_time_ms: Option<i64>,
    pub attempts: u32,
    pub accepted_content_types: Vec<String>,
    pub sent_at_ms: i64,
    pub headers: Vec<(String, String)>,
}

impl WireEnvelope {
    /// The envelope must already carry its payload bytes.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, SerializationError> {
        let data = envelope
            .data
            .clone()
            .ok_or(SerializationError::MissingData(envelope.id))?;
        Ok(Self {
            id: envelope.id.to_string(),
            message_type: envelope.message_type.clone(),
            content_type: envelope.content_type.clone(),
            data,
            source: envelope.source.clone(),
            destination: envelope.destination.as_ref().map(Url::to_string),
            reply_uri: envelope.reply_uri.as_ref().map(Url::to_string),
            correlation_id: envelope.correlation_id.map(|id| id.to_string()),
            response_id: envelope.response_id.map(|id| id.to_string()),
            reply_requested: envelope.reply_requested.clone(),
            ack_requested: envelope.ack_requested,
            execution_time_ms: envelope.execution_time.map(|t| t.timestamp_millis()),
            attempts: envelope.attempts,
            accepted_content_types: envelope.accepted_content_types.clone(),
            sent_at_ms: envelope.sent_at.timestamp_millis(),
            headers: envelope
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    pub fn into_envelope(self) -> Result<Envelope, SerializationError> {
        Ok(Envelope {
            id: parse_id(&self.id)?,
            message_type: self.message_type,
            content_type: self.content_type,
            data: Some(self.data),
            message: None,
            source: self.source,
            destination: self.destination.as_deref().map(parse_uri).transpose()?,
            reply_uri: self.reply_uri.as_deref().map(parse_uri).transpose()?,
            correlation_id: self.correlation_id.as_deref().map(parse_id).transpose()?,
            response_id: self.response_id.as_deref().map(parse_id).transpose()?,
            reply_requested: self.reply_requested,
            ack_requested: self.ack_requested,
            execution_time: self.execution_time_ms.and_then(DateTime::<Utc>::from_timestamp_millis),
            attempts: self.attempts,
            accepted_content_types: self.accepted_content_types,
            sent_at: DateTime::<Utc>::from_timestamp_millis(self.sent_at_ms).unwrap_or_else(Utc::now),
            headers: self.headers.into_iter().collect::<BTreeMap<_, _>>(),
        })
    }
}

/// A batch as it travels between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBatch {
    pub destination: String,
    pub envelopes: Vec<WireEnvelope>,
}

impl WireBatch {
    pub fn from_batch(batch: &OutgoingMessageBatch) -> Result<Self, SerializationError> {
        Ok(Self {
            destination: batch.destination.to_string(),
            envelopes: batch
                .messages
                .iter()
                .map(WireEnvelope::from_envelope)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(bitcode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(bitcode::deserialize(bytes)?)
    }

    pub fn destination(&self) -> Result<Url, SerializationError> {
        parse_uri(&self.destination)
    }

    pub fn into_envelopes(self) -> Result<Vec<Envelope>, SerializationError> {
        self.envelopes
            .into_iter()
            .map(WireEnvelope::into_envelope)
            .collect()
    }
}

fn parse_id(raw: &str) -> Result<Uuid, SerializationError> {
    Uuid::parse_str(raw).map_err(|_| SerializationError::InvalidAddress(raw.to_string()))
}

fn parse_uri(raw: &str) -> Result<Url, SerializationError> {
    Url::parse(raw).map_err(|_| SerializationError::InvalidAddress(raw.to_string()))
}
