//! Envelope model: the unit of work and its addressing.

mod batch;
#[allow(clippy::module_inception)]
mod envelope;
mod message;
mod uri;

pub use batch::{BatchReply, OutgoingMessageBatch, WireBatch, WireEnvelope};
pub use envelope::Envelope;
pub use message::{Acknowledgement, ErasedMessage, Message};
pub use uri::{loopback_uri, UriExt, DEFAULT_QUEUE, DURABLE_QUEUE, LOOPBACK_SCHEME, REPLIES_QUEUE};

pub(crate) use uri::{default_queue, durable_queue, replies_queue};
