//! Content types and payload codecs.
//!
//! Two content types ship with the runtime: JSON via `serde_json` and a
//! compact binary form via `bitcode`'s serde support. The [`SerializerGraph`]
//! decides which of a receiver's accepted content types this node can write.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;

pub const JSON: &str = "application/json";
pub const BITCODE: &str = "binary/bitcode";

/// Serialize `value` in the given content type.
pub fn encode<T: Serialize + ?Sized>(
    value: &T,
    content_type: &str,
) -> Result<Vec<u8>, SerializationError> {
    match content_type {
        JSON => Ok(serde_json::to_vec(value)?),
        BITCODE => Ok(bitcode::serialize(value)?),
        other => Err(SerializationError::UnsupportedContentType(other.to_string())),
    }
}

/// Deserialize `bytes` written in the given content type.
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    content_type: &str,
) -> Result<T, SerializationError> {
    match content_type {
        JSON => Ok(serde_json::from_slice(bytes)?),
        BITCODE => Ok(bitcode::deserialize(bytes)?),
        other => Err(SerializationError::UnsupportedContentType(other.to_string())),
    }
}

/// The set of content types this node can write, in preference order.
#[derive(Debug, Clone)]
pub struct SerializerGraph {
    content_types: Vec<String>,
}

impl Default for SerializerGraph {
    fn default() -> Self {
        Self {
            content_types: vec![JSON.to_string(), BITCODE.to_string()],
        }
    }
}

impl SerializerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the graph to the given content types.
    pub fn with_content_types<I, S>(content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content_types: content_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn can_write(&self, content_type: &str) -> bool {
        self.content_types.iter().any(|c| c == content_type)
    }

    pub fn content_types(&self) -> &[String] {
        &self.content_types
    }

    /// First accepted content type this node can write. An empty accept
    /// list means the receiver takes JSON.
    pub fn choose_content_type(&self, accepted: &[String]) -> Option<String> {
        if accepted.is_empty() {
            return self.can_write(JSON).then(|| JSON.to_string());
        }
        accepted.iter().find(|c| self.can_write(c)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn encode_decode_each_content_type() {
        let sample = Sample {
            name: "widget".into(),
            count: 3,
        };
        for content_type in [JSON, BITCODE] {
            let bytes = encode(&sample, content_type).unwrap();
            let back: Sample = decode(&bytes, content_type).unwrap();
            assert_eq!(back, sample);
        }
    }

    #[test]
    fn unknown_content_type_is_rejected() {
        let err = encode(&1u32, "text/xml").unwrap_err();
        assert!(matches!(err, SerializationError::UnsupportedContentType(ct) if ct == "text/xml"));
    }

    #[test]
    fn chooses_first_writable_accepted_type() {
        let graph = SerializerGraph::default();
        let accepted = vec!["text/xml".to_string(), BITCODE.to_string(), JSON.to_string()];
        assert_eq!(graph.choose_content_type(&accepted).as_deref(), Some(BITCODE));
        assert_eq!(graph.choose_content_type(&[]).as_deref(), Some(JSON));
        assert_eq!(graph.choose_content_type(&["text/xml".to_string()]), None);
    }
}
