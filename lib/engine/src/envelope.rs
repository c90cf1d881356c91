//! Versioned envelope for queue payloads.
//!
//! Every message put on the transport is wrapped as `{version, payload}` so
//! producers and consumers running different releases can tell whether they
//! understand each other. A consumer rejects versions newer than its own.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned envelope that wraps serialized data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

/// Errors from decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The bytes are not an envelope, or the payload has the wrong shape.
    Malformed { details: String },
    /// The envelope was written by a newer producer.
    UnsupportedVersion { version: u32 },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { details } => write!(f, "malformed envelope: {details}"),
            Self::UnsupportedVersion { version } => write!(
                f,
                "unsupported envelope version {version} (current is {CURRENT_VERSION})"
            ),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed {
            details: e.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct Header {
    version: u32,
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decodes an envelope from JSON bytes.
    ///
    /// The version is checked before the payload is decoded.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or the version is newer
    /// than [`CURRENT_VERSION`].
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let header: Header = serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed {
            details: e.to_string(),
        })?;
        if header.version > CURRENT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                version: header.version,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed {
            details: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::queue_item::QueueItem;
    use conveyor_core::{NodeId, WorkflowId};
    use serde_json::json;

    fn item() -> QueueItem {
        let event = Event::root(WorkflowId::new(), NodeId::new(), "default", "push", json!({}));
        QueueItem::for_event(&event, NodeId::new())
    }

    #[test]
    fn envelope_json_structure() {
        let bytes = Envelope::new(item()).encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["version"], CURRENT_VERSION);
        assert!(json["payload"]["event_id"].is_string());
    }

    #[test]
    fn decode_queue_item() {
        let original = item();
        let bytes = Envelope::new(original.clone()).encode().unwrap();
        let decoded: Envelope<QueueItem> = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.into_payload(), original);
    }

    #[test]
    fn newer_versions_are_rejected() {
        let bytes = serde_json::to_vec(&json!({"version": 99, "payload": {}})).unwrap();
        let result = Envelope::<QueueItem>::decode(&bytes);
        assert_eq!(
            result.unwrap_err(),
            EnvelopeError::UnsupportedVersion { version: 99 }
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let result = Envelope::<QueueItem>::decode(b"not json");
        assert!(matches!(result, Err(EnvelopeError::Malformed { .. })));
    }
}
