// Transport envelopes — what a snode poll actually returns
//
// A raw received envelope is opaque ciphertext plus server-assigned metadata.
// It is consumed exactly once by the decoder and never persisted as-is.

use serde::{Deserialize, Serialize};

use crate::error::ReceiveError;
use crate::types::Namespace;

/// Envelope type byte on the wire
pub const ENVELOPE_KIND_SESSION: u8 = 1;
pub const ENVELOPE_KIND_CLOSED_GROUP: u8 = 2;

/// A message as fetched from a node, before decryption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReceivedEnvelope {
    /// Serialized [`Envelope`] bytes
    pub data: Vec<u8>,
    /// Server-assigned hash, the dedup and pagination key
    pub server_hash: String,
    /// Which namespace the message was stored under
    pub namespace: Namespace,
    /// When the server will expire the stored copy (ms since epoch)
    pub server_expiration_ms: Option<u64>,
    /// Server receive time (ms since epoch)
    pub server_timestamp_ms: u64,
}

/// The outer, unencrypted wrapper around a ciphertext payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw envelope type byte; see [`Envelope::classify`]
    pub kind: u8,
    /// Sender-claimed send time (ms since epoch)
    pub timestamp_ms: u64,
    /// Ciphertext; sender identity is recovered during decryption
    pub ciphertext: Vec<u8>,
}

/// Classified envelope type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// 1:1 or community message sealed to a single recipient context
    SessionMessage,
    /// Message encrypted with a closed group's shared key
    ClosedGroupMessage,
}

impl Envelope {
    /// Parse envelope bytes. A malformed buffer is permanently unreadable.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReceiveError> {
        bincode::deserialize(data).map_err(|e| ReceiveError::InvalidMessage(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ReceiveError> {
        bincode::serialize(self).map_err(|e| ReceiveError::InvalidMessage(e.to_string()))
    }

    /// Step one of decoding: unknown envelope types fail fast and are not
    /// worth retrying.
    pub fn classify(&self) -> Result<EnvelopeKind, ReceiveError> {
        match self.kind {
            ENVELOPE_KIND_SESSION => Ok(EnvelopeKind::SessionMessage),
            ENVELOPE_KIND_CLOSED_GROUP => Ok(EnvelopeKind::ClosedGroupMessage),
            other => Err(ReceiveError::UnknownEnvelopeType(other)),
        }
    }
}

/// One namespace's slice of a poll response
#[derive(Debug, Clone)]
pub struct NamespaceResult {
    pub namespace: Namespace,
    /// Messages in server order
    pub messages: Vec<RawReceivedEnvelope>,
    /// The server's pagination cursor after this batch
    pub last_hash: Option<String>,
}

/// Everything one poll round-trip returned
#[derive(Debug, Clone, Default)]
pub struct SnodePollResponse {
    pub results: Vec<NamespaceResult>,
}

impl SnodePollResponse {
    pub fn message_count(&self) -> usize {
        self.results.iter().map(|r| r.messages.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            kind: ENVELOPE_KIND_SESSION,
            timestamp_ms: 1_700_000_000_000,
            ciphertext: vec![1, 2, 3],
        };
        let bytes = envelope.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.timestamp_ms, envelope.timestamp_ms);
        assert_eq!(parsed.classify().unwrap(), EnvelopeKind::SessionMessage);
    }

    #[test]
    fn test_unknown_envelope_kind() {
        let envelope = Envelope {
            kind: 99,
            timestamp_ms: 0,
            ciphertext: Vec::new(),
        };
        assert_eq!(
            envelope.classify(),
            Err(ReceiveError::UnknownEnvelopeType(99))
        );
    }

    #[test]
    fn test_garbage_bytes_are_invalid() {
        let result = Envelope::from_bytes(&[0xFF; 3]);
        assert!(matches!(result, Err(ReceiveError::InvalidMessage(_))));
    }
}
