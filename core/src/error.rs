// Error taxonomy for the poll and receive pipeline
//
// Receive errors are classified per message: one bad message never aborts a
// batch. Each kind carries two independent signals consumed by the caller —
// whether the message is worth retrying, and whether the server-side
// pagination cursor should still advance past it.

use thiserror::Error;

use crate::store::StoreError;

/// Per-message classification produced by the decoder and reconciler
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("Duplicate message")]
    DuplicateMessage,
    #[error("Duplicate control message")]
    DuplicateControlMessage,
    /// Same envelope hash served by a node other than the one that first
    /// delivered it. Expected under at-least-once swarm delivery.
    #[error("Duplicate message from a different node")]
    DuplicateFromDifferentNode,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Unknown message type {0}")]
    UnknownMessage(u8),
    #[error("Unknown envelope type {0}")]
    UnknownEnvelopeType(u8),
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("No thread for message")]
    NoThread,
    #[error("Message sent by the current user")]
    SelfSend,
    #[error("Sender is blocked")]
    SenderBlocked,
    #[error("Message predates conversation config")]
    OutdatedRelativeToConfig,
    /// A reaction or unsend referenced an interaction that was never received
    #[error("Target object not found")]
    ObjectNotFound,
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ReceiveError {
    /// Whether the message should be re-queued and attempted again.
    /// Decode-time failures are permanent: an undecryptable or malformed
    /// envelope will not become readable on retry. Only storage failures
    /// are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReceiveError::Storage(_))
    }

    /// Whether the last-hash pagination cursor should still move past this
    /// message even though the content is discarded. Without this, an
    /// already-handled duplicate or self-send would be refetched forever.
    pub fn should_update_last_hash(&self) -> bool {
        matches!(
            self,
            ReceiveError::DuplicateMessage
                | ReceiveError::DuplicateControlMessage
                | ReceiveError::DuplicateFromDifferentNode
                | ReceiveError::SelfSend
                | ReceiveError::SenderBlocked
                | ReceiveError::OutdatedRelativeToConfig
        )
    }

    /// Whether this occurrence counts as a valid hash update for node-health
    /// bookkeeping. A different node re-serving a known hash is normal swarm
    /// redundancy; the same node re-serving content past our cursor is not
    /// rewarded as forward progress.
    pub fn had_valid_hash_update(&self) -> bool {
        matches!(self, ReceiveError::DuplicateFromDifferentNode)
    }
}

impl From<StoreError> for ReceiveError {
    fn from(err: StoreError) -> Self {
        ReceiveError::Storage(err.to_string())
    }
}

/// Cycle-level failures. These abort the current poll cycle for one target
/// only; the target's policy decides whether to keep polling.
#[derive(Debug, Error, Clone)]
pub enum PollError {
    #[error("Insufficient swarm nodes (have {have}, need {need})")]
    InsufficientNodes { have: usize, need: usize },
    #[error("Request failed: {0}")]
    HttpRequestFailed(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl PollError {
    /// Transport-level failures implicate the polled node; the scheduler
    /// drops the pin and reports the node to the swarm layer.
    pub fn implicates_node(&self) -> bool {
        matches!(self, PollError::HttpRequestFailed(_) | PollError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advance_flags() {
        assert!(ReceiveError::DuplicateMessage.should_update_last_hash());
        assert!(ReceiveError::SelfSend.should_update_last_hash());
        assert!(ReceiveError::OutdatedRelativeToConfig.should_update_last_hash());
        assert!(!ReceiveError::DecryptionFailed.should_update_last_hash());
        assert!(!ReceiveError::InvalidMessage("bad".into()).should_update_last_hash());
        assert!(!ReceiveError::NoThread.should_update_last_hash());
    }

    #[test]
    fn test_only_new_node_duplicates_count_as_valid_hash_update() {
        assert!(ReceiveError::DuplicateFromDifferentNode.had_valid_hash_update());
        assert!(!ReceiveError::DuplicateMessage.had_valid_hash_update());
        assert!(!ReceiveError::DuplicateControlMessage.had_valid_hash_update());
    }

    #[test]
    fn test_only_storage_errors_are_retryable() {
        assert!(ReceiveError::Storage("io".into()).is_retryable());
        assert!(!ReceiveError::DecryptionFailed.is_retryable());
        assert!(!ReceiveError::UnknownEnvelopeType(9).is_retryable());
    }

    #[test]
    fn test_node_implication() {
        assert!(PollError::Timeout.implicates_node());
        assert!(!PollError::InsufficientNodes { have: 0, need: 1 }.implicates_node());
    }
}
