// Decoded application messages — the tagged union the pipeline operates on
//
// Wire plaintext is a kind byte plus a bincode payload so that an unknown
// kind can be classified distinctly from a malformed one.

use serde::{Deserialize, Serialize};

use crate::error::ReceiveError;
use crate::types::Namespace;

/// Wire content kind bytes
pub const KIND_SHARED_CONFIG: u8 = 1;
pub const KIND_VISIBLE: u8 = 2;
pub const KIND_CALL_CONTROL: u8 = 3;
pub const KIND_DATA_EXTRACTION: u8 = 4;
pub const KIND_TYPING: u8 = 5;
pub const KIND_RECEIPT: u8 = 6;
pub const KIND_UNSEND: u8 = 7;

/// Plaintext as recovered by decryption: a kind byte and a payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReceiveError> {
        bincode::deserialize(data).map_err(|e| ReceiveError::InvalidMessage(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ReceiveError> {
        bincode::serialize(self).map_err(|e| ReceiveError::InvalidMessage(e.to_string()))
    }

    /// Parse the payload into typed content. Unknown kinds are classified
    /// separately from unparseable payloads.
    pub fn parse(&self) -> Result<DecodedContent, ReceiveError> {
        fn de<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, ReceiveError> {
            bincode::deserialize(bytes).map_err(|e| ReceiveError::InvalidMessage(e.to_string()))
        }

        match self.kind {
            KIND_SHARED_CONFIG => Ok(DecodedContent::SharedConfig(de(&self.payload)?)),
            KIND_VISIBLE => Ok(DecodedContent::Visible(de(&self.payload)?)),
            KIND_CALL_CONTROL => Ok(DecodedContent::CallControl(de(&self.payload)?)),
            KIND_DATA_EXTRACTION => Ok(DecodedContent::DataExtraction(de(&self.payload)?)),
            KIND_TYPING => Ok(DecodedContent::TypingIndicator(de(&self.payload)?)),
            KIND_RECEIPT => Ok(DecodedContent::Receipt(de(&self.payload)?)),
            KIND_UNSEND => Ok(DecodedContent::UnsendRequest(de(&self.payload)?)),
            other => Err(ReceiveError::UnknownMessage(other)),
        }
    }
}

/// Convergent conversation/group configuration state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedConfigContent {
    /// Monotonic sequence number; stale config merges are no-ops
    pub seqno: u64,
    /// Opaque config payload applied by the config layer
    pub data: Vec<u8>,
    /// Disappearing-message settings carried by conversation config
    pub expires_in_seconds: Option<u32>,
    pub expiry_mode: ExpiryMode,
    /// Messages at or before this timestamp were deleted via config on
    /// another device and must not rematerialize here
    pub deleted_before_ms: Option<u64>,
}

/// Disappearing-message policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryMode {
    /// Messages do not expire
    None,
    /// Countdown starts when the message is sent
    AfterSend,
    /// Countdown starts when the message is marked read
    AfterRead,
}

/// A user-visible message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleContent {
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub quote: Option<Quote>,
    pub link_preview: Option<LinkPreview>,
    /// Present iff this message is a reaction add/remove rather than content
    pub reaction: Option<ReactionOp>,
    /// Sender profile carried opportunistically on every visible message
    pub profile: Option<ProfileUpdate>,
    /// Per-message disappearing override (None inherits the thread setting)
    pub expires_in_seconds: Option<u32>,
    pub expiry_mode: ExpiryMode,
}

impl VisibleContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            attachments: Vec::new(),
            quote: None,
            link_preview: None,
            reaction: None,
            profile: None,
            expires_in_seconds: None,
            expiry_mode: ExpiryMode::None,
        }
    }
}

/// Remote attachment reference; downloading is a scheduled job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPointer {
    pub remote_id: String,
    pub digest: Vec<u8>,
    pub content_type: String,
    pub size_bytes: u64,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub author_id: String,
    pub timestamp_ms: u64,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    pub title: Option<String>,
}

/// Reaction add/remove targeting an existing interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionOp {
    pub emoji: String,
    pub action: ReactionAction,
    /// The reacted-to message, identified by author + sent timestamp
    pub target_author: String,
    pub target_timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionAction {
    React,
    Remove,
}

/// Sender profile fields propagated regardless of message acceptance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Call signaling control message (the signaling payloads themselves are
/// opaque to this pipeline; only call bookkeeping is persisted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallControlContent {
    pub call_id: String,
    pub kind: CallControlKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallControlKind {
    PreOffer,
    Offer,
    Answer,
    IceCandidates,
    EndCall,
}

/// "Screenshot taken" / "media saved" notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataExtractionContent {
    pub kind: DataExtractionKind,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataExtractionKind {
    Screenshot,
    MediaSaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingContent {
    pub started: bool,
}

/// Delivery/read receipt for previously sent messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptContent {
    pub kind: ReceiptKind,
    /// Sent timestamps of the acknowledged messages
    pub timestamps_ms: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// Author-initiated deletion of a previously sent message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsendContent {
    pub target_author: String,
    pub target_timestamp_ms: u64,
}

/// Typed content of a decoded message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecodedContent {
    SharedConfig(SharedConfigContent),
    Visible(VisibleContent),
    CallControl(CallControlContent),
    DataExtraction(DataExtractionContent),
    TypingIndicator(TypingContent),
    Receipt(ReceiptContent),
    UnsendRequest(UnsendContent),
}

impl DecodedContent {
    /// Config-affecting content is processed before regular content because
    /// regular message semantics depend on config state having converged.
    pub fn is_config(&self) -> bool {
        matches!(self, DecodedContent::SharedConfig(_))
    }
}

/// Which kind of thread a decoded message resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadKind {
    OneToOne,
    ClosedGroup,
    Community,
}

/// A fully decoded, deduplicated application message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    /// Destination thread — exactly one per message, resolved before dispatch
    pub thread_id: String,
    pub thread_kind: ThreadKind,
    /// Authenticated sender identity (blinded id in communities)
    pub sender: String,
    /// Sender-claimed send time (ms since epoch)
    pub timestamp_ms: u64,
    /// Originating server hash, when fetched from a server
    pub server_hash: Option<String>,
    pub namespace: Namespace,
    /// Server-side expiry hint (ms since epoch)
    pub server_expiration_ms: Option<u64>,
    pub content: DecodedContent,
}
