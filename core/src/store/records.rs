// Persisted record types and their key encoding
//
// Keys are ASCII with zero-padded numeric components so lexicographic byte
// order matches logical order, which the read-backfill and expiry scans
// depend on.

use serde::{Deserialize, Serialize};

use crate::message::{AttachmentPointer, ExpiryMode, LinkPreview, Quote, ThreadKind};

/// One message/event in a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Local database-assigned id
    pub id: u64,
    pub thread_id: String,
    pub author_id: String,
    pub variant: InteractionVariant,
    pub body: Option<String>,
    /// Sender-claimed sent time (ms since epoch)
    pub timestamp_ms: u64,
    /// Local receive time (ms since epoch)
    pub received_at_ms: u64,
    pub was_read: bool,
    pub expires_in_seconds: Option<u32>,
    /// When the disappearing countdown started, if it has
    pub expires_started_at_ms: Option<u64>,
    /// Hash assigned by the originating server, when fetched from one
    pub server_hash: Option<String>,
    pub quote: Option<Quote>,
    pub link_preview: Option<LinkPreview>,
}

impl Interaction {
    pub fn is_outgoing(&self) -> bool {
        self.variant == InteractionVariant::StandardOutgoing
    }

    /// Absolute expiry deadline, if the countdown has started
    pub fn expires_at_ms(&self) -> Option<u64> {
        match (self.expires_in_seconds, self.expires_started_at_ms) {
            (Some(secs), Some(started)) => Some(started + u64::from(secs) * 1000),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionVariant {
    StandardIncoming,
    StandardOutgoing,
    InfoCall,
    InfoDataExtraction,
    InfoDisappearingUpdate,
    InfoMessageDeleted,
}

impl InteractionVariant {
    /// Tag used inside uniqueness keys
    pub fn tag(&self) -> &'static str {
        match self {
            InteractionVariant::StandardIncoming => "in",
            InteractionVariant::StandardOutgoing => "out",
            InteractionVariant::InfoCall => "call",
            InteractionVariant::InfoDataExtraction => "extract",
            InteractionVariant::InfoDisappearingUpdate => "expiry",
            InteractionVariant::InfoMessageDeleted => "deleted",
        }
    }
}

/// Per-(interaction, recipient) delivery state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientState {
    pub interaction_id: u64,
    pub recipient_id: String,
    pub state: DeliveryState,
    pub read_timestamp_ms: Option<u64>,
    pub failure_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Sending,
    Sent,
    Failed,
}

/// Per-(interaction, author, emoji) reaction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub interaction_id: u64,
    pub author_id: String,
    pub emoji: String,
    pub count: u64,
    /// Monotonic within (interaction, emoji); gives stable display order
    pub sort_id: u64,
    pub timestamp_ms: u64,
}

/// A conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    pub kind: ThreadKind,
    /// Watermark: everything at or before this sent-timestamp has been read
    pub last_read_timestamp_ms: u64,
    /// Disappearing-message settings from conversation config
    pub expires_in_seconds: Option<u32>,
    pub expiry_mode: ExpiryMode,
    /// Sent-timestamp of the newest message, for poll-interval scaling
    pub last_message_timestamp_ms: Option<u64>,
}

impl ThreadRecord {
    pub fn new(id: impl Into<String>, kind: ThreadKind) -> Self {
        Self {
            id: id.into(),
            kind,
            last_read_timestamp_ms: 0,
            expires_in_seconds: None,
            expiry_mode: ExpiryMode::None,
            last_message_timestamp_ms: None,
        }
    }
}

/// Known sender profile, updated opportunistically on receive
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_blocked: bool,
    /// Untrusted 1:1 senders get download-on-demand attachments
    pub is_trusted: bool,
}

/// Latest applied shared-config state per thread
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub thread_id: String,
    pub seqno: u64,
    pub timestamp_ms: u64,
    /// Messages at or before this timestamp were deleted via config
    pub deleted_before_ms: Option<u64>,
}

/// Stored attachment metadata; bytes arrive via a download job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub interaction_id: u64,
    pub pointer: AttachmentPointer,
    pub download_queued: bool,
}

// Key encoding ---------------------------------------------------------------

pub(crate) fn interaction_key(id: u64) -> Vec<u8> {
    format!("interaction/{:020}", id).into_bytes()
}

pub(crate) fn interaction_hash_key(server_hash: &str) -> Vec<u8> {
    format!("interaction_hash/{}", server_hash).into_bytes()
}

/// Uniqueness index for outgoing sends round-tripping back from the swarm
pub(crate) fn interaction_uniq_key(
    thread_id: &str,
    author_id: &str,
    timestamp_ms: u64,
    variant_tag: &str,
) -> Vec<u8> {
    format!(
        "interaction_uniq/{}/{}/{:020}/{}",
        thread_id, author_id, timestamp_ms, variant_tag
    )
    .into_bytes()
}

/// Secondary index: thread + sent-timestamp ordered scan
pub(crate) fn thread_message_key(thread_id: &str, timestamp_ms: u64, id: u64) -> Vec<u8> {
    format!("thread_msgs/{}/{:020}/{:020}", thread_id, timestamp_ms, id).into_bytes()
}

pub(crate) fn thread_message_prefix(thread_id: &str) -> Vec<u8> {
    format!("thread_msgs/{}/", thread_id).into_bytes()
}

/// Secondary index: (thread, timestamp, author) lookup for reactions/unsends
pub(crate) fn interaction_tsa_key(thread_id: &str, timestamp_ms: u64, author_id: &str) -> Vec<u8> {
    format!("interaction_tsa/{}/{:020}/{}", thread_id, timestamp_ms, author_id).into_bytes()
}

pub(crate) fn reaction_key(interaction_id: u64, emoji: &str, author_id: &str) -> Vec<u8> {
    format!("reaction/{:020}/{}/{}", interaction_id, emoji, author_id).into_bytes()
}

pub(crate) fn reaction_prefix(interaction_id: u64) -> Vec<u8> {
    format!("reaction/{:020}/", interaction_id).into_bytes()
}

pub(crate) fn reaction_seq_key(interaction_id: u64, emoji: &str) -> Vec<u8> {
    format!("reaction_seq/{:020}/{}", interaction_id, emoji).into_bytes()
}

pub(crate) fn recipient_key(interaction_id: u64, recipient_id: &str) -> Vec<u8> {
    format!("recipient/{:020}/{}", interaction_id, recipient_id).into_bytes()
}

pub(crate) fn thread_key(thread_id: &str) -> Vec<u8> {
    format!("thread/{}", thread_id).into_bytes()
}

pub(crate) fn profile_key(id: &str) -> Vec<u8> {
    format!("profile/{}", id).into_bytes()
}

pub(crate) fn config_key(thread_id: &str) -> Vec<u8> {
    format!("config/{}", thread_id).into_bytes()
}

pub(crate) fn seen_hash_key(hash: &str) -> Vec<u8> {
    format!("seen_hash/{}", hash).into_bytes()
}

pub(crate) fn last_hash_key(target_id: &str, namespace_tag: &str) -> Vec<u8> {
    format!("last_hash/{}/{}", target_id, namespace_tag).into_bytes()
}

pub(crate) fn attachment_key(interaction_id: u64, attachment_id: &str) -> Vec<u8> {
    format!("attachment/{:020}/{}", interaction_id, attachment_id).into_bytes()
}

pub(crate) fn attachment_prefix(interaction_id: u64) -> Vec<u8> {
    format!("attachment/{:020}/", interaction_id).into_bytes()
}

pub(crate) const INTERACTION_ID_SEQ_KEY: &[u8] = b"seq/interaction_id";
